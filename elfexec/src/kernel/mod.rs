//! The interfaces to the rest of the operating system that the loader and the
//! core dumper depend on, together with implementations that run in-process.

mod file;
mod fs;
mod memory;
mod mm;

pub use file::{
    ExecFile,
    FileOpener,
    HostOpener,
    MappedElf,
    MemFile,
};
pub use fs::{
    DirHandle,
    Directory,
    File,
    FileHandle,
    FileSystemError,
    Fs,
    PERM_NONE,
    PERM_R,
    PERM_W,
    PERM_X,
};
pub use memory::{
    Mapping,
    MappingKind,
    SimAddressSpace,
};
pub use mm::{
    AddressSpace,
    MapError,
    MapFlags,
};
