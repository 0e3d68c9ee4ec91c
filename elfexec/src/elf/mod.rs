//! The ELF structures shared by the loader and the core dumper

mod arch;
pub(crate) mod bytes;
mod error;
mod header;
mod perms;
mod program_header;
mod section_header;

pub use arch::Arch;
pub use bytes::round_up;
pub use error::{
    ErrorKind,
    LoaderError,
    Signal,
};
pub use header::{
    ElfHeader,
    ElfType,
};
pub use perms::Perms;
pub use program_header::{
    total_mapping_size,
    ProgramHeader,
    SegmentType,
};
pub use section_header::{
    SectionHeader,
    PN_XNUM,
};

/// Size of a 64-bit ELF header
pub const EHDR_SIZE: usize = 64;
/// Size of a 64-bit program header
pub const PHDR_SIZE: usize = 56;
/// Size of a 64-bit section header
pub const SHDR_SIZE: usize = 64;
