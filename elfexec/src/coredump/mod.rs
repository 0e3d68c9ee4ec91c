//! Writes ELF core files of processes.
//!
//! [`CoreDumper::dump`] collects the notes of a [`ProcessView`], decides with a [`DumpPolicy`]
//! which regions are stored, lays out the file in a [`CoreDumpLayout`] and streams it into a
//! [`RawSink`] or, with compression, into a [`GzipSink`].

mod collect;
mod compress;
mod dumper;
mod error;
mod files;
mod layout;
mod note;
mod policy;
mod process;
mod regs;
mod structs;
mod writer;

pub use collect::{
    prstatus_size,
    NoteInfo,
    ThreadCoreInfo,
    ELF_PRARGSZ,
    PRPSINFO_SIZE,
    PR_FNAME_SIZE,
};
pub use compress::{
    CompressionSession,
    GzipSink,
    DEFAULT_CHUNK_SIZE,
    DEFAULT_GZIP_NAME,
    STREAM_END_SPACE,
};
pub use dumper::{
    CoreDumper,
    CoreDumperBuilder,
};
pub use error::{
    CompressError,
    DumpError,
    SinkError,
};
pub use files::{
    fill_files_note,
    MAX_FILE_NOTE_SIZE,
};
pub use layout::{
    CoreDumpLayout,
    RegionLayout,
};
pub use note::{
    notesize,
    MemElfNote,
    NHDR_SIZE,
    NOTE_NAME_CORE,
    NOTE_NAME_LINUX,
    NT_AUXV,
    NT_FILE,
    NT_PRFPREG,
    NT_PRPSINFO,
    NT_PRSTATUS,
    NT_PRXFPREG,
    NT_SIGINFO,
};
pub use policy::{
    DumpFilter,
    DumpPolicy,
};
pub use process::{
    CpuTimes,
    MemoryRegion,
    ProcessInfo,
    ProcessView,
    SigInfo,
    SimProcess,
    TaskState,
    ThreadInfo,
    VmFlags,
    SIGINFO_SIZE,
};
pub use regs::{
    FixedRegisterPair,
    GenericRegisterView,
    RegisterView,
    Regset,
};
pub use writer::{
    CoreSink,
    DumpReport,
    DumpStatus,
    RawSink,
    StopReason,
};
