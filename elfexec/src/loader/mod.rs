//! Turns an ELF executable into a process image.
//!
//! The entry point is [`ElfLoader::load`]. It validates the binary, maps its LOAD segments,
//! sets up the break, loads the interpreter named by `PT_INTERP` and builds the initial stack.

mod auxv;
mod exec;
mod image;
mod interp;
mod mapper;
mod stack;
mod validate;

pub use auxv::{
    AuxEntry,
    AuxKey,
    AuxVector,
};
pub use exec::{
    load_path,
    Credentials,
    ElfLoader,
    ElfLoaderBuilder,
    ExecParams,
    ExecParamsBuilder,
    DEFAULT_STACK_SIZE,
};
pub use image::{
    ExecStack,
    ProcessImage,
};
pub use interp::InterpLoad;
pub use stack::{
    max_arg_strlen,
    AuxInfo,
    CopiedStrings,
    StackLayout,
};
pub use validate::{
    check_header,
    validate,
    ValidatedElf,
    BINPRM_BUF_SIZE,
};
