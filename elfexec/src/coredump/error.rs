use std::io;

use thiserror::Error;

/// Failures of the streaming compressor. These abort the dump.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressError {
    #[error("Deflate failed: {0}")]
    Deflate(String),

    #[error("Deflate returned an unexpected status: {0}")]
    UnexpectedStatus(String),
}

/// Errors that make it impossible to produce a core dump at all
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DumpError {
    #[error("The first register set of the view is not NT_PRSTATUS")]
    MissingPrStatusRegset,

    #[error("The process has no threads")]
    NoThreads,

    #[error("Could not allocate {0} bytes")]
    OutOfMemory(usize),

    #[error("Compression failed: {0}")]
    Compression(#[from] CompressError),
}

/// A failure of the destination of a dump
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Compress(#[from] CompressError),
}
