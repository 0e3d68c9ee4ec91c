use thiserror::Error;

use crate::kernel::MapError;

/// Signals the loader delivers when it fails after the old image is gone
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Kill,
    Segv,
}

impl Signal {
    pub fn number(&self) -> i32 {
        match self {
            Signal::Kill => libc::SIGKILL,
            Signal::Segv => libc::SIGSEGV,
        }
    }
}

/// Coarse classification of [`LoaderError`]s
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The binary itself is unacceptable. Nothing was changed.
    Format,
    /// An allocation or mapping could not be satisfied
    Resource,
    Io,
    /// An address was outside of the user address space
    Address,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Not an ELF file")]
    NotElf,

    #[error("ELF file of type {0} is not executable")]
    NotExecutable(u16),

    #[error("ELF file is for machine {found} but this loader runs {expected}")]
    WrongArchitecture {
        expected: u16,
        found: u16,
    },

    #[error("Unexpected program header entry size {0}")]
    VersionMismatch(u16),

    #[error("Malformed ELF file: {0}")]
    Malformed(String),

    #[error("Invalid interpreter: {0}")]
    BadInterpreter(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Argument list too long")]
    ArgumentListTooLong,

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Bad address: {0}")]
    AddressError(String),

    #[error("Mapping failed: {0}")]
    MapError(#[from] MapError),

    #[error("Process terminated with {signal:?}: {reason}")]
    Terminated {
        signal: Signal,
        reason: Box<LoaderError>,
    },
}

impl LoaderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoaderError::NotElf
            | LoaderError::NotExecutable(_)
            | LoaderError::WrongArchitecture {
                ..
            }
            | LoaderError::VersionMismatch(_)
            | LoaderError::Malformed(_)
            | LoaderError::BadInterpreter(_)
            | LoaderError::InvalidArgument(_) => ErrorKind::Format,
            LoaderError::ArgumentListTooLong | LoaderError::OutOfMemory(_) | LoaderError::MapError(_) => ErrorKind::Resource,
            LoaderError::IOError(_) => ErrorKind::Io,
            LoaderError::AddressError(_) => ErrorKind::Address,
            LoaderError::Terminated {
                reason,
                ..
            } => reason.kind(),
        }
    }

    /// Whether the error happened after the old process image was discarded
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(self, LoaderError::Terminated { .. })
    }

    pub(crate) fn terminate(self, signal: Signal) -> Self {
        match self {
            LoaderError::Terminated {
                ..
            } => self,
            reason => LoaderError::Terminated {
                signal,
                reason: Box::new(reason),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(LoaderError::NotElf.kind(), ErrorKind::Format);
        assert_eq!(LoaderError::IOError("short read".to_string()).kind(), ErrorKind::Io);

        let err = LoaderError::AddressError("entry".to_string()).terminate(Signal::Segv);
        assert!(err.is_fatal_to_process());
        assert_eq!(err.kind(), ErrorKind::Address);
        assert_eq!(err.clone().terminate(Signal::Kill), err);
        assert_eq!(Signal::Kill.number(), libc::SIGKILL);
    }
}
