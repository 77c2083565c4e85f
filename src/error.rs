use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::num::TryFromIntError;
use std::sync::PoisonError;

use config::ConfigError;
use tokio::sync::oneshot;

use crate::pagecache::PageId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Internal(String),
    Value(String),
    /// Raw I/O failure from the file system, the kind is kept so that
    /// transient failures can be told apart from hard ones.
    Io { kind: ErrorKind, message: String },
    /// Loading a page from its file failed. The frame is never installed.
    PageFault { page_id: PageId, cause: Box<Error> },
    /// Writing a dirty page back failed. The page stays dirty.
    Flush { page_id: PageId, cause: Box<Error> },
    /// A written page read back different bytes than were written.
    Corruption(String),
    /// Backing files or cursor reads disagree with what was written.
    Verification(String),
    /// Every frame stayed pinned for longer than the eviction timeout.
    NoFreeFrame(String),
    LockTimeout(String),
    FileInUse(String),
    Closed(String),
    OutOfBounds(String),
    Misuse(String),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Error {
        Error::Internal(msg.into())
    }

    pub fn value(msg: impl Into<String>) -> Error {
        Error::Value(msg.into())
    }

    pub fn misuse(msg: impl Into<String>) -> Error {
        Error::Misuse(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Error {
        Error::Closed(msg.into())
    }

    pub fn io(kind: ErrorKind, msg: impl Into<String>) -> Error {
        Error::Io { kind, message: msg.into() }
    }

    pub fn page_fault(page_id: PageId, cause: Error) -> Error {
        Error::PageFault { page_id, cause: Box::new(cause) }
    }

    pub fn flush(page_id: PageId, cause: Error) -> Error {
        Error::Flush { page_id, cause: Box::new(cause) }
    }

    /// Whether repeating the failed operation is safe and may succeed: an
    /// interrupted I/O call, a write that read back wrong bytes (the page is
    /// still dirty), or a wait that ran out of time.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io { kind, .. } => {
                matches!(kind, ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut)
            }
            Error::PageFault { cause, .. } | Error::Flush { cause, .. } => cause.is_transient(),
            Error::Corruption(_) | Error::NoFreeFrame(_) | Error::LockTimeout(_) => true,
            _ => false,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Internal(s)
            | Error::Value(s)
            | Error::Corruption(s)
            | Error::Verification(s)
            | Error::NoFreeFrame(s)
            | Error::LockTimeout(s)
            | Error::FileInUse(s)
            | Error::Closed(s)
            | Error::OutOfBounds(s)
            | Error::Misuse(s) => {
                write!(f, "{}", s)
            }
            Error::Io { kind, message } => write!(f, "io error({:?}): {}", kind, message),
            Error::PageFault { page_id, cause } => {
                write!(f, "page fault of page {} failed: {}", page_id, cause)
            }
            Error::Flush { page_id, cause } => {
                write!(f, "flush of page {} failed: {}", page_id, cause)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io { kind: err.kind(), message: err.to_string() }
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(err: oneshot::error::RecvError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::Value(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() -> Result<()> {
        let interrupted = Error::io(ErrorKind::Interrupted, "interrupted");
        assert!(interrupted.is_transient());
        assert!(Error::page_fault(3, interrupted.clone()).is_transient());

        let hard = Error::io(ErrorKind::Other, "disk on fire");
        assert!(!hard.is_transient());
        assert!(!Error::flush(3, hard).is_transient());
        assert!(!Error::misuse("bad").is_transient());
        Ok(())
    }

    #[test]
    fn test_display() -> Result<()> {
        let err = Error::page_fault(7, Error::io(ErrorKind::Other, "boom"));
        assert_eq!("page fault of page 7 failed: io error(Other): boom", err.to_string());
        Ok(())
    }
}
