use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidConfig(String),
    InvalidHeader,
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    CorruptedSegment(String),
    ChecksumMismatch { stored: u32, computed: u32 },
    MutexPoisoned,
    LockError(io::Error),
    // The recovery log hit an I/O error; the engine refuses further work.
    EngineFailed(String),
    ShutDown,
    InvalidState(String),
    Serialization(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::InvalidHeader => write!(f, "Invalid segment header"),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::CorruptedSegment(msg) => write!(f, "Corrupted log segment: {}", msg),
            Error::ChecksumMismatch { stored, computed } => write!(
                f,
                "Checksum mismatch: stored = {:#010x}, computed = {:#010x}",
                stored, computed
            ),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::EngineFailed(msg) => write!(f, "Engine failed: {}", msg),
            Error::ShutDown => write!(f, "Engine is shutting down"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::LockError(err) => Some(err),
            Error::Decode(_, err) | Error::Encode(_, err) => Some(err),
            _ => None,
        }
    }
}
