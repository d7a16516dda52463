use crate::source::SourceError;
use std::fmt;

#[derive(Debug)]
pub enum SyncError {
    Io(std::io::Error),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    Source(SourceError),
    /// Duplicate `(partition, id)` keys in a batch or in a stored dataset
    Integrity(String),
    /// A postprocessing stage returned no batch
    Postprocessor(String),
    NoValidCollectors(String),
    /// Another synchronization job holds the run lock
    AlreadyRunning { pid: Option<u32> },
    LockTimeout(String),
    Config(String),
    Other(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Io(e) => write!(f, "IO error: {}", e),
            SyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            SyncError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            SyncError::Json(e) => write!(f, "JSON error: {}", e),
            SyncError::Source(e) => write!(f, "Upstream error: {}", e),
            SyncError::Integrity(e) => write!(f, "Integrity error: {}", e),
            SyncError::Postprocessor(name) => {
                write!(f, "Postprocessor error: {} returned no batch", name)
            }
            SyncError::NoValidCollectors(runner) => write!(
                f,
                "No collectors for runner {} were valid. Please don't use this runner or fix the errors.",
                runner
            ),
            SyncError::AlreadyRunning { pid: Some(pid) } => {
                write!(f, "Synchronization is already being run with pid {}", pid)
            }
            SyncError::AlreadyRunning { pid: None } => {
                write!(f, "Synchronization is already being run by another process")
            }
            SyncError::LockTimeout(e) => write!(f, "Lock timeout: {}", e),
            SyncError::Config(e) => write!(f, "Configuration error: {}", e),
            SyncError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl SyncError {
    /// Exit code used by the command line front-ends
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::AlreadyRunning { .. } => 1,
            _ => 2,
        }
    }
}

impl From<bincode::error::EncodeError> for SyncError {
    fn from(err: bincode::error::EncodeError) -> Self {
        SyncError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for SyncError {
    fn from(err: bincode::error::DecodeError) -> Self {
        SyncError::Deserialization(Box::new(err))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json(err)
    }
}

impl From<SourceError> for SyncError {
    fn from(err: SourceError) -> Self {
        SyncError::Source(err)
    }
}

impl From<String> for SyncError {
    fn from(err: String) -> Self {
        SyncError::Other(err)
    }
}

impl From<&str> for SyncError {
    fn from(err: &str) -> Self {
        SyncError::Other(err.to_string())
    }
}
