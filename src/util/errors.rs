use std::io;

#[derive(Debug)]
pub enum RaftError {
    StorageError(String),
    InvalidState(String),
    NetworkError(String),
    LogInconsistency,
    IoError(io::Error),
    SerializationError(String),
    InvalidConfig(String),
    /// Journal or dump content that cannot be a crash artifact.
    Corruption(String),
}

impl std::fmt::Display for RaftError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            RaftError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            RaftError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            RaftError::LogInconsistency => write!(f, "Log inconsistency detected"),
            RaftError::IoError(err) => write!(f, "IO error: {}", err),
            RaftError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            RaftError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            RaftError::Corruption(msg) => write!(f, "Corrupted data: {}", msg),
        }
    }
}

impl std::error::Error for RaftError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RaftError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RaftError {
    fn from(err: io::Error) -> Self {
        RaftError::IoError(err)
    }
}

impl From<bincode::Error> for RaftError {
    fn from(err: bincode::Error) -> Self {
        RaftError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = RaftError::InvalidConfig("raft_max_timeout must exceed raft_min_timeout".into());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: raft_max_timeout must exceed raft_min_timeout"
        );
        assert_eq!(RaftError::LogInconsistency.to_string(), "Log inconsistency detected");
    }

    #[test]
    fn test_io_error_keeps_source() {
        let err: RaftError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("IO error"));
    }
}
