use object_pool::PoolError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("io error: {0}")]
    IoError(String),
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl From<rusqlite::Error> for FsError {
    fn from(err: rusqlite::Error) -> Self {
        FsError::Storage(err.to_string())
    }
}

impl From<PoolError> for FsError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::InvalidParam(msg) => FsError::InvalidParam(msg),
            other => FsError::Storage(other.to_string()),
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::IoError(err.to_string())
    }
}

impl From<FsError> for io::Error {
    fn from(err: FsError) -> Self {
        let kind = match &err {
            FsError::NotFound(_) => io::ErrorKind::NotFound,
            FsError::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            FsError::InvalidParam(_) => io::ErrorKind::InvalidInput,
            FsError::NotConnected(_) => io::ErrorKind::NotConnected,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
