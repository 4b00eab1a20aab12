use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no object available in pool {pool}: {reason}\n{members}")]
    NoObjectAvailable {
        pool: String,
        reason: String,
        members: String,
    },
    #[error("object creation failed: {0}")]
    CreationFailed(String),
    #[error("managed object {0} has been destroyed")]
    ObjectDestroyed(u64),
    #[error("pool stopped: {0}")]
    Stopped(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("io error: {0}")]
    IoError(String),
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;

impl From<rusqlite::Error> for PoolError {
    fn from(err: rusqlite::Error) -> Self {
        PoolError::DbError(err.to_string())
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::IoError(err.to_string())
    }
}
