mod chunked_file;
mod config;
mod error;
mod factory;
mod field_cache;
mod random_access;
mod schema;
mod streams;

pub use chunked_file::*;
pub use config::*;
pub use error::*;
pub use factory::*;
pub use field_cache::*;
pub use random_access::*;
pub use schema::{create_schema, FileField, FileType, Permission, ROOT_FILE_ID, ROOT_PARENT_ID};
pub use streams::*;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
