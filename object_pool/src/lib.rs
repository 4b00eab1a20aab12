mod config;
mod connection;
mod error;
mod managed;
mod pool;
mod registry;

pub use config::*;
pub use connection::*;
pub use error::*;
pub use managed::*;
pub use pool::*;
pub use registry::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod pool_tests;
