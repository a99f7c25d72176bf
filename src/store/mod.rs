//! Stores able to run the window script atomically.
//!
//! The limiter only depends on the [`ScriptExecutor`] capability. Which
//! store is used is decided by the executor type the limiter is built with.

pub mod memory;
pub mod redis_store;

use crate::error::Result;
use async_trait::async_trait;

pub use memory::{Clock, ManualClock, MemoryStore, SystemClock, SWEEP_INTERVAL};
pub use redis_store::RedisStore;

/// Atomic script execution against a shared store.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Register `source` with the store and return its id. Loading the same
    /// source twice returns the same id.
    async fn load_script(&self, source: &str) -> Result<String>;

    /// Run a registered script with the given keys and arguments.
    ///
    /// Fails with [`ThrottlerError::UnknownScript`](crate::error::ThrottlerError::UnknownScript)
    /// when the store does not know `sha`.
    async fn eval_sha(&self, sha: &str, keys: &[&str], args: &[String]) -> Result<Vec<i64>>;
}

#[async_trait]
impl<T: ScriptExecutor + ?Sized> ScriptExecutor for std::sync::Arc<T> {
    async fn load_script(&self, source: &str) -> Result<String> {
        (**self).load_script(source).await
    }

    async fn eval_sha(&self, sha: &str, keys: &[&str], args: &[String]) -> Result<Vec<i64>> {
        (**self).eval_sha(sha, keys, args).await
    }
}
