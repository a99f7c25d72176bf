use crate::error::{ConfigError, Result};
use crate::response::RateLimitResponse;
use crate::store::ScriptExecutor;
use crate::strategy::ScriptRunner;
use crate::unit::Unit;
use crate::window::WindowConfig;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// Sliding-window rate limiter for one rule.
///
/// The configuration is held as an immutable snapshot. Setters build a new
/// snapshot and swap it in, so an evaluation always sees one consistent
/// configuration even while another task reconfigures the limiter.
pub struct RateLimiter<E> {
    config: RwLock<Arc<WindowConfig>>,
    runner: ScriptRunner<E>,
}

impl<E: ScriptExecutor> RateLimiter<E> {
    pub fn new(executor: E, config: WindowConfig) -> Self {
        info!(limiter = %config.name(), config = %config, "Created rate limiter");
        Self {
            config: RwLock::new(Arc::new(config)),
            runner: ScriptRunner::new(executor),
        }
    }

    /// Record one event for `key` if the quota allows it.
    pub async fn evaluate(&self, key: &str) -> Result<RateLimitResponse> {
        let config = self.config();
        self.runner.execute(key, &config).await
    }

    /// Evaluate `key` against a per-call configuration, leaving the
    /// limiter's own configuration untouched.
    pub async fn evaluate_with(&self, key: &str, config: &WindowConfig) -> Result<RateLimitResponse> {
        self.runner.execute(key, config).await
    }

    /// Load the window script ahead of the first evaluation.
    pub async fn preload(&self) -> Result<String> {
        self.runner.load_script().await
    }

    pub fn executor(&self) -> &E {
        self.runner.executor()
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<WindowConfig> {
        self.config.read().clone()
    }

    /// Replace the configuration with `f(current)`. On error the current
    /// configuration is kept.
    pub fn reconfigure<F>(&self, f: F) -> Result<Arc<WindowConfig>, ConfigError>
    where
        F: FnOnce(&WindowConfig) -> Result<WindowConfig, ConfigError>,
    {
        let mut guard = self.config.write();
        let next = Arc::new(f(&guard)?);
        *guard = next.clone();
        Ok(next)
    }

    pub fn name(&self) -> String {
        self.config.read().name().to_string()
    }

    pub fn limit(&self) -> u64 {
        self.config.read().limit()
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<(), ConfigError> {
        let name = name.into();
        self.reconfigure(|c| c.with_name(name)).map(drop)
    }

    pub fn set_limit(&self, limit: u64) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.with_limit(limit)).map(drop)
    }

    pub fn set_limit_overhead_fraction(&self, fraction: f64) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.with_limit_overhead_fraction(fraction))
            .map(drop)
    }

    pub fn set_window_unit(&self, unit: Unit) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.with_window_unit(unit)).map(drop)
    }

    pub fn set_window_size(&self, size: u64) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.with_window_size(size)).map(drop)
    }

    pub fn set_subdivision_unit(&self, unit: Unit) -> Result<(), ConfigError> {
        self.reconfigure(|c| c.with_subdivision_unit(unit)).map(drop)
    }
}
