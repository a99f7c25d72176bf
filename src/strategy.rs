//! Runs the window script through a [`ScriptExecutor`], caching its id.

use crate::error::{Result, ThrottlerError};
use crate::response::RateLimitResponse;
use crate::script::{ScriptReply, WINDOW_SCRIPT};
use crate::store::ScriptExecutor;
use crate::window::WindowConfig;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

pub struct ScriptRunner<E> {
    executor: E,
    script_sha: RwLock<Option<String>>,
}

impl<E: ScriptExecutor> ScriptRunner<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            script_sha: RwLock::new(None),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Cached script id, if the script has been loaded.
    pub fn script_sha(&self) -> Option<String> {
        self.script_sha.read().clone()
    }

    /// Load the script unless an id is already cached.
    pub async fn load_script(&self) -> Result<String> {
        if let Some(sha) = self.script_sha() {
            return Ok(sha);
        }
        self.reload_script().await
    }

    async fn reload_script(&self) -> Result<String> {
        let sha = self.executor.load_script(WINDOW_SCRIPT).await?;
        info!(sha = %sha, "Loaded window script");
        *self.script_sha.write() = Some(sha.clone());
        Ok(sha)
    }

    /// Evaluate `key` against `config`.
    ///
    /// An unknown script id triggers one reload and retry. Any other error is
    /// returned as is.
    pub async fn execute(&self, key: &str, config: &WindowConfig) -> Result<RateLimitResponse> {
        let args = config.script_args().to_args();
        let sha = self.load_script().await?;

        let values = match self.executor.eval_sha(&sha, &[key], &args).await {
            Err(ThrottlerError::UnknownScript(_)) => {
                warn!(sha = %sha, "Window script missing on store, reloading");
                let sha = self.reload_script().await?;
                match self.executor.eval_sha(&sha, &[key], &args).await {
                    Err(ThrottlerError::UnknownScript(sha)) => {
                        return Err(ThrottlerError::ScriptUnavailable(sha))
                    }
                    other => other?,
                }
            }
            other => other?,
        };

        let reply = ScriptReply::from_values(&values)?;
        debug!(
            key = %key,
            limiter = %config.name(),
            allowed = reply.allowed,
            remaining = reply.remaining,
            "Evaluated rate limit"
        );
        reply.into_response()
    }
}
