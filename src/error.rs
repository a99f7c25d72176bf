use thiserror::Error;

use crate::unit::Unit;

/// Errors raised while building or changing a limiter configuration.
///
/// These are never retried; the caller has to fix the configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Missing required field '{0}'")]
    MissingRequiredField(&'static str),

    #[error("Window subdivision ({subdivision}) must be lower or equal to the window unit ({window})")]
    InvalidSubdivision { window: Unit, subdivision: Unit },

    #[error("Limit must be greater than zero")]
    InvalidLimit,

    #[error("Limit overhead fraction must be a finite number greater or equal to zero, got {0}")]
    InvalidOverhead(f64),

    #[error("Window size must be greater than zero")]
    InvalidWindowSize,

    #[error("Window is too large, it must stay below {max_ms}ms")]
    WindowTooLarge { max_ms: u64 },

    #[error("Unknown time unit '{0}'")]
    UnknownUnit(String),
}

/// Runtime errors returned by limiter evaluation.
#[derive(Error, Debug)]
pub enum ThrottlerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The store does not know the script id (evicted or never loaded).
    #[error("Script {0} is not loaded on the store")]
    UnknownScript(String),

    /// The script was reloaded and still reported as unknown.
    #[error("Script {0} is still unknown after reloading it")]
    ScriptUnavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected script reply: {0}")]
    UnexpectedReply(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = ThrottlerError> = std::result::Result<T, E>;
