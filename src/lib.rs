pub mod config;
pub mod error;
pub mod middleware;
pub mod rate_limiter;
pub mod response;
pub mod script;
pub mod server;
pub mod store;
pub mod strategy;
pub mod unit;
pub mod window;

pub use error::{ConfigError, Result, ThrottlerError};
pub use rate_limiter::RateLimiter;
pub use response::RateLimitResponse;
pub use store::{MemoryStore, RedisStore, ScriptExecutor};
pub use unit::Unit;
pub use window::WindowConfig;
