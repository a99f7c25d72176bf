use crate::error::ConfigError;
use crate::unit::Unit;
use crate::window::WindowConfig;
use clap::Parser;
use std::net::SocketAddr;

/// Settings for the demo service, read from flags or the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "window-throttler", version, about)]
pub struct Settings {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; leave empty to keep state in process
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[arg(long, env = "WINDOW_UNIT", default_value = "second")]
    pub window_unit: Unit,

    #[arg(long, env = "WINDOW_SIZE", default_value_t = 1)]
    pub window_size: u64,

    /// Defaults to the window unit
    #[arg(long, env = "WINDOW_SUBDIVISION_UNIT")]
    pub subdivision_unit: Option<Unit>,

    /// Requests allowed per window
    #[arg(long, env = "RATE_LIMIT", default_value_t = 100)]
    pub limit: u64,

    #[arg(long, env = "LIMIT_OVERHEAD_FRACTION", default_value_t = 0.0)]
    pub limit_overhead_fraction: f64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::parse()
    }

    pub fn window_config(&self) -> Result<WindowConfig, ConfigError> {
        WindowConfig::new(
            self.window_unit,
            self.window_size,
            self.subdivision_unit,
            self.limit,
            Some(self.limit_overhead_fraction),
        )
    }

    pub fn uses_redis(&self) -> bool {
        !self.redis_url.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::try_parse_from(["window-throttler"]).unwrap();
        assert_eq!(settings.bind_addr.port(), 3000);
        assert!(settings.uses_redis());
        let config = settings.window_config().unwrap();
        assert_eq!(config.limit(), 100);
        assert_eq!(config.window_unit(), Unit::Second);
    }

    #[test]
    fn test_flags() {
        let settings = Settings::try_parse_from([
            "window-throttler",
            "--window-unit",
            "minute",
            "--window-size",
            "5",
            "--subdivision-unit",
            "s",
            "--limit",
            "30",
            "--limit-overhead-fraction",
            "0.1",
            "--redis-url",
            "",
        ])
        .unwrap();
        assert!(!settings.uses_redis());

        let config = settings.window_config().unwrap();
        assert_eq!(config.window(), 300);
        assert_eq!(config.limit_overhead(), 3);
    }

    #[test]
    fn test_invalid_unit_and_subdivision() {
        assert!(Settings::try_parse_from(["window-throttler", "--window-unit", "eon"]).is_err());

        let settings = Settings::try_parse_from([
            "window-throttler",
            "--window-unit",
            "second",
            "--subdivision-unit",
            "hour",
        ])
        .unwrap();
        assert!(matches!(
            settings.window_config(),
            Err(ConfigError::InvalidSubdivision { .. })
        ));
    }

    #[test]
    fn test_oversized_window_size() {
        let settings = Settings::try_parse_from([
            "window-throttler",
            "--window-unit",
            "year",
            "--window-size",
            "18446744073709551615",
            "--subdivision-unit",
            "ms",
        ])
        .unwrap();
        assert!(matches!(
            settings.window_config(),
            Err(ConfigError::WindowTooLarge { .. })
        ));
    }
}
