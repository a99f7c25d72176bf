//! Window configuration for a single rate-limit rule.
//!
//! A [`WindowConfig`] is immutable once built. Changing any parameter goes
//! through one of the `with_*` methods, which validate again and return a
//! new value with every derived field recomputed.

use crate::error::ConfigError;
use crate::script::ScriptArgs;
use crate::unit::Unit;
use serde::Serialize;
use std::fmt;

/// Upper bound (exclusive) for a window length in milliseconds. Redis formats
/// Lua numbers with `%.14g`, so longer windows would reach `PEXPIRE` in
/// exponent form.
pub const MAX_WINDOW_EXPIRE_MS: u64 = 100_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowConfig {
    window_unit: Unit,
    window_size: u64,
    subdivision_unit: Unit,
    limit: u64,
    limit_overhead_fraction: f64,
    name: String,
    #[serde(skip)]
    custom_name: bool,

    // Derived
    window: u64,
    window_expire_ms: u64,
    limit_overhead: u64,
}

/// Builder for [`WindowConfig`]. Window unit, window size and limit are
/// required.
#[derive(Debug, Clone, Default)]
pub struct WindowConfigBuilder {
    window_unit: Option<Unit>,
    window_size: Option<u64>,
    subdivision_unit: Option<Unit>,
    limit: Option<u64>,
    limit_overhead_fraction: Option<f64>,
    name: Option<String>,
}

impl WindowConfigBuilder {
    pub fn window_unit(mut self, unit: Unit) -> Self {
        self.window_unit = Some(unit);
        self
    }

    pub fn window_size(mut self, size: u64) -> Self {
        self.window_size = Some(size);
        self
    }

    /// Granularity at which events expire. Defaults to the window unit.
    pub fn subdivision_unit(mut self, unit: Unit) -> Self {
        self.subdivision_unit = Some(unit);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Fraction of `limit` (rounded down) tolerated above the limit.
    pub fn limit_overhead_fraction(mut self, fraction: f64) -> Self {
        self.limit_overhead_fraction = Some(fraction);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<WindowConfig, ConfigError> {
        let window_unit = self
            .window_unit
            .ok_or(ConfigError::MissingRequiredField("window_unit"))?;
        let window_size = self
            .window_size
            .ok_or(ConfigError::MissingRequiredField("window_size"))?;
        let limit = self.limit.ok_or(ConfigError::MissingRequiredField("limit"))?;
        let subdivision_unit = self.subdivision_unit.unwrap_or(window_unit);
        let limit_overhead_fraction = self.limit_overhead_fraction.unwrap_or(0.0);

        let subdivisions = Unit::subdivisions(window_unit, subdivision_unit).ok_or(
            ConfigError::InvalidSubdivision {
                window: window_unit,
                subdivision: subdivision_unit,
            },
        )?;

        if window_size == 0 {
            return Err(ConfigError::InvalidWindowSize);
        }

        if limit == 0 {
            return Err(ConfigError::InvalidLimit);
        }

        if !limit_overhead_fraction.is_finite() || limit_overhead_fraction < 0.0 {
            return Err(ConfigError::InvalidOverhead(limit_overhead_fraction));
        }

        let too_large = ConfigError::WindowTooLarge {
            max_ms: MAX_WINDOW_EXPIRE_MS,
        };
        let window = subdivisions
            .checked_mul(window_size)
            .ok_or_else(|| too_large.clone())?;
        let window_expire_ms = window_unit
            .millis()
            .checked_mul(window_size)
            .filter(|ms| *ms < MAX_WINDOW_EXPIRE_MS)
            .ok_or(too_large)?;

        let custom_name = self.name.is_some();
        let name = self.name.unwrap_or_else(|| {
            default_name(window_unit, window_size, subdivision_unit)
        });

        Ok(WindowConfig {
            window_unit,
            window_size,
            subdivision_unit,
            limit,
            limit_overhead_fraction,
            name,
            custom_name,
            window,
            window_expire_ms,
            limit_overhead: (limit as f64 * limit_overhead_fraction).floor() as u64,
        })
    }
}

fn default_name(window_unit: Unit, window_size: u64, subdivision_unit: Unit) -> String {
    format!("{}_{}_{}", window_unit, window_size, subdivision_unit)
}

impl WindowConfig {
    pub fn builder() -> WindowConfigBuilder {
        WindowConfigBuilder::default()
    }

    pub fn new(
        window_unit: Unit,
        window_size: u64,
        subdivision_unit: Option<Unit>,
        limit: u64,
        limit_overhead_fraction: Option<f64>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Self::builder()
            .window_unit(window_unit)
            .window_size(window_size)
            .limit(limit);
        if let Some(unit) = subdivision_unit {
            builder = builder.subdivision_unit(unit);
        }
        if let Some(fraction) = limit_overhead_fraction {
            builder = builder.limit_overhead_fraction(fraction);
        }
        builder.build()
    }

    /// Builder pre-filled with this configuration. A name that was derived
    /// from the window parameters is left out so it follows them.
    pub fn to_builder(&self) -> WindowConfigBuilder {
        WindowConfigBuilder {
            window_unit: Some(self.window_unit),
            window_size: Some(self.window_size),
            subdivision_unit: Some(self.subdivision_unit),
            limit: Some(self.limit),
            limit_overhead_fraction: Some(self.limit_overhead_fraction),
            name: self.custom_name.then(|| self.name.clone()),
        }
    }

    pub fn with_window_unit(&self, unit: Unit) -> Result<Self, ConfigError> {
        self.to_builder().window_unit(unit).build()
    }

    pub fn with_window_size(&self, size: u64) -> Result<Self, ConfigError> {
        self.to_builder().window_size(size).build()
    }

    pub fn with_subdivision_unit(&self, unit: Unit) -> Result<Self, ConfigError> {
        self.to_builder().subdivision_unit(unit).build()
    }

    pub fn with_limit(&self, limit: u64) -> Result<Self, ConfigError> {
        self.to_builder().limit(limit).build()
    }

    pub fn with_limit_overhead_fraction(&self, fraction: f64) -> Result<Self, ConfigError> {
        self.to_builder().limit_overhead_fraction(fraction).build()
    }

    pub fn with_name(&self, name: impl Into<String>) -> Result<Self, ConfigError> {
        self.to_builder().name(name).build()
    }

    pub fn window_unit(&self) -> Unit {
        self.window_unit
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    pub fn subdivision_unit(&self) -> Unit {
        self.subdivision_unit
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn limit_overhead_fraction(&self) -> f64 {
        self.limit_overhead_fraction
    }

    /// Extra admissions tolerated above `limit`.
    pub fn limit_overhead(&self) -> u64 {
        self.limit_overhead
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Window length in subdivision ticks.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Window length in milliseconds; also the key TTL.
    pub fn window_expire_ms(&self) -> u64 {
        self.window_expire_ms
    }

    /// Admissions possible in a fresh window.
    pub fn effective_limit(&self) -> u64 {
        self.limit + self.limit_overhead
    }

    pub fn script_args(&self) -> ScriptArgs {
        ScriptArgs {
            window: self.window,
            scale_factor: self.subdivision_unit.microsecond_factor(),
            window_expire_ms: self.window_expire_ms,
            limit: self.limit,
            limit_overhead: self.limit_overhead,
        }
    }
}

impl fmt::Display for WindowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{}", self.name),
        }
    }
}
