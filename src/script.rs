//! The atomic sliding-window script and its argument/reply contract.

use crate::error::{Result, ThrottlerError};
use crate::response::RateLimitResponse;

/// Lua script executed atomically by the store.
///
/// `KEYS[1]` is the rate-limit key. `ARGV` is
/// `[window, scale_factor, window_expire_ms, limit, limit_overhead]`.
///
/// Reply: `{allowed (1|0), remaining, first_expire_at_ms, window_expire_at_ms}`.
/// `remaining` goes negative while the overhead allowance is being used.
pub const WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window = tonumber(ARGV[1])
local microsec_factor = tonumber(ARGV[2])
local expire_ms = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])
local limit_overhead = tonumber(ARGV[5])

local now = redis.call('TIME')
local now_microsec = tonumber(now[1]) * 1000000 + tonumber(now[2])
local tick_microsec = math.floor(1 / microsec_factor + 0.5)
local now_ms = math.floor(now_microsec / 1000)
-- Integer division by the tick length keeps the floor exact
local member_score = math.floor(now_microsec / tick_microsec)
local window_expire_at = now_ms + expire_ms

-- Scores are whole ticks: drop everything strictly older than one window
redis.call('ZREMRANGEBYSCORE', key, 0, member_score - window - 1)

local current_count = redis.call('ZCARD', key)
local remaining = limit - current_count
local allowed = (remaining + limit_overhead) > 0

if allowed then
    local member = now[1] .. string.format('%06d', tonumber(now[2])) .. ':' .. current_count
    redis.call('ZADD', key, member_score, member)
    remaining = remaining - 1
end

local first_expire_at = window_expire_at
if current_count > 0 then
    local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    first_expire_at = math.floor(tonumber(first[2]) * tick_microsec / 1000) + expire_ms
end

redis.call('PEXPIRE', key, expire_ms)

if allowed then
    return {1, remaining, first_expire_at, window_expire_at}
end
return {0, remaining, first_expire_at, window_expire_at}
"#;

/// Positional arguments passed to [`WINDOW_SCRIPT`] after the key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptArgs {
    /// Window length in subdivision ticks.
    pub window: u64,
    /// Microsecond to subdivision-tick factor.
    pub scale_factor: f64,
    pub window_expire_ms: u64,
    pub limit: u64,
    pub limit_overhead: u64,
}

impl ScriptArgs {
    /// Length of one subdivision tick in microseconds.
    pub fn tick_micros(&self) -> u64 {
        (1.0 / self.scale_factor).round() as u64
    }

    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.window.to_string(),
            format!("{:e}", self.scale_factor),
            self.window_expire_ms.to_string(),
            self.limit.to_string(),
            self.limit_overhead.to_string(),
        ]
    }

    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        if args.len() != 5 {
            return Err(ThrottlerError::Internal(format!(
                "window script expects 5 arguments, got {}",
                args.len()
            )));
        }

        Ok(Self {
            window: parse_arg(args[0].as_ref(), "window")?,
            scale_factor: parse_arg(args[1].as_ref(), "scale_factor")?,
            window_expire_ms: parse_arg(args[2].as_ref(), "window_expire_ms")?,
            limit: parse_arg(args[3].as_ref(), "limit")?,
            limit_overhead: parse_arg(args[4].as_ref(), "limit_overhead")?,
        })
    }
}

fn parse_arg<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ThrottlerError::Internal(format!("invalid script argument {name}: '{value}'")))
}

/// Raw positional reply of the window script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    pub allowed: bool,
    pub remaining: i64,
    pub first_expire_at_ms: i64,
    pub window_expire_at_ms: i64,
}

impl ScriptReply {
    pub fn from_values(values: &[i64]) -> Result<Self> {
        match *values {
            [allowed, remaining, first_expire_at_ms, window_expire_at_ms] => {
                let allowed = match allowed {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(ThrottlerError::UnexpectedReply(format!(
                            "allowed flag must be 0 or 1, got {other}"
                        )))
                    }
                };
                Ok(Self {
                    allowed,
                    remaining,
                    first_expire_at_ms,
                    window_expire_at_ms,
                })
            }
            _ => Err(ThrottlerError::UnexpectedReply(format!(
                "expected 4 values, got {values:?}"
            ))),
        }
    }

    pub fn to_values(self) -> Vec<i64> {
        vec![
            i64::from(self.allowed),
            self.remaining,
            self.first_expire_at_ms,
            self.window_expire_at_ms,
        ]
    }

    /// Caller-facing response. `remaining` never goes below zero.
    pub fn into_response(self) -> Result<RateLimitResponse> {
        Ok(RateLimitResponse {
            allowed: self.allowed,
            remaining: self.remaining.max(0) as u64,
            first_expire_at_ms: epoch_ms(self.first_expire_at_ms, "first_expire_at_ms")?,
            window_expire_at_ms: epoch_ms(self.window_expire_at_ms, "window_expire_at_ms")?,
        })
    }
}

fn epoch_ms(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| ThrottlerError::UnexpectedReply(format!("negative {field}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Unit;

    #[test]
    fn test_script_args_to_args_and_back() {
        let args = ScriptArgs {
            window: 600,
            scale_factor: Unit::Month.microsecond_factor(),
            window_expire_ms: 60_000,
            limit: 25,
            limit_overhead: 2,
        };
        let encoded = args.to_args();
        assert_eq!(encoded[0], "600");
        assert_eq!(encoded[3], "25");
        assert_eq!(ScriptArgs::parse(&encoded).unwrap(), args);
        assert_eq!(args.tick_micros(), Unit::Month.millis() * 1000);
    }

    #[test]
    fn test_script_args_rejects_bad_input() {
        assert!(ScriptArgs::parse(&["1", "2"]).is_err());
        assert!(ScriptArgs::parse(&["x", "1e-6", "1000", "10", "0"]).is_err());
    }

    #[test]
    fn test_reply_clamps_negative_remaining() {
        let reply = ScriptReply::from_values(&[1, -1, 1_000, 2_000]).unwrap();
        let response = reply.into_response().unwrap();
        assert!(response.allowed);
        assert_eq!(response.remaining, 0);

        let reply = ScriptReply::from_values(&[0, -3, 1_000, 2_000]).unwrap();
        let response = reply.into_response().unwrap();
        assert!(!response.allowed);
        assert_eq!(response.remaining, 0);
        assert_eq!(response.first_expire_at_ms, 1_000);
        assert_eq!(response.window_expire_at_ms, 2_000);
    }

    #[test]
    fn test_reply_rejects_malformed_values() {
        assert!(matches!(
            ScriptReply::from_values(&[1, 2, 3]),
            Err(ThrottlerError::UnexpectedReply(_))
        ));
        assert!(matches!(
            ScriptReply::from_values(&[2, 0, 0, 0]),
            Err(ThrottlerError::UnexpectedReply(_))
        ));
        let reply = ScriptReply::from_values(&[1, 0, -5, 10]).unwrap();
        assert!(reply.into_response().is_err());
    }

    #[test]
    fn test_script_uses_expected_commands() {
        for command in ["TIME", "ZREMRANGEBYSCORE", "ZCARD", "ZADD", "ZRANGE", "PEXPIRE"] {
            assert!(WINDOW_SCRIPT.contains(command), "missing {command}");
        }
    }
}
