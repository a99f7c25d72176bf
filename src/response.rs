use serde::{Deserialize, Serialize};

/// Outcome of one limiter evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResponse {
    pub allowed: bool,
    /// Further events admissible in the current window after this one.
    pub remaining: u64,
    /// Epoch (ms) at which the oldest live entry leaves the window.
    pub first_expire_at_ms: u64,
    /// Epoch (ms) at which the whole key expires.
    pub window_expire_at_ms: u64,
}

impl RateLimitResponse {
    /// Header name/value pairs describing this response.
    pub fn header_values(&self, names: &HeaderNames) -> [(String, String); 3] {
        [
            (names.remaining.clone(), self.remaining.to_string()),
            (names.first_expire_at.clone(), self.first_expire_at_ms.to_string()),
            (names.window_expire_at.clone(), self.window_expire_at_ms.to_string()),
        ]
    }
}

/// Response header names used to expose a limiter's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNames {
    pub remaining: String,
    pub first_expire_at: String,
    pub window_expire_at: String,
}

impl HeaderNames {
    const BASE: &'static str = "X-Rate-Limit";

    /// Default names, suffixed with the limiter name.
    pub fn for_limiter(name: &str) -> Self {
        Self {
            remaining: format!("{}-Remaining-{}", Self::BASE, name),
            first_expire_at: format!("{}-First-Expire-{}", Self::BASE, name),
            window_expire_at: format!("{}-Window-Expire-{}", Self::BASE, name),
        }
    }
}
