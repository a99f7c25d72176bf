//! axum middleware enforcing one or more rate limiters per request.
//!
//! ```ignore
//! let guard = RateGuard::builder()
//!     .limiter(GuardedLimiter::new(limiter).key("global"))
//!     .build()?;
//! let app = guard.protect(Router::new().route("/", get(handler)));
//! ```

use crate::error::ConfigError;
use crate::rate_limiter::RateLimiter;
use crate::response::HeaderNames;
use crate::store::ScriptExecutor;
use crate::window::WindowConfig;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Computes the rate-limit key for a request.
pub type KeyFn = Arc<dyn Fn(&Request, &WindowConfig) -> String + Send + Sync>;
/// Computes a per-request limit.
pub type LimitFn = Arc<dyn Fn(&Request, &WindowConfig) -> u64 + Send + Sync>;
/// Computes the response header names for a limiter.
pub type HeaderFn = Arc<dyn Fn(&Request, &WindowConfig) -> HeaderNames + Send + Sync>;

const DEFAULT_ERROR_MESSAGE: &str = "Too many requests";

/// How to answer when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Let the request through.
    Open,
    /// Reject with 503.
    #[default]
    Closed,
}

pub enum KeySource {
    Fixed(String),
    Derived(KeyFn),
}

/// Body sent with a throttled response.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorBody {
    Text(String),
    Json(serde_json::Value),
}

impl ErrorBody {
    fn respond(&self, status: StatusCode) -> Response {
        match self {
            ErrorBody::Text(text) => (status, text.clone()).into_response(),
            ErrorBody::Json(value) => (status, Json(value.clone())).into_response(),
        }
    }
}

impl From<&str> for ErrorBody {
    fn from(text: &str) -> Self {
        ErrorBody::Text(text.to_string())
    }
}

impl From<String> for ErrorBody {
    fn from(text: String) -> Self {
        ErrorBody::Text(text)
    }
}

impl From<serde_json::Value> for ErrorBody {
    fn from(value: serde_json::Value) -> Self {
        ErrorBody::Json(value)
    }
}

/// A limiter together with how the middleware feeds it.
pub struct GuardedLimiter<E> {
    limiter: Arc<RateLimiter<E>>,
    key: Option<KeySource>,
    override_limit: bool,
    limit_fn: Option<LimitFn>,
    error_body: ErrorBody,
}

impl<E> GuardedLimiter<E> {
    pub fn new(limiter: Arc<RateLimiter<E>>) -> Self {
        Self {
            limiter,
            key: None,
            override_limit: false,
            limit_fn: None,
            error_body: ErrorBody::from(DEFAULT_ERROR_MESSAGE),
        }
    }

    /// Use the same key for every request.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(KeySource::Fixed(key.into()));
        self
    }

    /// Derive the key from the request. Takes priority over the guard-wide
    /// key function.
    pub fn derive_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, &WindowConfig) -> String + Send + Sync + 'static,
    {
        self.key = Some(KeySource::Derived(Arc::new(f)));
        self
    }

    /// Enable per-request limits using the guard-wide limit function.
    pub fn override_limit(mut self) -> Self {
        self.override_limit = true;
        self
    }

    /// Enable per-request limits computed by `f`.
    pub fn limit_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, &WindowConfig) -> u64 + Send + Sync + 'static,
    {
        self.override_limit = true;
        self.limit_fn = Some(Arc::new(f));
        self
    }

    /// Body of throttled responses. Strings are sent as text, a
    /// [`serde_json::Value`] as JSON.
    pub fn error_message(mut self, body: impl Into<ErrorBody>) -> Self {
        self.error_body = body.into();
        self
    }
}

/// A limiter with its key and limit sources resolved against the guard.
struct ResolvedLimiter<E> {
    limiter: Arc<RateLimiter<E>>,
    key: KeySource,
    // Set only when the limit is overridden per request.
    limit_fn: Option<LimitFn>,
    error_body: ErrorBody,
}

impl<E: ScriptExecutor> ResolvedLimiter<E> {
    fn key(&self, request: &Request, config: &WindowConfig) -> String {
        match &self.key {
            KeySource::Fixed(key) => key.clone(),
            KeySource::Derived(f) => f(request, config),
        }
    }

    fn config(&self, request: &Request) -> Arc<WindowConfig> {
        let base = self.limiter.config();
        let Some(limit_fn) = self.limit_fn.as_ref() else {
            return base;
        };

        match base.with_limit(limit_fn(request, base.as_ref())) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                warn!(limiter = %base.name(), error = %e, "Ignoring invalid limit override");
                base
            }
        }
    }
}

pub struct RateGuard<E> {
    limiters: Vec<ResolvedLimiter<E>>,
    status: StatusCode,
    set_headers: bool,
    headers: Option<HeaderFn>,
    fail_mode: FailMode,
}

pub struct RateGuardBuilder<E> {
    limiters: Vec<GuardedLimiter<E>>,
    key_fn: Option<KeyFn>,
    limit_fn: Option<LimitFn>,
    status: StatusCode,
    set_headers: bool,
    headers: Option<HeaderFn>,
    fail_mode: FailMode,
}

impl<E> RateGuard<E> {
    pub fn builder() -> RateGuardBuilder<E> {
        RateGuardBuilder {
            limiters: Vec::new(),
            key_fn: None,
            limit_fn: None,
            status: StatusCode::TOO_MANY_REQUESTS,
            set_headers: true,
            headers: None,
            fail_mode: FailMode::default(),
        }
    }
}

impl<E> RateGuardBuilder<E> {
    pub fn limiter(mut self, limiter: GuardedLimiter<E>) -> Self {
        self.limiters.push(limiter);
        self
    }

    /// Key function for limiters without a key of their own.
    pub fn derive_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, &WindowConfig) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Limit function for limiters with `override_limit` and no function of
    /// their own.
    pub fn limit_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, &WindowConfig) -> u64 + Send + Sync + 'static,
    {
        self.limit_fn = Some(Arc::new(f));
        self
    }

    /// Status returned for throttled requests (429 by default).
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn set_headers(mut self, enabled: bool) -> Self {
        self.set_headers = enabled;
        self
    }

    pub fn header_names<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request, &WindowConfig) -> HeaderNames + Send + Sync + 'static,
    {
        self.headers = Some(Arc::new(f));
        self
    }

    pub fn fail_mode(mut self, mode: FailMode) -> Self {
        self.fail_mode = mode;
        self
    }

    pub fn build(self) -> Result<RateGuard<E>, ConfigError> {
        let RateGuardBuilder {
            limiters,
            key_fn,
            limit_fn,
            status,
            set_headers,
            headers,
            fail_mode,
        } = self;

        if limiters.is_empty() {
            return Err(ConfigError::MissingRequiredField("limiters"));
        }

        let limiters = limiters
            .into_iter()
            .map(|entry| -> Result<ResolvedLimiter<E>, ConfigError> {
                let key = match entry.key {
                    Some(key) => key,
                    None => KeySource::Derived(
                        key_fn
                            .clone()
                            .ok_or(ConfigError::MissingRequiredField("key"))?,
                    ),
                };
                let limit_fn = if entry.override_limit {
                    let f = entry
                        .limit_fn
                        .or_else(|| limit_fn.clone())
                        .ok_or(ConfigError::MissingRequiredField("limit_fn"))?;
                    Some(f)
                } else {
                    None
                };
                Ok(ResolvedLimiter {
                    limiter: entry.limiter,
                    key,
                    limit_fn,
                    error_body: entry.error_body,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(RateGuard {
            limiters,
            status,
            set_headers,
            headers,
            fail_mode,
        })
    }
}

impl<E: ScriptExecutor + 'static> RateGuard<E> {
    /// Wrap every route of `router` with this guard.
    pub fn protect(self, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(
            Arc::new(self),
            enforce_rate_limits::<E>,
        ))
    }

    fn header_names(&self, request: &Request, config: &WindowConfig) -> HeaderNames {
        match &self.headers {
            Some(f) => f(request, config),
            None => HeaderNames::for_limiter(config.name()),
        }
    }
}

/// Evaluate every limiter of the guard in order; the first refusal answers
/// the request.
pub async fn enforce_rate_limits<E: ScriptExecutor + 'static>(
    State(guard): State<Arc<RateGuard<E>>>,
    request: Request,
    next: Next,
) -> Response {
    let mut headers = Vec::new();

    for entry in &guard.limiters {
        let config = entry.config(&request);
        let key = entry.key(&request, &config);

        let outcome = match entry.limiter.evaluate_with(&key, &config).await {
            Ok(outcome) => outcome,
            Err(e) => match guard.fail_mode {
                FailMode::Open => {
                    warn!(limiter = %config.name(), key = %key, error = %e, "Rate limiter failed, letting request through");
                    continue;
                }
                FailMode::Closed => {
                    error!(limiter = %config.name(), key = %key, error = %e, "Rate limiter failed, rejecting request");
                    return (StatusCode::SERVICE_UNAVAILABLE, "Rate limiter unavailable").into_response();
                }
            },
        };

        if guard.set_headers {
            let names = guard.header_names(&request, &config);
            headers.extend(outcome.header_values(&names));
        }

        if !outcome.allowed {
            debug!(limiter = %config.name(), key = %key, "Request throttled");
            let mut response = entry.error_body.respond(guard.status);
            apply_headers(&mut response, &headers);
            return response;
        }
    }

    let mut response = next.run(request).await;
    apply_headers(&mut response, &headers);
    response
}

fn apply_headers(response: &mut Response, headers: &[(String, String)]) {
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid rate limit header"),
        }
    }
}

/// Key function using the client address, suitable for [`RateGuardBuilder::derive_key`].
pub fn client_ip_key(request: &Request, config: &WindowConfig) -> String {
    format!("{}:{}", config.name(), client_ip(request))
}

pub fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.to_string();
        }
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        addr.ip().to_string()
    } else {
        "unknown".to_string()
    }
}
