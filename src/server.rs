use crate::middleware::{client_ip_key, GuardedLimiter, RateGuard};
use crate::rate_limiter::RateLimiter;
use crate::store::ScriptExecutor;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// Demo service: `/` is rate limited per client address, `/health` is not.
pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new<E: ScriptExecutor + 'static>(
        limiter: Arc<RateLimiter<E>>,
        bind_addr: SocketAddr,
    ) -> Result<Self, crate::error::ConfigError> {
        Ok(Self {
            app: create_app(limiter)?,
            bind_addr,
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Server listening on {}", self.bind_addr);

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

pub fn create_app<E: ScriptExecutor + 'static>(
    limiter: Arc<RateLimiter<E>>,
) -> Result<Router, crate::error::ConfigError> {
    let guard = RateGuard::builder()
        .limiter(GuardedLimiter::new(limiter))
        .derive_key(client_ip_key)
        .build()?;

    let protected = guard.protect(Router::new().route("/", get(|| async { "ok" })));

    Ok(protected
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http()))
}

async fn health_check() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
