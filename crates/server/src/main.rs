//! HTTP stats server.
//!
//! Serves the observer report as JSON at `GET /stats`, refreshed on every
//! request.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::info;

use redismq::{Observer, ObserverReport, RedisConfig};

struct AppState {
    observer: Mutex<Observer>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    redismq::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = RedisConfig::from_env();
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9999);

    let observer = Observer::new(&cfg)
        .await
        .context("connecting to the datastore")?;
    let state = Arc::new(AppState {
        observer: Mutex::new(observer),
    });

    let app = Router::new()
        .route("/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "stats server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ObserverReport>, (StatusCode, String)> {
    let mut observer = state.observer.lock().await;
    match observer.report().await {
        Ok(report) => Ok(Json(report)),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}
