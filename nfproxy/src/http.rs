use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, extract::State};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;

#[derive(Clone)]
struct AppState {
    ready: CancellationToken,
}

pub(crate) async fn serve(
    addr: SocketAddr,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let state = Arc::new(AppState { ready });
    let app = Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("status listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn livez() -> Response {
    (StatusCode::OK, "ok").into_response()
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    if state.ready.is_cancelled() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics() -> Response {
    let mut buffer = String::new();
    let registry = &*crate::metrics::REGISTRY.read().unwrap();
    match prometheus_client::encoding::text::encode(&mut buffer, registry) {
        Ok(_) => (StatusCode::OK, buffer).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "").into_response(),
    }
}
