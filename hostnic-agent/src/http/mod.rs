use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State as AxumState;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::StatusCode;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;

/// Readiness flips once bootstrap completes; the same signal gates the
/// CNI config file.
#[derive(Clone)]
pub struct State {
    ready: CancellationToken,
}

impl State {
    pub fn new(ready: CancellationToken) -> Self {
        Self { ready }
    }

    fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    fn metrics(&self) -> String {
        let mut buffer = String::new();
        let registry = &*crate::metrics::REGISTRY.read().unwrap();
        match prometheus_client::encoding::text::encode(&mut buffer, registry) {
            Ok(_) => buffer,
            Err(_) => "".into(),
        }
    }
}

pub async fn serve(addr: SocketAddr, ready: CancellationToken, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", addr);

    let app = router(Arc::new(State::new(ready)));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}

fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn metrics(AxumState(state): AxumState<Arc<State>>) -> String {
    state.metrics()
}

async fn readyz(AxumState(state): AxumState<Arc<State>>) -> Readiness {
    state.ready()
}

enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        match self {
            Readiness::Ready => (StatusCode::OK, "Ok").into_response(),
            Readiness::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "NotReady").into_response(),
        }
    }
}
