// Local listener for the return leg of the sign-in redirect

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    Router,
};
use reqwest::Url;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::navigation::{Location, NavigationGuard};

#[derive(Clone)]
struct CallbackState {
    guard: Arc<NavigationGuard>,
    outcome: Arc<Mutex<Option<oneshot::Sender<Location>>>>,
}

/// Serves the redirect URI until the identity provider sends the browser back
pub struct CallbackListener {
    port: u16,
    outcome_rx: oneshot::Receiver<Location>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

/// `host:port` the redirect URI points at
pub fn listen_addr(redirect_uri: &Url) -> Result<String> {
    let host = redirect_uri
        .host_str()
        .context("Redirect URI has no host")?;
    let port = redirect_uri
        .port_or_known_default()
        .context("Redirect URI has no port")?;
    Ok(format!("{}:{}", host, port))
}

impl CallbackListener {
    /// Bind `addr` and start serving
    pub async fn bind(guard: Arc<NavigationGuard>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind callback listener on {}", addr))?;
        let port = listener.local_addr()?.port();

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(guard, outcome_tx).layer(TraceLayer::new_for_http());

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!("Callback listener failed: {}", e);
            }
        });

        tracing::info!("Waiting for the sign-in redirect on {}", addr);
        Ok(Self {
            port,
            outcome_rx,
            shutdown_tx: Some(shutdown_tx),
            server,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the first redirect and return where the guard sent it
    pub async fn wait(&mut self) -> Result<Location> {
        let location = (&mut self.outcome_rx)
            .await
            .context("Callback listener stopped before the redirect arrived")?;
        self.stop();
        Ok(location)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.stop();
        if !self.server.is_finished() {
            tracing::debug!("Callback listener shutting down");
        }
    }
}

fn router(guard: Arc<NavigationGuard>, outcome_tx: oneshot::Sender<Location>) -> Router {
    let state = CallbackState {
        guard,
        outcome: Arc::new(Mutex::new(Some(outcome_tx))),
    };
    Router::new().fallback(handle_redirect).with_state(state)
}

async fn handle_redirect(State(state): State<CallbackState>, uri: Uri) -> Response {
    if !state.guard.routes().is_completion(uri.path()) {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    }

    let Some(outcome_tx) = state.outcome.lock().await.take() else {
        return (StatusCode::CONFLICT, "Sign-in redirect already handled").into_response();
    };

    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let location = state.guard.settle(target).await;

    let signed_in = location.path == state.guard.routes().home();
    let _ = outcome_tx.send(location.clone());

    let message = if signed_in {
        "Signed in. You can close this window."
    } else {
        "Sign-in failed. You can close this window and try again."
    };
    (
        StatusCode::OK,
        Html(format!(
            "<!doctype html><title>session-gate</title><p>{}</p><p>Resolved to <code>{}</code></p>",
            message, location
        )),
    )
        .into_response()
}
