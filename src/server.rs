use axum::{Router, routing::get};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{self, CallbackState},
    error::LoginError,
    types::CallbackOutcome,
};

/// One-shot listener for the authorization redirect.
///
/// Serves until the first request with the expected `state` carries a code
/// or an error, until [`stop`](Self::stop) is called, or until it is
/// dropped.
pub struct CallbackServer {
    local_addr: SocketAddr,
    outcome: oneshot::Receiver<CallbackOutcome>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    pub async fn bind(
        addr: SocketAddr,
        path: &str,
        expected_state: String,
    ) -> Result<Self, LoginError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LoginError::ListenerFailedToBind(format!("{addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| LoginError::ListenerFailedToBind(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let state = Arc::new(CallbackState::new(expected_state, tx, shutdown.clone()));

        let app = Router::new()
            .route(path, get(api::callback))
            .fallback(api::no_content)
            .with_state(state);

        let signal = shutdown.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                log::warn!("callback listener failed: {e}");
            }
        });

        log::debug!("callback listener bound to {local_addr}{path}");
        Ok(Self {
            local_addr,
            outcome: rx,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the captured outcome. `None` means the listener went away
    /// without capturing anything.
    pub async fn recv(&mut self) -> Option<CallbackOutcome> {
        (&mut self.outcome).await.ok()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stops the listener and waits until it no longer accepts connections.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
