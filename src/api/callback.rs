use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::types::CallbackOutcome;

/// Shared between the callback handler and the [`CallbackServer`](crate::server::CallbackServer)
/// that owns it.
pub struct CallbackState {
    expected_state: String,
    outcome: Mutex<Option<oneshot::Sender<CallbackOutcome>>>,
    shutdown: CancellationToken,
}

impl CallbackState {
    pub fn new(
        expected_state: String,
        outcome: oneshot::Sender<CallbackOutcome>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            expected_state,
            outcome: Mutex::new(Some(outcome)),
            shutdown,
        }
    }

    /// Hands `outcome` to the waiting login and stops the listener.
    ///
    /// Fails if an outcome was already delivered or nobody is waiting
    /// anymore.
    fn deliver(&self, outcome: CallbackOutcome) -> Result<(), CallbackOutcome> {
        let sender = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let result = match sender {
            Some(sender) => sender.send(outcome),
            None => Err(outcome),
        };
        self.shutdown.cancel();
        result
    }
}

/// Handles the authorization server's redirect.
///
/// Requests that cannot belong to this login attempt (missing or wrong
/// `state`) are answered with 400 and otherwise ignored, so a stray request
/// cannot abort a legitimate attempt. Only a request with the right `state`
/// and either a `code` or an `error` ends the attempt.
pub async fn callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<&'static str>) {
    if params.get("state") != Some(&state.expected_state) {
        log::debug!("rejecting callback with missing or mismatched state");
        return (
            StatusCode::BAD_REQUEST,
            Html("<h4>Invalid login request.</h4>"),
        );
    }

    if let Some(reason) = params.get("error") {
        log::debug!("authorization denied: {reason}");
        // the attempt ends either way; a dropped receiver leaves nothing to report to
        let _ = state.deliver(CallbackOutcome::Denied(reason.clone()));
        return (
            StatusCode::BAD_REQUEST,
            Html("<h4>Login was denied.</h4><p>You can close this window.</p>"),
        );
    }

    let Some(code) = params.get("code") else {
        return (
            StatusCode::BAD_REQUEST,
            Html("<h4>Missing authorization code.</h4>"),
        );
    };

    match state.deliver(CallbackOutcome::Code(code.clone())) {
        Ok(()) => (
            StatusCode::OK,
            Html("<h2>Authentication successful.</h2><p>Close browser window.</p>"),
        ),
        Err(_) => {
            log::warn!("authorization code arrived but the login is no longer waiting");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html("<h4>Login failed.</h4>"),
            )
        }
    }
}

/// Answers every path other than the callback.
pub async fn no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}
