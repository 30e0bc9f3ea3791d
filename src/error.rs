//! Error taxonomy for sptcli.
//!
//! Every failure the core can produce is one of the categorized kinds below,
//! never an unstructured panic. The presentation layer renders the kind and
//! any reason string it carries.
//!
//! | Category    | Type                |
//! |-------------|---------------------|
//! | Transport   | [`TransportError`]  |
//! | Credentials | [`CredentialError`] |
//! | Exchange    | [`ExchangeError`]   |
//! | Login       | [`LoginError`]      |
//! | API call    | [`ApiError`]        |
//!
//! All error types are `Clone` so that a settled [`Promise`](crate::promise::Promise)
//! can hand its outcome to more than one consumer.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Standard result type for sptcli operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Login(#[from] LoginError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    /// The error a promise fails with when its work was canceled.
    #[must_use]
    pub fn canceled() -> Self {
        Self::Transport(TransportError::Canceled)
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Canceled))
    }

    /// Returns the denial reason if the token endpoint refused a grant.
    #[must_use]
    pub fn denied_reason(&self) -> Option<&str> {
        match self {
            Self::Exchange(ExchangeError::Denied(reason)) => Some(reason),
            _ => None,
        }
    }
}

/// Failures of a single HTTP round trip.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request was canceled")]
    Canceled,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || has_io_source(&err) {
            return Self::ConnectionFailure(err.to_string());
        }
        if err.is_body() || err.is_decode() || err.is_request() {
            return Self::MalformedResponse(err.to_string());
        }
        Self::ConnectionFailure(err.to_string())
    }
}

/// Walks the source chain looking for an I/O error, which means the socket
/// itself failed rather than the peer speaking something other than HTTP.
fn has_io_source(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.is::<std::io::Error>() {
            return true;
        }
        source = cause.source();
    }
    false
}

/// Credential validation and storage failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential is not a well-formed object")]
    MalformedCredential,

    #[error("credential is missing an access token")]
    MissingAccessToken,

    #[error("credential is missing expiration information")]
    MissingExpirationTime,

    #[error("credential is missing a refresh token")]
    MissingRefreshToken,

    #[error("not logged in")]
    NoCredential,

    #[error("credential storage failed: {0}")]
    Storage(String),
}

impl From<std::io::Error> for CredentialError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Failures reported by the token endpoint.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("token endpoint returned an unparsable response")]
    UnparsableResponse,

    /// See <https://www.rfc-editor.org/rfc/rfc6749#section-5.2> for reasons.
    #[error("token request denied: {0}")]
    Denied(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("failed to open the authorization prompt: {0}")]
    PromptFailedToOpen(String),

    #[error("failed to bind the callback listener: {0}")]
    ListenerFailedToBind(String),

    /// See <https://www.rfc-editor.org/rfc/rfc6749#section-4.1.2.1> for reasons.
    #[error("authorization denied: {0}")]
    CodeDenied(String),

    #[error("login timed out")]
    TimedOut,

    #[error("a login is already in progress")]
    AlreadyInProgress,

    #[error("callback listener closed before a code was received")]
    ListenerClosed,
}

/// Failures of a Web API call after the retry policy gave up.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApiError {
    #[error("bad request")]
    BadRequest(Option<Value>),

    #[error("unauthorized")]
    Unauthorized(Option<Value>),

    #[error("forbidden")]
    Forbidden(Option<Value>),

    #[error("not found")]
    NotFound(Option<Value>),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("server error ({status})")]
    ServerError { status: u16 },

    #[error("unexpected status {status}")]
    UnexpectedStatus { status: u16, body: Option<Value> },

    #[error("bad response: {0}")]
    BadResponse(String),
}

impl ApiError {
    /// The parsed response body carried by client errors, if any.
    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        match self {
            Self::BadRequest(body)
            | Self::Unauthorized(body)
            | Self::Forbidden(body)
            | Self::NotFound(body)
            | Self::UnexpectedStatus { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceled_is_a_transport_error() {
        let err = Error::canceled();
        assert!(err.is_canceled());
        assert!(matches!(err, Error::Transport(TransportError::Canceled)));
    }

    #[test]
    fn denied_reason_only_for_exchange_denials() {
        let denied: Error = ExchangeError::Denied("invalid_grant".to_string()).into();
        assert_eq!(denied.denied_reason(), Some("invalid_grant"));

        let other: Error = CredentialError::NoCredential.into();
        assert_eq!(other.denied_reason(), None);
    }

    #[test]
    fn api_error_exposes_body() {
        let body = serde_json::json!({"error": {"status": 404, "message": "gone"}});
        let err = ApiError::NotFound(Some(body.clone()));
        assert_eq!(err.body(), Some(&body));
        assert_eq!(ApiError::ServerError { status: 503 }.body(), None);
    }
}
