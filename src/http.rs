//! HTTP transport with enforced timeouts and cooperative cancellation.
//!
//! [`Transport`] wraps a `reqwest::Client` and performs exactly one HTTP
//! round trip per call. Each call races three things:
//! * the network exchange itself, including reading the whole body
//! * a timer for the request's timeout
//! * an optional [`CancellationToken`]
//!
//! Whichever finishes first wins; the losers are dropped, which closes the
//! underlying connection. Status codes are returned as-is; interpreting them
//! is the job of the [`SpotifyClient`](crate::spotify::client::SpotifyClient).

use std::time::Duration;

use reqwest::header::{HeaderValue, USER_AGENT};
use tokio_util::sync::CancellationToken;

use crate::{
    error::TransportError,
    promise::Promise,
    types::{HttpRequest, HttpResponse},
};

#[derive(Clone, Debug)]
pub struct Transport {
    client: reqwest::Client,
}

impl Transport {
    /// Duration to keep idle connections alive between API calls.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a transport with its own connection pool.
    ///
    /// Redirects are not followed; a `3xx` is returned like any other status.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailure`] if the TLS backend
    /// cannot be initialized.
    pub fn new() -> Result<Self, TransportError> {
        let user_agent = HeaderValue::from_static(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(USER_AGENT, user_agent);

        let client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::ConnectionFailure(e.to_string()))?;

        Ok(Self { client })
    }

    /// Performs `request` and waits for the complete response.
    ///
    /// # Errors
    ///
    /// * [`TransportError::Timeout`] if `request.timeout` elapsed first
    /// * [`TransportError::ConnectionFailure`] on socket or TLS failures
    /// * [`TransportError::MalformedResponse`] if the peer did not answer
    ///   with well-formed HTTP
    pub async fn perform(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.perform_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like [`perform`](Self::perform), but gives up with
    /// [`TransportError::Canceled`] as soon as `cancel` fires.
    pub async fn perform_with_cancel(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Canceled);
        }

        let HttpRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;
        log::trace!("{method} {url}");

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let exchange = async move {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(HttpResponse {
                status,
                headers,
                body: body.to_vec(),
            })
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Canceled),
            () = tokio::time::sleep(timeout) => Err(TransportError::Timeout(timeout)),
            response = exchange => response.map_err(TransportError::from),
        }
    }

    /// Starts `request` in the background and returns a promise for the
    /// response. Canceling the promise aborts the request.
    pub fn perform_promise(&self, request: HttpRequest) -> Promise<HttpResponse> {
        let transport = self.clone();
        Promise::spawn(move |cancel| async move {
            transport
                .perform_with_cancel(request, &cancel)
                .await
                .map_err(Into::into)
        })
    }
}
