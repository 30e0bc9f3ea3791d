use std::{sync::Arc, time::Duration};

use reqwest::{
    StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER},
};
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::Config,
    error::{ApiError, CredentialError, Error, Result},
    http::Transport,
    management::TokenManager,
    promise::Promise,
    types::{ApiRequest, HttpRequest, HttpResponse},
};

/// How often a single call may be retried before the failure surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after `429 Too Many Requests`.
    pub rate_limit_retries: u32,
    /// Immediate retries after a `5xx`.
    pub server_error_retries: u32,
    /// Backoff when a `429` has no usable `Retry-After` header.
    pub default_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_retries: 2,
            server_error_retries: 2,
            default_retry_after: Duration::from_secs(1),
        }
    }
}

/// Authenticated client for the Spotify Web API.
///
/// Every call goes through the same pipeline: stamp the bearer token,
/// perform the request, and recover locally from an expired token
/// (refresh once), rate limiting (sleep `Retry-After`) and transient server
/// errors (retry immediately) within the [`RetryPolicy`] budgets.
pub struct SpotifyClient {
    transport: Transport,
    tokens: Arc<TokenManager>,
    api_url: Url,
    timeout: Duration,
    policy: RetryPolicy,
}

impl SpotifyClient {
    /// Creates a client for `config.api_url` with the default [`RetryPolicy`].
    ///
    /// # Arguments
    ///
    /// * `config` - Supplies the API base URL and the per-request timeout
    /// * `transport` - Shared with the token exchange so both reuse one pool
    /// * `tokens` - Source of the bearer token, refreshed on `401`
    pub fn new(config: &Config, transport: Transport, tokens: Arc<TokenManager>) -> Self {
        Self {
            transport,
            tokens,
            api_url: config.api_url.clone(),
            timeout: config.request_timeout,
            policy: RetryPolicy::default(),
        }
    }

    /// Replaces the retry budgets.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The credential store this client authenticates with.
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Performs `request` and returns the parsed JSON body.
    ///
    /// A successful response without a body yields [`Value::Null`].
    ///
    /// # Errors
    ///
    /// * [`ApiError`] once the retry budgets are spent or for client errors
    /// * [`CredentialError::NoCredential`] if nobody is logged in
    /// * the refresh failure if a `401` could not be recovered from
    /// * any [`TransportError`](crate::error::TransportError) unchanged
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let me = client.call(ApiRequest::get("me")).await?;
    /// println!("{}", me["display_name"]);
    /// ```
    pub async fn call(&self, request: ApiRequest) -> Result<Value> {
        self.execute(&request, &CancellationToken::new()).await
    }

    /// Like [`call`](Self::call), but runs in the background. Canceling the
    /// promise interrupts both the request in flight and a rate-limit
    /// backoff, and no further attempts are made.
    pub fn call_promise(self: &Arc<Self>, request: ApiRequest) -> Promise<Value> {
        let client = Arc::clone(self);
        Promise::spawn(move |cancel| async move { client.execute(&request, &cancel).await })
    }

    async fn execute(&self, request: &ApiRequest, cancel: &CancellationToken) -> Result<Value> {
        let url = self.url_for(request);
        let mut refreshed = false;
        let mut rate_limit_budget = self.policy.rate_limit_retries;
        let mut server_error_budget = self.policy.server_error_retries;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::canceled());
            }

            let http_request = self.prepare(request, url.clone())?;
            let response = self
                .transport
                .perform_with_cancel(http_request, cancel)
                .await?;
            let status = response.status;

            if status.is_success() {
                return parse_success(&response);
            }

            match status {
                StatusCode::UNAUTHORIZED if !refreshed => {
                    log::debug!("{} {}: access token rejected, refreshing", request.method, request.endpoint);
                    refreshed = true;
                    self.tokens.refresh().await?;
                }
                StatusCode::UNAUTHORIZED => {
                    return Err(ApiError::Unauthorized(parse_body(&response)).into());
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = self.retry_after(&response);
                    if rate_limit_budget == 0 {
                        return Err(ApiError::RateLimited { retry_after }.into());
                    }
                    rate_limit_budget -= 1;
                    log::debug!(
                        "{} {}: rate limited, retrying in {retry_after:?}",
                        request.method,
                        request.endpoint
                    );

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(Error::canceled()),
                        () = sleep(retry_after) => {}
                    }
                }
                status if status.is_server_error() => {
                    if server_error_budget == 0 {
                        return Err(ApiError::ServerError {
                            status: status.as_u16(),
                        }
                        .into());
                    }
                    server_error_budget -= 1;
                    log::debug!(
                        "{} {}: server error {status}, retrying",
                        request.method,
                        request.endpoint
                    );
                }
                status => return Err(client_error(status, parse_body(&response)).into()),
            }
        }
    }

    fn url_for(&self, request: &ApiRequest) -> Url {
        let mut url = self.api_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(request.endpoint.split('/').filter(|s| !s.is_empty()));
        }
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        url
    }

    fn prepare(&self, request: &ApiRequest, url: Url) -> Result<HttpRequest> {
        let access_token = self.tokens.access_token()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(|_| CredentialError::MalformedCredential)?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);

        let mut http_request = HttpRequest::new(request.method.clone(), url).timeout(self.timeout);
        if let Some(body) = &request.body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            http_request = http_request.body(body.to_string());
        }
        Ok(http_request.headers(headers))
    }

    fn retry_after(&self, response: &HttpResponse) -> Duration {
        response
            .headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map_or(self.policy.default_retry_after, Duration::from_secs)
    }
}

fn parse_success(response: &HttpResponse) -> Result<Value> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| ApiError::BadResponse(e.to_string()).into())
}

fn parse_body(response: &HttpResponse) -> Option<Value> {
    serde_json::from_slice(&response.body).ok()
}

fn client_error(status: StatusCode, body: Option<Value>) -> ApiError {
    match status {
        StatusCode::BAD_REQUEST => ApiError::BadRequest(body),
        StatusCode::FORBIDDEN => ApiError::Forbidden(body),
        StatusCode::NOT_FOUND => ApiError::NotFound(body),
        status => ApiError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        },
    }
}
