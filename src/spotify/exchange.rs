use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{
    Method,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde_json::Value;
use url::{Url, form_urlencoded};

use crate::{
    config::Config,
    error::{ExchangeError, Result},
    http::Transport,
    promise::Promise,
    types::{HttpRequest, HttpResponse},
};

/// Client for the authorization server's token endpoint.
///
/// Mints credentials from an authorization code or a refresh token. The raw
/// grant object is returned unvalidated; it is the
/// [`TokenManager`](crate::management::TokenManager) that decides whether it
/// forms a usable credential, since a refresh grant may omit the refresh
/// token and borrow the stored one.
#[derive(Clone, Debug)]
pub struct TokenExchange {
    transport: Transport,
    token_url: Url,
    redirect_uri: String,
    authorization: HeaderValue,
    timeout: std::time::Duration,
}

impl TokenExchange {
    /// Creates an exchange for the application credentials in `config`.
    ///
    /// # Panics
    ///
    /// Never in practice: the base64 alphabet only yields valid header bytes.
    #[must_use]
    pub fn new(config: &Config, transport: Transport) -> Self {
        let credentials = STANDARD.encode(format!("{}:{}", config.client_id, config.client_secret));
        let authorization = HeaderValue::from_str(&format!("Basic {credentials}"))
            .expect("base64 credentials form a valid header value");

        Self {
            transport,
            token_url: config.token_url.clone(),
            redirect_uri: config.redirect_uri.to_string(),
            authorization,
            timeout: config.request_timeout,
        }
    }

    /// Exchanges an authorization code received on the callback listener.
    ///
    /// # Errors
    ///
    /// * [`ExchangeError::Denied`] if the token endpoint refused the code
    /// * [`ExchangeError::UnparsableResponse`] if the reply is not JSON
    /// * any [`TransportError`](crate::error::TransportError) unchanged
    pub async fn exchange_code(&self, code: &str) -> Result<Value> {
        log::debug!("exchanging authorization code");
        self.fetch(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
        ])
        .await
    }

    /// Exchanges a refresh token for a fresh grant.
    ///
    /// # Errors
    ///
    /// Same as [`exchange_code`](Self::exchange_code). A revoked refresh
    /// token is reported as `Denied("invalid_grant")`.
    pub async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<Value> {
        log::debug!("exchanging refresh token");
        self.fetch(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    pub fn exchange_code_promise(&self, code: String) -> Promise<Value> {
        let exchange = self.clone();
        Promise::spawn(move |_| async move { exchange.exchange_code(&code).await })
    }

    pub fn exchange_refresh_token_promise(&self, refresh_token: String) -> Promise<Value> {
        let exchange = self.clone();
        Promise::spawn(move |_| async move { exchange.exchange_refresh_token(&refresh_token).await })
    }

    async fn fetch(&self, form: &[(&str, &str)]) -> Result<Value> {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish();

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let request = HttpRequest::new(Method::POST, self.token_url.clone())
            .headers(headers)
            .body(body)
            .timeout(self.timeout);

        let response = self.transport.perform(request).await?;
        Ok(receive(&response)?)
    }
}

fn receive(response: &HttpResponse) -> std::result::Result<Value, ExchangeError> {
    let body: Value =
        serde_json::from_slice(&response.body).map_err(|_| ExchangeError::UnparsableResponse)?;

    if let Some(error) = body.get("error") {
        let reason = error
            .as_str()
            .map_or_else(|| error.to_string(), ToString::to_string);
        log::debug!("token endpoint denied request: {reason}");
        return Err(ExchangeError::Denied(reason));
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    use axum::{
        Form, Json, Router,
        extract::State,
        http::{HeaderMap as AxumHeaders, StatusCode},
        response::IntoResponse,
        routing::post,
    };
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::error::Error;

    #[derive(Clone, Default)]
    struct Seen {
        form: Arc<Mutex<Option<HashMap<String, String>>>>,
        authorization: Arc<Mutex<Option<String>>>,
    }

    async fn token_endpoint(
        State(seen): State<Seen>,
        headers: AxumHeaders,
        Form(form): Form<HashMap<String, String>>,
    ) -> impl IntoResponse {
        *seen.authorization.lock().unwrap() = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let grant_type = form.get("grant_type").cloned().unwrap_or_default();
        let refresh_token = form.get("refresh_token").cloned();
        *seen.form.lock().unwrap() = Some(form);

        match (grant_type.as_str(), refresh_token.as_deref()) {
            ("refresh_token", Some("revoked")) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_grant", "error_description": "Refresh token revoked"})),
            ),
            _ => (
                StatusCode::OK,
                Json(json!({"access_token": "T", "refresh_token": "R", "expires_in": 3600})),
            ),
        }
    }

    async fn start(seen: Seen) -> SocketAddr {
        let app = Router::new()
            .route("/api/token", post(token_endpoint))
            .route("/garbage", post(|| async { "<html>oops</html>" }))
            .with_state(seen);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    fn exchange_for(addr: SocketAddr, path: &str) -> TokenExchange {
        let mut config = Config::new("client", "secret");
        config.token_url = Url::parse(&format!("http://{addr}{path}")).unwrap();
        TokenExchange::new(&config, Transport::new().unwrap())
    }

    #[tokio::test]
    async fn code_exchange_sends_basic_auth_and_form() {
        let seen = Seen::default();
        let addr = start(seen.clone()).await;
        let exchange = exchange_for(addr, "/api/token");

        let grant = exchange.exchange_code("abc123").await.unwrap();
        assert_eq!(grant["access_token"], "T");
        assert_eq!(grant["expires_in"], 3600);

        let form = seen.form.lock().unwrap().clone().unwrap();
        assert_eq!(form["grant_type"], "authorization_code");
        assert_eq!(form["code"], "abc123");
        assert_eq!(form["redirect_uri"], "http://127.0.0.1:8888/callback");

        let expected = format!("Basic {}", STANDARD.encode("client:secret"));
        assert_eq!(seen.authorization.lock().unwrap().as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn refresh_denial_carries_reason() {
        let addr = start(Seen::default()).await;
        let exchange = exchange_for(addr, "/api/token");

        let err = exchange.exchange_refresh_token("revoked").await.unwrap_err();
        assert_eq!(err.denied_reason(), Some("invalid_grant"));
    }

    #[tokio::test]
    async fn non_json_reply_is_unparsable() {
        let addr = start(Seen::default()).await;
        let exchange = exchange_for(addr, "/garbage");

        let err = exchange.exchange_code("abc123").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Exchange(ExchangeError::UnparsableResponse)
        ));
    }

    #[tokio::test]
    async fn promise_form_resolves_grant() {
        let seen = Seen::default();
        let addr = start(seen.clone()).await;
        let exchange = exchange_for(addr, "/api/token");

        let grant = exchange
            .exchange_refresh_token_promise("R".to_string())
            .wait()
            .await
            .unwrap();
        assert_eq!(grant["refresh_token"], "R");

        let form = seen.form.lock().unwrap().clone().unwrap();
        assert_eq!(form["grant_type"], "refresh_token");
        assert_eq!(form["refresh_token"], "R");
    }
}
