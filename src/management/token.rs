use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    error::{CredentialError, Result},
    promise::Promise,
    spotify::exchange::TokenExchange,
    types::Credential,
};

/// Reason the token endpoint gives when the refresh token itself was revoked.
const REVOKED_GRANT: &str = "invalid_grant";

/// Holds the current credential and owns its lifecycle.
///
/// This is the only place the credential is written. Readers get a clone
/// of the whole pair, writers replace it under the write lock.
pub struct TokenManager {
    current: RwLock<Option<Credential>>,
    path: PathBuf,
    exchange: TokenExchange,
    refresh_guard: tokio::sync::Mutex<()>,
}

impl TokenManager {
    /// Creates an empty manager persisting to `path`.
    ///
    /// Nothing is read from disk until [`load`](Self::load) is called.
    pub fn new(exchange: TokenExchange, path: PathBuf) -> Self {
        TokenManager {
            current: RwLock::new(None),
            path,
            exchange,
            refresh_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// The token endpoint client used for refreshing.
    pub fn exchange(&self) -> &TokenExchange {
        &self.exchange
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A copy of the current credential, if any.
    pub fn get(&self) -> Option<Credential> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current access token, without checking its expiry.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NoCredential`] if nobody is logged in.
    pub fn access_token(&self) -> Result<String> {
        self.get()
            .map(|credential| credential.access_token)
            .ok_or_else(|| CredentialError::NoCredential.into())
    }

    /// Validates `candidate` and makes it the current credential.
    ///
    /// `candidate` is a raw grant as returned by the token endpoint or read
    /// from disk. Checks run in this order:
    /// 1. it must be a JSON object
    /// 2. `access_token` must be a non-empty string
    /// 3. `refresh_token` may be missing only if a credential is already
    ///    stored, whose refresh token is then carried over
    /// 4. `expires_at` (Unix seconds) or `expires_in` (seconds from now)
    ///    must be present
    ///
    /// Any other field is dropped.
    pub fn set(&self, candidate: Value) -> Result<Credential> {
        let Value::Object(mut fields) = candidate else {
            return Err(CredentialError::MalformedCredential.into());
        };

        let access_token = match fields.remove("access_token") {
            Some(Value::String(token)) if !token.is_empty() => token,
            _ => return Err(CredentialError::MissingAccessToken.into()),
        };

        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let refresh_token = match fields.remove("refresh_token") {
            Some(Value::String(token)) if !token.is_empty() => token,
            _ => match current.as_ref() {
                Some(previous) => previous.refresh_token.clone(),
                None => return Err(CredentialError::MissingRefreshToken.into()),
            },
        };

        let expires_at = match (
            fields.get("expires_at").and_then(Value::as_i64),
            fields.get("expires_in").and_then(Value::as_i64),
        ) {
            (Some(at), _) => at,
            (None, Some(seconds)) => Utc::now()
                .timestamp()
                .checked_add(seconds)
                .ok_or(CredentialError::MissingExpirationTime)?,
            (None, None) => return Err(CredentialError::MissingExpirationTime.into()),
        };
        let expires_at = DateTime::from_timestamp(expires_at, 0)
            .ok_or(CredentialError::MissingExpirationTime)?;

        let credential = Credential {
            access_token,
            refresh_token,
            expires_at,
        };
        *current = Some(credential.clone());
        Ok(credential)
    }

    /// Writes the current credential to disk as pretty JSON.
    ///
    /// Missing parent directories are created. On unix the file is made
    /// readable by the owner only.
    ///
    /// # Errors
    ///
    /// * [`CredentialError::NoCredential`] if there is nothing to save
    /// * [`CredentialError::Storage`] if the file cannot be written
    pub async fn save(&self) -> Result<()> {
        let credential = self.get().ok_or(CredentialError::NoCredential)?;

        if let Some(parent) = self.path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .map_err(CredentialError::from)?;
        }

        let json = serde_json::to_string_pretty(&credential)
            .map_err(|e| CredentialError::Storage(e.to_string()))?;
        async_fs::write(&self.path, format!("{json}\n"))
            .await
            .map_err(CredentialError::from)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            async_fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(CredentialError::from)?;
        }

        Ok(())
    }

    /// Loads the persisted credential, refreshing it right away if it has
    /// already expired. Returns `Ok(None)` if nothing was saved yet.
    ///
    /// # Errors
    ///
    /// * [`CredentialError::MalformedCredential`] if the file is not a JSON
    ///   object, or any other validation error from [`set`](Self::set)
    /// * [`CredentialError::Storage`] if the file exists but cannot be read
    /// * the refresh failure if the stored credential had expired
    pub async fn load(&self) -> Result<Option<Credential>> {
        let content = match async_fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CredentialError::from(e).into()),
        };

        let candidate: Value =
            serde_json::from_str(&content).map_err(|_| CredentialError::MalformedCredential)?;
        let credential = self.set(candidate)?;

        if credential.is_expired() {
            log::debug!("stored credential expired at {}, refreshing", credential.expires_at);
            return self.refresh().await.map(Some);
        }
        Ok(Some(credential))
    }

    /// Trades the stored refresh token for a new credential.
    ///
    /// Concurrent callers are collapsed: whoever waited on an in-flight
    /// refresh gets its result instead of exchanging again. A refresh denied
    /// with `invalid_grant` clears the store, in memory and on disk, before
    /// the error is returned, since only a new login can recover from it.
    pub async fn refresh(&self) -> Result<Credential> {
        let observed = self.get().ok_or(CredentialError::NoCredential)?;
        let _guard = self.refresh_guard.lock().await;

        let current = self.get().ok_or(CredentialError::NoCredential)?;
        if current != observed {
            log::debug!("credential was replaced while waiting, skipping refresh");
            return Ok(current);
        }

        match self
            .exchange
            .exchange_refresh_token(&current.refresh_token)
            .await
        {
            Ok(grant) => {
                let credential = self.set(grant)?;
                if let Err(e) = self.save().await {
                    log::warn!("failed to persist refreshed credential: {e}");
                }
                Ok(credential)
            }
            Err(e) if e.denied_reason() == Some(REVOKED_GRANT) => {
                log::warn!("refresh token was revoked, clearing stored credential");
                if let Err(clear_err) = self.clear().await {
                    log::warn!("failed to remove stored credential: {clear_err}");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn refresh_promise(self: &Arc<Self>) -> Promise<Credential> {
        let manager = Arc::clone(self);
        Promise::spawn(move |_| async move { manager.refresh().await })
    }

    /// Forgets the credential and deletes the persisted copy.
    pub async fn clear(&self) -> Result<()> {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        match async_fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CredentialError::from(e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use axum::{Form, Json, Router, extract::State, http::StatusCode, routing::post};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use url::Url;

    use super::*;
    use crate::{
        config::Config,
        error::{Error, ExchangeError},
        http::Transport,
    };

    async fn token_endpoint(
        State(hits): State<Arc<AtomicUsize>>,
        Form(form): Form<std::collections::HashMap<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        hits.fetch_add(1, Ordering::SeqCst);
        // give concurrent refreshers time to pile up on the guard
        tokio::time::sleep(Duration::from_millis(50)).await;
        match form.get("refresh_token").map(String::as_str) {
            Some("revoked") => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_grant"})),
            ),
            _ => (
                StatusCode::OK,
                Json(json!({"access_token": "fresh", "expires_in": 3600, "scope": "x"})),
            ),
        }
    }

    async fn start_token_endpoint() -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/api/token", post(token_endpoint))
            .with_state(Arc::clone(&hits));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, hits)
    }

    fn manager(dir: &TempDir, token_addr: Option<SocketAddr>) -> TokenManager {
        let mut config = Config::new("client", "secret");
        if let Some(addr) = token_addr {
            config.token_url = Url::parse(&format!("http://{addr}/api/token")).unwrap();
        }
        let exchange = TokenExchange::new(&config, Transport::new().unwrap());
        TokenManager::new(exchange, dir.path().join("nested/token.json"))
    }

    fn credential_error(err: Error) -> CredentialError {
        match err {
            Error::Credential(e) => e,
            other => panic!("expected credential error, got {other:?}"),
        }
    }

    #[test]
    fn set_rejects_non_objects() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        let err = tokens.set(json!(["access_token", "T"])).unwrap_err();
        assert_eq!(credential_error(err), CredentialError::MalformedCredential);
    }

    #[test]
    fn set_requires_access_token() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);

        let err = tokens
            .set(json!({"refresh_token": "R", "expires_in": 3600}))
            .unwrap_err();
        assert_eq!(credential_error(err), CredentialError::MissingAccessToken);

        let err = tokens
            .set(json!({"access_token": "", "refresh_token": "R", "expires_in": 3600}))
            .unwrap_err();
        assert_eq!(credential_error(err), CredentialError::MissingAccessToken);
    }

    #[test]
    fn set_without_refresh_token_needs_previous_credential() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);

        let err = tokens
            .set(json!({"access_token": "T", "expires_in": 3600}))
            .unwrap_err();
        assert_eq!(credential_error(err), CredentialError::MissingRefreshToken);
        assert!(tokens.get().is_none());

        tokens
            .set(json!({"access_token": "T1", "refresh_token": "R", "expires_in": 3600}))
            .unwrap();
        let merged = tokens
            .set(json!({"access_token": "T2", "expires_in": 3600}))
            .unwrap();
        assert_eq!(merged.access_token, "T2");
        assert_eq!(merged.refresh_token, "R");
    }

    #[test]
    fn set_requires_expiry() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        let err = tokens
            .set(json!({"access_token": "T", "refresh_token": "R"}))
            .unwrap_err();
        assert_eq!(credential_error(err), CredentialError::MissingExpirationTime);
    }

    #[test]
    fn set_rejects_out_of_range_expiry() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);

        let err = tokens
            .set(json!({"access_token": "T", "refresh_token": "R", "expires_in": i64::MAX}))
            .unwrap_err();
        assert_eq!(credential_error(err), CredentialError::MissingExpirationTime);

        let err = tokens
            .set(json!({"access_token": "T", "refresh_token": "R", "expires_at": i64::MAX}))
            .unwrap_err();
        assert_eq!(credential_error(err), CredentialError::MissingExpirationTime);
        assert!(tokens.get().is_none());
    }

    #[test]
    fn set_normalizes_relative_expiry() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);

        let before = Utc::now().timestamp();
        let credential = tokens
            .set(json!({
                "access_token": "T",
                "refresh_token": "R",
                "expires_in": 3600,
                "token_type": "Bearer",
            }))
            .unwrap();
        let after = Utc::now().timestamp();

        let expires_at = credential.expires_at.timestamp();
        assert!(expires_at >= before + 3600 && expires_at <= after + 3600);
        assert_eq!(tokens.get(), Some(credential));
    }

    #[test]
    fn absolute_expiry_wins_over_relative() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        let credential = tokens
            .set(json!({
                "access_token": "T",
                "refresh_token": "R",
                "expires_at": 4_000_000_000_i64,
                "expires_in": 10,
            }))
            .unwrap();
        assert_eq!(credential.expires_at.timestamp(), 4_000_000_000);
    }

    #[test]
    fn access_token_requires_credential() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        let err = tokens.access_token().unwrap_err();
        assert_eq!(credential_error(err), CredentialError::NoCredential);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        let saved = tokens
            .set(json!({"access_token": "T", "refresh_token": "R", "expires_in": 3600}))
            .unwrap();
        tokens.save().await.unwrap();

        let content = std::fs::read_to_string(tokens.path()).unwrap();
        assert!(content.contains("\"expires_at\""));
        assert!(!content.contains("expires_in"));

        let reloaded = manager(&dir, None);
        assert_eq!(reloaded.load().await.unwrap(), Some(saved.clone()));
        assert_eq!(reloaded.get(), Some(saved));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        tokens
            .set(json!({"access_token": "T", "refresh_token": "R", "expires_in": 3600}))
            .unwrap();
        tokens.save().await.unwrap();

        let mode = std::fs::metadata(tokens.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn save_without_credential_fails() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        let err = tokens.save().await.unwrap_err();
        assert_eq!(credential_error(err), CredentialError::NoCredential);
    }

    #[tokio::test]
    async fn load_without_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        assert_eq!(tokens.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn load_rejects_malformed_file() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        std::fs::create_dir_all(tokens.path().parent().unwrap()).unwrap();
        std::fs::write(tokens.path(), "{ not json").unwrap();

        let err = tokens.load().await.unwrap_err();
        assert_eq!(credential_error(err), CredentialError::MalformedCredential);
    }

    #[tokio::test]
    async fn load_refreshes_expired_credential() {
        let (addr, hits) = start_token_endpoint().await;
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, Some(addr));
        std::fs::create_dir_all(tokens.path().parent().unwrap()).unwrap();
        std::fs::write(
            tokens.path(),
            json!({"access_token": "stale", "refresh_token": "R", "expires_at": 1_000}).to_string(),
        )
        .unwrap();

        let credential = tokens.load().await.unwrap().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(credential.access_token, "fresh");
        assert_eq!(credential.refresh_token, "R");
        assert!(!credential.is_expired());
    }

    #[tokio::test]
    async fn refresh_without_credential_fails() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        let err = tokens.refresh().await.unwrap_err();
        assert_eq!(credential_error(err), CredentialError::NoCredential);
    }

    #[tokio::test]
    async fn refresh_replaces_and_persists_credential() {
        let (addr, _) = start_token_endpoint().await;
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, Some(addr));
        tokens
            .set(json!({"access_token": "old", "refresh_token": "R", "expires_in": 10}))
            .unwrap();

        let refreshed = tokens.refresh().await.unwrap();
        assert_eq!(refreshed.access_token, "fresh");
        assert_eq!(refreshed.refresh_token, "R");

        let persisted: Value =
            serde_json::from_str(&std::fs::read_to_string(tokens.path()).unwrap()).unwrap();
        assert_eq!(persisted["access_token"], "fresh");
    }

    #[tokio::test]
    async fn revoked_refresh_token_clears_store() {
        let (addr, _) = start_token_endpoint().await;
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, Some(addr));
        tokens
            .set(json!({"access_token": "old", "refresh_token": "revoked", "expires_in": 10}))
            .unwrap();
        tokens.save().await.unwrap();

        let err = tokens.refresh().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Exchange(ExchangeError::Denied(ref reason)) if reason == "invalid_grant"
        ));
        assert!(tokens.get().is_none());
        assert!(!tokens.path().exists());
    }

    #[tokio::test]
    async fn concurrent_refreshes_exchange_once() {
        let (addr, hits) = start_token_endpoint().await;
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, Some(addr));
        tokens
            .set(json!({"access_token": "old", "refresh_token": "R", "expires_in": 10}))
            .unwrap();

        let (first, second) = tokio::join!(tokens.refresh(), tokens.refresh());
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_promise_resolves() {
        let (addr, _) = start_token_endpoint().await;
        let dir = TempDir::new().unwrap();
        let tokens = Arc::new(manager(&dir, Some(addr)));
        tokens
            .set(json!({"access_token": "old", "refresh_token": "R", "expires_in": 10}))
            .unwrap();

        let credential = tokens.refresh_promise().wait().await.unwrap();
        assert_eq!(credential.access_token, "fresh");
    }

    #[tokio::test]
    async fn clear_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        let tokens = manager(&dir, None);
        tokens
            .set(json!({"access_token": "T", "refresh_token": "R", "expires_in": 3600}))
            .unwrap();
        tokens.clear().await.unwrap();
        assert!(tokens.get().is_none());
    }
}
