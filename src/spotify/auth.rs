use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::{Rng, distr::Alphanumeric};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::Config,
    error::{Error, LoginError, Result},
    management::TokenManager,
    promise::Promise,
    server::CallbackServer,
    types::CallbackOutcome,
};

const STATE_LENGTH: usize = 16;

/// Shows the consent screen to the user.
pub trait Prompt: Send + Sync {
    fn open(&self, url: &Url) -> std::result::Result<(), LoginError>;
}

/// Opens the consent screen in the default browser.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebBrowser;

impl Prompt for WebBrowser {
    fn open(&self, url: &Url) -> std::result::Result<(), LoginError> {
        webbrowser::open(url.as_str()).map_err(|e| LoginError::PromptFailedToOpen(e.to_string()))
    }
}

struct Attempt {
    promise: Promise<()>,
    addr: Option<SocketAddr>,
}

/// Runs the OAuth 2.0 authorization code flow.
///
/// Only one attempt runs at a time. A finished attempt, successful or not,
/// makes room for the next one.
pub struct Login {
    config: Config,
    tokens: Arc<TokenManager>,
    prompt: Arc<dyn Prompt>,
    active: Mutex<Option<Attempt>>,
}

impl Login {
    pub fn new(config: Config, tokens: Arc<TokenManager>) -> Self {
        Self::with_prompt(config, tokens, Arc::new(WebBrowser))
    }

    pub fn with_prompt(config: Config, tokens: Arc<TokenManager>, prompt: Arc<dyn Prompt>) -> Self {
        Login {
            config,
            tokens,
            prompt,
            active: Mutex::new(None),
        }
    }

    /// Starts a login attempt.
    ///
    /// Binds the callback listener, then opens the consent screen. The
    /// returned promise settles once the redirect arrived and the code was
    /// exchanged and stored, or fails with the reason the attempt ended.
    ///
    /// # Errors
    ///
    /// Setup failures are returned directly:
    ///
    /// * [`LoginError::AlreadyInProgress`] if another attempt is running
    /// * [`LoginError::ListenerFailedToBind`] if the callback address is taken
    /// * [`LoginError::PromptFailedToOpen`] if the consent screen could not
    ///   be shown; the listener is stopped again
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let login = Login::new(config, Arc::clone(&tokens));
    /// login.start().await?.wait().await?;
    /// ```
    pub async fn start(&self) -> Result<Promise<()>> {
        let promise = self.reserve()?;
        let cancel = promise.cancellation_token();

        match self.prepare(&cancel).await {
            Ok(server) => {
                self.record_addr(&promise, server.local_addr());
                tokio::spawn(drive(
                    promise.clone(),
                    cancel,
                    server,
                    Arc::clone(&self.tokens),
                    self.config.login_timeout,
                ));
                Ok(promise)
            }
            Err(e) => {
                promise.fail(e.clone());
                self.release(&promise);
                Err(e)
            }
        }
    }

    /// Cancels the running attempt. Does nothing once it has settled.
    ///
    /// Cancellation hooks on the attempt's promise run without the attempt
    /// slot locked, so they may call back into this `Login`.
    pub fn cancel(&self) {
        let running = self
            .lock()
            .as_ref()
            .map(|attempt| attempt.promise.clone())
            .filter(|promise| !promise.is_settled());

        if let Some(promise) = running {
            log::debug!("canceling login attempt");
            promise.cancel();
        }
    }

    /// Address the callback listener of the running attempt is bound to.
    pub fn callback_addr(&self) -> Option<SocketAddr> {
        self.lock()
            .as_ref()
            .filter(|attempt| !attempt.promise.is_settled())
            .and_then(|attempt| attempt.addr)
    }

    fn reserve(&self) -> Result<Promise<()>> {
        let mut active = self.lock();
        if active
            .as_ref()
            .is_some_and(|attempt| !attempt.promise.is_settled())
        {
            return Err(LoginError::AlreadyInProgress.into());
        }

        let promise = Promise::new();
        *active = Some(Attempt {
            promise: promise.clone(),
            addr: None,
        });
        Ok(promise)
    }

    fn record_addr(&self, promise: &Promise<()>, addr: SocketAddr) {
        if let Some(attempt) = self.lock().as_mut() {
            if attempt.promise.ptr_eq(promise) {
                attempt.addr = Some(addr);
            }
        }
    }

    fn release(&self, promise: &Promise<()>) {
        let mut active = self.lock();
        if active
            .as_ref()
            .is_some_and(|attempt| attempt.promise.ptr_eq(promise))
        {
            *active = None;
        }
    }

    async fn prepare(&self, cancel: &CancellationToken) -> Result<CallbackServer> {
        let state = generate_state();
        let server = CallbackServer::bind(
            self.config.server_addr,
            self.config.callback_path(),
            state.clone(),
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(Error::canceled());
        }

        let url = authorization_url(&self.config, &state);
        log::debug!("opening consent screen, listening on {}", server.local_addr());
        // dropping the server on error stops it
        self.prompt.open(&url)?;
        Ok(server)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Attempt>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn drive(
    promise: Promise<()>,
    cancel: CancellationToken,
    server: CallbackServer,
    tokens: Arc<TokenManager>,
    timeout: Duration,
) {
    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::canceled()),
        outcome = complete(server, tokens, timeout) => outcome,
    };

    match outcome {
        Ok(()) => {
            log::debug!("login attempt succeeded");
            promise.settle(());
        }
        Err(e) => {
            log::debug!("login attempt ended: {e}");
            promise.fail(e);
        }
    }
}

async fn complete(
    mut server: CallbackServer,
    tokens: Arc<TokenManager>,
    timeout: Duration,
) -> Result<()> {
    let received = tokio::time::timeout(timeout, server.recv()).await;
    server.stop();

    let code = match received {
        Err(_) => return Err(LoginError::TimedOut.into()),
        Ok(None) => return Err(LoginError::ListenerClosed.into()),
        Ok(Some(CallbackOutcome::Denied(reason))) => {
            return Err(LoginError::CodeDenied(reason).into());
        }
        Ok(Some(CallbackOutcome::Code(code))) => code,
    };
    drop(server);

    let grant = tokens.exchange().exchange_code(&code).await?;
    tokens.set(grant)?;
    if let Err(e) = tokens.save().await {
        log::warn!("failed to persist credential: {e}");
    }
    Ok(())
}

/// Builds the consent screen URL for one attempt.
pub fn authorization_url(config: &Config, state: &str) -> Url {
    let mut url = config.auth_url.clone();
    url.query_pairs_mut()
        .append_pair("client_id", &config.client_id)
        .append_pair("response_type", "code")
        .append_pair("redirect_uri", config.redirect_uri.as_str())
        .append_pair("state", state)
        .append_pair("scope", &config.scopes.join(" "))
        .append_pair("show_dialog", "true");
    url
}

/// Random nonce tying the redirect to the attempt that caused it.
pub fn generate_state() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_LENGTH)
        .map(char::from)
        .collect()
}
