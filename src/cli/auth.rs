use std::sync::Arc;

use url::Url;

use crate::{
    Res,
    config::Config,
    error::LoginError,
    info,
    spotify::auth::{Login, Prompt, WebBrowser},
    success, warning,
};

use super::{session, stored_credential};

/// Falls back to printing the consent URL when no browser can be opened.
struct BrowserOrManual;

impl Prompt for BrowserOrManual {
    fn open(&self, url: &Url) -> Result<(), LoginError> {
        if let Err(e) = WebBrowser.open(url) {
            log::debug!("{e}");
            warning!(
                "Failed to open browser. Please navigate to the following URL manually:\n{}",
                url
            );
        }
        Ok(())
    }
}

/// Logs in through the browser.
///
/// Skipped when a usable credential is stored already, unless `force` is
/// set. Pressing Ctrl-C while waiting for the redirect cancels the attempt.
///
/// # Arguments
///
/// * `config` - Application settings
/// * `force` - Log in again even if a credential is stored
///
/// # Errors
///
/// Returns the reason the attempt failed, such as a denied consent, a
/// timeout or a callback address that is already in use.
pub async fn login(config: &Config, force: bool) -> Res<()> {
    let (_, tokens) = session(config)?;

    if !force {
        if let Some(credential) = stored_credential(&tokens).await? {
            success!(
                "Already logged in, token valid for another {} minutes.",
                credential.expires_in().as_secs() / 60
            );
            return Ok(());
        }
    }

    let login = Login::with_prompt(config.clone(), tokens, Arc::new(BrowserOrManual));
    let attempt = login.start().await?;
    if let Some(addr) = login.callback_addr() {
        info!("Waiting for the browser to redirect to {}", addr);
    }

    tokio::select! {
        outcome = attempt.wait() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            login.cancel();
            let _ = attempt.wait().await;
            warning!("Login canceled.");
            return Ok(());
        }
    }

    success!("Authentication successful!");
    Ok(())
}

/// Forgets the stored credential.
pub async fn logout(config: &Config) -> Res<()> {
    let (_, tokens) = session(config)?;
    tokens.clear().await?;
    success!("Logged out.");
    Ok(())
}

/// Reports whether a credential is stored, refreshing an expired one.
pub async fn status(config: &Config) -> Res<()> {
    let (_, tokens) = session(config)?;

    match stored_credential(&tokens).await? {
        Some(credential) => {
            info!("Credential stored in {}", tokens.path().display());
            success!(
                "Logged in, token expires at {} ({} minutes left).",
                credential.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
                credential.expires_in().as_secs() / 60
            );
        }
        None => warning!("Not logged in. Run `{} login` first.", env!("CARGO_PKG_NAME")),
    }
    Ok(())
}
