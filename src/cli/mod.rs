//! # CLI Module
//!
//! The command layer of sptcli. Each command builds what it needs from the
//! [`Config`](crate::config::Config), drives the core, and reports the
//! outcome on the console with the crate's colored output macros.
//!
//! ## Commands
//!
//! ### Authentication
//!
//! - [`login`] - Runs the browser login unless a usable credential is stored
//!   already. Ctrl-C cancels a running attempt.
//! - [`logout`] - Forgets the stored credential.
//! - [`status`] - Shows whether a credential is stored and when it expires.
//!   An expired credential is refreshed on the way.
//!
//! ### Web API
//!
//! - [`request`] - Performs one Web API call and prints the JSON reply.
//!
//! ## Error Handling
//!
//! Commands return [`Res`](crate::Res); the binary prints the error and
//! exits non-zero.

mod auth;
mod request;

use std::sync::Arc;

use crate::{
    Res, config::Config, http::Transport, management::TokenManager,
    spotify::exchange::TokenExchange,
};

pub use auth::login;
pub use auth::logout;
pub use auth::status;
pub use request::request;

fn session(config: &Config) -> Res<(Transport, Arc<TokenManager>)> {
    let transport = Transport::new()?;
    let exchange = TokenExchange::new(config, transport.clone());
    let tokens = TokenManager::new(exchange, config.token_path.clone());
    Ok((transport, Arc::new(tokens)))
}

/// Loads the stored credential, treating a revoked one as absent.
async fn stored_credential(tokens: &TokenManager) -> Res<Option<crate::types::Credential>> {
    match tokens.load().await {
        Ok(credential) => Ok(credential),
        Err(e) if e.denied_reason().is_some() => {
            log::debug!("stored credential no longer accepted: {e}");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
