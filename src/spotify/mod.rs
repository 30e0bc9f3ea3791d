//! # Spotify Integration Module
//!
//! The authenticated side of sptcli: obtaining credentials through the
//! OAuth 2.0 authorization code flow and calling the Web API with them.
//!
//! ## Architecture
//!
//! ```text
//! CLI
//!  ├── Login ──────────┐           (consent screen + callback listener)
//!  │                   ↓
//!  │             TokenExchange     (POST /api/token)
//!  │                   ↓
//!  └── SpotifyClient → TokenManager (current credential, refresh, file)
//!           ↓
//!       Transport (reqwest, timeout, cancellation)
//! ```
//!
//! ## Core Modules
//!
//! ### Authentication
//!
//! [`auth`] - Interactive login. Binds a one-shot listener on the redirect
//! address, opens the consent screen through a [`Prompt`](auth::Prompt),
//! and exchanges the code the browser is redirected with. Each attempt
//! carries a random `state` nonce; redirects without it are rejected.
//!
//! [`exchange`] - The token endpoint client. Trades an authorization code
//! or a refresh token for a grant, authenticating the application with HTTP
//! Basic credentials.
//!
//! ### Web API
//!
//! [`client`] - Every API request passes through [`SpotifyClient`](client::SpotifyClient):
//! - **Expired tokens**: a `401` triggers one refresh and one retry
//! - **Rate limiting**: a `429` sleeps for `Retry-After` seconds, twice at most
//! - **Server errors**: a `5xx` is retried immediately, twice at most
//! - **Client errors**: reported as typed [`ApiError`](crate::error::ApiError)s with the parsed body
//!
//! ## Usage Patterns
//!
//! ```rust,ignore
//! let transport = Transport::new()?;
//! let exchange = TokenExchange::new(&config, transport.clone());
//! let tokens = Arc::new(TokenManager::new(exchange, config.token_path.clone()));
//!
//! if tokens.load().await?.is_none() {
//!     Login::new(config.clone(), Arc::clone(&tokens)).start().await?.wait().await?;
//! }
//!
//! let client = SpotifyClient::new(&config, transport, tokens);
//! let me = client.call(ApiRequest::get("me")).await?;
//! ```
//!
//! Every operation also has a promise form (`*_promise`) that runs in the
//! background and can be canceled.

pub mod auth;
pub mod client;
pub mod exchange;
