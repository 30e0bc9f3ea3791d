//! # API Module
//!
//! HTTP endpoints served by the local callback listener during login.
//!
//! ## Endpoints
//!
//! - [`callback`] - Receives the authorization server's redirect. It checks
//!   the `state` nonce and hands the captured `code` (or the denial reason)
//!   to the waiting login as a typed [`CallbackOutcome`](crate::types::CallbackOutcome).
//! - [`no_content`] - Fallback for every other path, so browsers probing
//!   `/favicon.ico` and the like get an empty answer.
//!
//! Malformed HTTP never reaches these handlers; the server answers it with
//! `400 Bad Request` and keeps listening.
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use axum::{Router, routing::get};
//! use sptcli::api::{callback, no_content};
//!
//! let app = Router::new()
//!     .route("/callback", get(callback))
//!     .fallback(no_content)
//!     .with_state(state);
//! ```

mod callback;

pub use callback::CallbackState;
pub use callback::callback;
pub use callback::no_content;
