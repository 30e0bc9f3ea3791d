//! Terminal Spotify client core.
//!
//! This library provides the authenticated plumbing of sptcli: the OAuth 2.0
//! login handshake with a local callback listener, credential storage and
//! refresh, and a resilient request pipeline for the Spotify Web API. Every
//! asynchronous operation can also be driven through a cancellable
//! [`Promise`](promise::Promise).
//!
//! # Modules
//!
//! - `api` - HTTP endpoints for the local callback listener
//! - `cli` - Command-line interface implementations
//! - `config` - Configuration management and environment variables
//! - `error` - Error taxonomy
//! - `http` - Single HTTP round trips with timeout and cancellation
//! - `management` - Credential storage and lifecycle
//! - `promise` - Cancellable deferred results
//! - `server` - One-shot listener for the OAuth callback
//! - `spotify` - Login, token exchange and Web API client
//! - `types` - Data structures and type definitions
//!
//! # Example
//!
//! ```rust,ignore
//! use sptcli::{config::{self, Config}, cli};
//!
//! #[tokio::main]
//! async fn main() -> sptcli::Res<()> {
//!     config::load_env().await?;
//!     let config = Config::from_env()?;
//!     cli::status(&config).await
//! }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod management;
pub mod promise;
pub mod server;
pub mod spotify;
pub mod types;

/// Result type of the command layer, where any failure ends up on the console.
pub type Res<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Prints an informational line with a blue bullet.
///
/// Accepts the same arguments as `println!`.
///
/// # Example
///
/// ```rust,ignore
/// info!("Waiting for the browser redirect on {}", addr);
/// ```
#[macro_export]
macro_rules! info {
  ($($arg:tt)*) => ({
    use colored::Colorize;
    println!("[{}] {}", "o".blue().bold(), std::format_args!($($arg)*));
  })
}

/// Prints a success line with a green checkmark.
#[macro_export]
macro_rules! success {
  ($($arg:tt)*) => ({
    use colored::Colorize;
    println!("[{}] {}", "✓".green().bold(), std::format_args!($($arg)*));
  })
}

/// Prints an error line to stderr and exits with status 1.
///
/// Only for the binary's top level. Library code returns errors instead.
#[macro_export]
macro_rules! error {
  ($($arg:tt)*) => ({
    use colored::Colorize;
    eprintln!("[{}] {}", "!".red().bold(), std::format_args!($($arg)*));
    std::process::exit(1);
  })
}

/// Prints a warning line with a yellow exclamation mark to stderr.
#[macro_export]
macro_rules! warning {
  ($($arg:tt)*) => ({
    use colored::Colorize;
    eprintln!("[{}] {}", "!".yellow().bold(), std::format_args!($($arg)*));
  })
}
