//! Configuration management for sptcli.
//!
//! Configuration comes from environment variables, optionally seeded from a
//! `.env` file in the local data directory:
//! 1. Environment variables (highest priority)
//! 2. `.env` file in the local data directory
//! 3. Built-in defaults for everything except the client credentials

use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;
use url::Url;

pub const SPOTIFY_AUTH_URL: &str = "https://accounts.spotify.com/authorize";
pub const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const SPOTIFY_API_URL: &str = "https://api.spotify.com/v1";
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8888/callback";
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:8888";
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Scopes requested on login unless `SPOTIFY_API_AUTH_SCOPE` overrides them.
pub const DEFAULT_SCOPES: &[&str] = &[
    "ugc-image-upload",
    "user-read-playback-state",
    "user-modify-playback-state",
    "playlist-read-private",
    "user-follow-modify",
    "playlist-read-collaborative",
    "user-follow-read",
    "user-read-currently-playing",
    "user-read-playback-position",
    "user-library-modify",
    "playlist-modify-private",
    "playlist-modify-public",
    "user-read-email",
    "user-top-read",
    "user-read-recently-played",
    "user-read-private",
    "user-library-read",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("cannot load environment file: {0}")]
    EnvFile(String),
}

/// Loads environment variables from `sptcli/.env` in the local data
/// directory.
///
/// Creates the directory if it doesn't exist. A missing `.env` file is not
/// an error, since every setting can also come from the process environment.
///
/// # Directory Structure
///
/// - Linux: `~/.local/share/sptcli/.env`
/// - macOS: `~/Library/Application Support/sptcli/.env`
/// - Windows: `%LOCALAPPDATA%/sptcli/.env`
pub async fn load_env() -> Result<(), ConfigError> {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("sptcli/.env");
    if let Some(parent) = path.parent() {
        async_fs::create_dir_all(parent)
            .await
            .map_err(|e| ConfigError::EnvFile(e.to_string()))?;
    }

    match dotenv::from_path(&path) {
        Ok(()) => Ok(()),
        Err(dotenv::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ConfigError::EnvFile(e.to_string())),
    }
}

/// Runtime settings shared by the login flow and the API client.
#[derive(Clone, Debug)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: Url,
    pub token_url: Url,
    pub api_url: Url,
    /// Where the authorization server sends the browser back to. Its path is
    /// the path the callback listener answers on.
    pub redirect_uri: Url,
    /// Address the callback listener binds to.
    pub server_addr: SocketAddr,
    pub scopes: Vec<String>,
    pub request_timeout: Duration,
    pub login_timeout: Duration,
    pub token_path: PathBuf,
}

impl Config {
    /// Creates a configuration with Spotify's endpoints and default local
    /// settings for the given application credentials.
    ///
    /// # Panics
    ///
    /// Panics if one of the built-in URL or address constants is invalid.
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_url: Url::parse(SPOTIFY_AUTH_URL).expect("invalid built-in auth url"),
            token_url: Url::parse(SPOTIFY_TOKEN_URL).expect("invalid built-in token url"),
            api_url: Url::parse(SPOTIFY_API_URL).expect("invalid built-in api url"),
            redirect_uri: Url::parse(DEFAULT_REDIRECT_URI).expect("invalid built-in redirect uri"),
            server_addr: SocketAddr::from_str(DEFAULT_SERVER_ADDRESS)
                .expect("invalid built-in server address"),
            scopes: DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            token_path: default_token_path(),
        }
    }

    /// Builds the configuration from the process environment.
    ///
    /// `SPOTIFY_API_AUTH_CLIENT_ID` and `SPOTIFY_API_AUTH_CLIENT_SECRET` are
    /// required. Everything else falls back to the defaults of [`Config::new`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for an unset required variable and
    /// [`ConfigError::Invalid`] for an override that cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), but reads variables through
    /// `lookup`. Blank values count as unset.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let mut config = Self::new(
            vars.required("SPOTIFY_API_AUTH_CLIENT_ID")?,
            vars.required("SPOTIFY_API_AUTH_CLIENT_SECRET")?,
        );

        if let Some(url) = vars.parsed::<Url>("SPOTIFY_API_AUTH_URL")? {
            config.auth_url = url;
        }
        if let Some(url) = vars.parsed::<Url>("SPOTIFY_API_TOKEN_URL")? {
            config.token_url = url;
        }
        if let Some(url) = vars.parsed::<Url>("SPOTIFY_API_URL")? {
            config.api_url = url;
        }
        if let Some(url) = vars.parsed::<Url>("SPOTIFY_API_REDIRECT_URI")? {
            config.redirect_uri = url;
        }
        if let Some(addr) = vars.parsed::<SocketAddr>("SERVER_ADDRESS")? {
            config.server_addr = addr;
        }
        if let Some(scope) = vars.optional("SPOTIFY_API_AUTH_SCOPE") {
            config.scopes = scope.split_whitespace().map(ToString::to_string).collect();
        }
        if let Some(secs) = vars.parsed::<u64>("SPTCLI_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = vars.parsed::<u64>("SPTCLI_LOGIN_TIMEOUT_SECS")? {
            config.login_timeout = Duration::from_secs(secs);
        }
        if let Some(path) = vars.optional("SPTCLI_TOKEN_PATH") {
            config.token_path = PathBuf::from(path);
        }

        Ok(config)
    }

    /// The path the callback listener serves, taken from the redirect URI.
    #[must_use]
    pub fn callback_path(&self) -> &str {
        self.redirect_uri.path()
    }
}

/// `<config_dir>/sptcli/token.json`, e.g. `~/.config/sptcli/token.json`.
#[must_use]
pub fn default_token_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("sptcli/token.json");
    path
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &'static str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn parsed<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(name)
            .map(|value| {
                value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                    name,
                    reason: e.to_string(),
                })
            })
            .transpose()
    }
}
