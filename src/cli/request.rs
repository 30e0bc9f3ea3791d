use reqwest::Method;
use serde_json::Value;

use crate::{
    Res,
    config::Config,
    spotify::client::SpotifyClient,
    success,
    types::ApiRequest,
};

use super::{session, stored_credential};

/// Performs one Web API call and prints the JSON reply.
///
/// # Arguments
///
/// * `config` - Application settings
/// * `method` - HTTP method, e.g. `GET` or `PUT`
/// * `endpoint` - Path below the API base, e.g. `me/player`
/// * `query` - Query parameters in request order
/// * `body` - Optional JSON request body
///
/// # Errors
///
/// Fails if nobody is logged in, if `body` is not valid JSON, or with the
/// API error that remained after retrying.
///
/// # Example
///
/// ```rust,ignore
/// request(&config, Method::GET, "me/top/artists", vec![("limit".into(), "5".into())], None).await?;
/// ```
pub async fn request(
    config: &Config,
    method: Method,
    endpoint: &str,
    query: Vec<(String, String)>,
    body: Option<&str>,
) -> Res<()> {
    let body = body.map(serde_json::from_str::<Value>).transpose()?;

    let (transport, tokens) = session(config)?;
    if stored_credential(&tokens).await?.is_none() {
        return Err(format!("not logged in, run `{} login` first", env!("CARGO_PKG_NAME")).into());
    }

    let mut request = ApiRequest::new(method, endpoint);
    request.query = query;
    request.body = body;

    let client = SpotifyClient::new(config, transport, tokens);
    match client.call(request).await? {
        Value::Null => success!("Done."),
        value => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(())
}
