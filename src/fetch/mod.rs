mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use bytes::Bytes;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// GETs `url` and returns the body. Non-2xx statuses are errors.
#[tracing::instrument(skip(client))]
pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Bytes> {
    let parsed = url
        .parse()
        .map_err(|e| PipelineError::SourceUnavailable {
            source_locator: url.to_string(),
            reason: format!("invalid URL: {e}"),
        })?;
    let req = reqwest::Request::new(reqwest::Method::GET, parsed);

    let resp = client.execute(req).await?.error_for_status()?;
    let body = resp.bytes().await?;
    debug!(bytes = body.len(), "Remote body received");
    Ok(body)
}
