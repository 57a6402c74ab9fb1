//! Bearer tokens for Google Cloud REST calls.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

// refresh a little before the server-side expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

pub struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub enum TokenSource {
    /// Token supplied through the environment, used as is.
    Static(String),
    /// Default service account of the GCE/Cloud Run instance.
    MetadataServer {
        client: reqwest::Client,
        url: String,
        timeout: Duration,
        cached: Mutex<Option<CachedToken>>,
    },
    /// No `Authorization` header, for public buckets and local emulators.
    Anonymous,
}

impl TokenSource {
    pub fn metadata_server(client: reqwest::Client) -> Self {
        Self::metadata_server_at(client, METADATA_TOKEN_URL, TOKEN_TIMEOUT)
    }

    /// Token endpoint override, for emulators and tests.
    pub fn metadata_server_at(client: reqwest::Client, url: &str, timeout: Duration) -> Self {
        TokenSource::MetadataServer {
            client,
            url: url.to_string(),
            timeout,
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<Option<String>> {
        match self {
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Anonymous => Ok(None),
            TokenSource::MetadataServer {
                client,
                url,
                timeout,
                cached,
            } => {
                let mut cached = cached.lock().await;
                if let Some(token) = cached.as_ref() {
                    if Instant::now() < token.expires_at {
                        return Ok(Some(token.value.clone()));
                    }
                }

                let fresh: MetadataToken = client
                    .get(url.as_str())
                    .header("Metadata-Flavor", "Google")
                    .timeout(*timeout)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| Error::Unavailable(format!("metadata token request failed: {}", e)))?
                    .json()
                    .await
                    .map_err(|e| Error::Unavailable(format!("malformed metadata token: {}", e)))?;

                debug!(expires_in = fresh.expires_in, "Fetched access token from metadata server");
                let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(EXPIRY_MARGIN);
                *cached = Some(CachedToken {
                    value: fresh.access_token.clone(),
                    expires_at: Instant::now() + lifetime,
                });
                Ok(Some(fresh.access_token))
            }
        }
    }

    pub async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        Ok(match self.token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }
}
