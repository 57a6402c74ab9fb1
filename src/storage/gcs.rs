use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use percent_encoding::utf8_percent_encode;
use tracing::{debug, info};

use super::signing::{signed_url, HmacKey, OBJECT_PATH, UNRESERVED};
use super::{ObjectStore, UrlMode};
use crate::error::{Error, Result};
use crate::gcp::TokenSource;

const PUBLIC_HOST: &str = "storage.googleapis.com";

#[derive(Debug, Clone)]
pub struct GcsConfig {
    pub bucket: String,
    /// JSON API root, overridable for emulators.
    pub api_base: String,
    pub hmac_key: Option<HmacKey>,
}

impl GcsConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            api_base: format!("https://{}", PUBLIC_HOST),
            hmac_key: None,
        }
    }
}

/// Google Cloud Storage through its JSON API.
pub struct GcsStore {
    config: GcsConfig,
    client: reqwest::Client,
    tokens: Arc<TokenSource>,
}

impl GcsStore {
    pub fn new(config: GcsConfig, client: reqwest::Client, tokens: Arc<TokenSource>) -> Self {
        info!(
            bucket = %config.bucket,
            signing = config.hmac_key.is_some(),
            "Using GCS object store"
        );
        Self {
            config,
            client,
            tokens,
        }
    }

    fn upload_url(&self, path: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.config.api_base,
            self.config.bucket,
            utf8_percent_encode(path, UNRESERVED)
        )
    }

    fn download_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.config.api_base,
            self.config.bucket,
            utf8_percent_encode(path, UNRESERVED)
        )
    }
}

fn storage_error(action: &str, path: &str, e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("{} {} failed: {}", action, path, e))
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let size = bytes.len();
        let request = self
            .client
            .post(self.upload_url(path))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        self.tokens
            .authorize(request)
            .await?
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| storage_error("upload of", path, e))?;

        debug!(bucket = %self.config.bucket, path, size, "Uploaded object");
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let request = self.client.get(self.download_url(path));
        let response = self
            .tokens
            .authorize(request)
            .await?
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| storage_error("download of", path, e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| storage_error("download of", path, e))?;
        Ok(bytes.to_vec())
    }

    fn url_for(&self, path: &str, mode: UrlMode) -> Result<String> {
        match mode {
            UrlMode::Public => Ok(format!(
                "https://{}/{}/{}",
                PUBLIC_HOST,
                self.config.bucket,
                utf8_percent_encode(path, OBJECT_PATH)
            )),
            UrlMode::Signed { expires } => {
                let key = self.config.hmac_key.as_ref().ok_or_else(|| {
                    Error::Storage("signed URLs need GCS_HMAC_ACCESS_ID and GCS_HMAC_SECRET".to_string())
                })?;
                signed_url(PUBLIC_HOST, &self.config.bucket, path, key, expires, Utc::now())
            }
        }
    }
}
