use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array4;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::ScoreBackend;
use crate::error::{Error, Result};
use crate::gcp::TokenSource;
use crate::image_utils::{ImageSize, ResizeMode};

#[derive(Debug, Clone)]
pub struct AiPlatformConfig {
    pub project: String,
    pub region: String,
    pub model: String,
    pub version: Option<String>,
    pub timeout: Duration,
    pub input_size: ImageSize,
    pub resize_mode: ResizeMode,
    /// Overrides `https://{region}-ml.googleapis.com`, for emulators and tests.
    pub endpoint: Option<String>,
}

impl AiPlatformConfig {
    pub fn predict_url(&self) -> String {
        let base = self
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}-ml.googleapis.com", self.region));
        let mut name = format!("projects/{}/models/{}", self.project, self.model);
        if let Some(version) = &self.version {
            name.push_str("/versions/");
            name.push_str(version);
        }
        format!("{}/v1/{}:predict", base.trim_end_matches('/'), name)
    }
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Value>,
    error: Option<String>,
}

/// Classifier hosted on Google Cloud AI Platform, called over its JSON REST API.
pub struct AiPlatformBackend {
    config: AiPlatformConfig,
    client: reqwest::Client,
    tokens: Arc<TokenSource>,
}

impl AiPlatformBackend {
    pub fn new(config: AiPlatformConfig, client: reqwest::Client, tokens: Arc<TokenSource>) -> Self {
        info!(url = %config.predict_url(), "Using AI Platform backend");
        Self {
            config,
            client,
            tokens,
        }
    }
}

fn instances(batch: &Array4<f32>) -> Value {
    let nested: Vec<Vec<Vec<Vec<f32>>>> = batch
        .outer_iter()
        .map(|img| {
            img.outer_iter()
                .map(|row| row.outer_iter().map(|px| px.to_vec()).collect())
                .collect()
        })
        .collect();
    json!({ "instances": nested })
}

fn scores_from_prediction(prediction: &Value) -> Result<Vec<f32>> {
    let values = match prediction {
        Value::Array(values) => values,
        // signatures with named outputs come back as {"<output>": [...]}
        Value::Object(map) => match map.values().find_map(Value::as_array) {
            Some(values) => values,
            None => return Err(Error::Backend("prediction has no score array".to_string())),
        },
        other => return Err(Error::Backend(format!("unexpected prediction {}", other))),
    };

    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| Error::Backend(format!("non-numeric score {}", v)))
        })
        .collect()
}

impl AiPlatformBackend {
    async fn call(&self, batch: Array4<f32>) -> Result<Vec<f32>> {
        let request = self
            .client
            .post(self.config.predict_url())
            .timeout(self.config.timeout)
            .json(&instances(&batch));
        let request = self.tokens.authorize(request).await?;

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.config.timeout)
            } else {
                Error::from(e)
            }
        })?;

        let status = response.status();
        let body: PredictResponse = response
            .json()
            .await
            .map_err(|e| Error::Backend(format!("AI Platform returned {}: {}", status, e)))?;

        if let Some(error) = body.error {
            return Err(Error::Backend(error));
        }
        if !status.is_success() {
            return Err(Error::Backend(format!("AI Platform returned {}", status)));
        }

        let first = body
            .predictions
            .first()
            .ok_or_else(|| Error::Backend("AI Platform returned no predictions".to_string()))?;
        scores_from_prediction(first)
    }
}

#[async_trait]
impl ScoreBackend for AiPlatformBackend {
    /// The deadline covers fetching the bearer token as well as the call itself.
    async fn predict(&self, batch: Array4<f32>) -> Result<Vec<f32>> {
        let deadline = self.config.timeout;
        tokio::time::timeout(deadline, self.call(batch))
            .await
            .map_err(|_| Error::Timeout(deadline))?
    }

    async fn input_size(&self) -> Result<ImageSize> {
        Ok(self.config.input_size)
    }

    fn resize_mode(&self) -> ResizeMode {
        self.config.resize_mode
    }
}
