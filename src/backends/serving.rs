use std::collections::HashMap;
use std::error::Error as _;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ndarray::Array4;
use prost::Message;
use serde::Serialize;
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, info, warn};

use super::proto::{
    prediction_service_client::PredictionServiceClient, DataType, GetModelMetadataRequest,
    ModelSpec, PredictRequest, SignatureDefMap, TensorProto, TensorShapeProto,
    SIGNATURE_DEF_TYPE_URL,
};
use super::ScoreBackend;
use crate::error::{Error, Result};
use crate::image_utils::{ImageSize, ResizeMode};

const MAX_MESSAGE_BYTES: usize = 200 * 1024 * 1024;
const REQUEST_TIMEOUT_MESSAGE: &str = "Timeout expired";

#[derive(Debug, Clone)]
pub struct ServingConfig {
    /// `host:port` of the gRPC endpoint.
    pub uri: String,
    pub model_name: String,
    pub signature_name: String,
    pub metadata_timeout: Duration,
    pub predict_timeout: Duration,
    pub metadata_ttl: Duration,
    pub resize_mode: ResizeMode,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            uri: "localhost:8500".to_string(),
            model_name: "dense_net".to_string(),
            signature_name: "serving_default".to_string(),
            metadata_timeout: Duration::from_secs(2),
            predict_timeout: Duration::from_secs(5),
            metadata_ttl: Duration::from_secs(300),
            resize_mode: ResizeMode::Smart,
        }
    }
}

/// Input and output tensor contract of a served signature. Shapes exclude the batch dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub input_name: String,
    pub input_shape: Vec<i64>,
    pub output_name: String,
    pub output_shape: Vec<i64>,
}

impl ModelMetadata {
    pub fn from_signature_map(map: &SignatureDefMap, signature_name: &str) -> Result<Self> {
        let signature = map.signature_def.get(signature_name).ok_or_else(|| {
            Error::Backend(format!("signature '{}' not found in model", signature_name))
        })?;

        // map order is not stable on the wire, take the smallest key
        let (input_name, input) = signature
            .inputs
            .iter()
            .min_by(|a, b| a.0.cmp(b.0))
            .ok_or_else(|| Error::Backend("signature has no inputs".to_string()))?;
        let (output_name, output) = signature
            .outputs
            .iter()
            .min_by(|a, b| a.0.cmp(b.0))
            .ok_or_else(|| Error::Backend("signature has no outputs".to_string()))?;

        let unbatched = |shape: Option<&TensorShapeProto>| -> Vec<i64> {
            shape
                .map(|s| s.sizes().into_iter().skip(1).collect())
                .unwrap_or_default()
        };

        Ok(Self {
            input_name: input_name.clone(),
            input_shape: unbatched(input.tensor_shape.as_ref()),
            output_name: output_name.clone(),
            output_shape: unbatched(output.tensor_shape.as_ref()),
        })
    }

    pub fn image_size(&self) -> Result<ImageSize> {
        let dim = |v: i64| u32::try_from(v).ok().filter(|&d| d > 0);
        match self.input_shape.as_slice() {
            [h, w, ..] => match (dim(*h), dim(*w)) {
                (Some(height), Some(width)) => Ok(ImageSize { height, width }),
                _ => Err(Error::Backend(format!(
                    "input shape {:?} has no usable static height and width",
                    self.input_shape
                ))),
            },
            other => Err(Error::Backend(format!(
                "input shape {:?} has no static height and width",
                other
            ))),
        }
    }
}

struct CachedMetadata {
    value: ModelMetadata,
    fetched_at: Instant,
}

impl CachedMetadata {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// TensorFlow Serving over gRPC.
pub struct ServingBackend {
    config: ServingConfig,
    channel: Channel,
    metadata: RwLock<Option<CachedMetadata>>,
}

impl ServingBackend {
    /// Builds the backend with a lazily connected channel. Must be called inside a tokio runtime.
    pub fn new(config: ServingConfig) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", config.uri))
            .map_err(|e| Error::Server(format!("invalid MODEL_URI '{}': {}", config.uri, e)))?
            .connect_timeout(config.predict_timeout);

        info!(uri = %config.uri, model = %config.model_name, "Using TF Serving backend");

        Ok(Self {
            channel: endpoint.connect_lazy(),
            config,
            metadata: RwLock::new(None),
        })
    }

    fn client(&self) -> PredictionServiceClient {
        PredictionServiceClient::new(self.channel.clone()).max_message_size(MAX_MESSAGE_BYTES)
    }

    fn model_spec(&self, model_name: &str) -> ModelSpec {
        ModelSpec {
            name: model_name.to_string(),
            signature_name: self.config.signature_name.clone(),
        }
    }

    /// Returns the cached metadata of the configured model, refetching it once the TTL expires.
    pub async fn metadata(&self) -> Result<ModelMetadata> {
        if let Some(cached) = self.metadata.read().await.as_ref() {
            if cached.is_fresh(self.config.metadata_ttl) {
                return Ok(cached.value.clone());
            }
        }

        let value = self.fetch_metadata(&self.config.model_name).await?;
        *self.metadata.write().await = Some(CachedMetadata {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Ok(value)
    }

    pub async fn invalidate_metadata(&self) {
        if self.metadata.write().await.take().is_some() {
            debug!(model = %self.config.model_name, "Dropped cached model metadata");
        }
    }

    /// Fetches the signature metadata of any model on the server, bypassing the cache.
    pub async fn fetch_metadata(&self, model_name: &str) -> Result<ModelMetadata> {
        let deadline = self.config.metadata_timeout;
        let mut request = tonic::Request::new(GetModelMetadataRequest {
            model_spec: Some(self.model_spec(model_name)),
            metadata_field: vec!["signature_def".to_string()],
        });
        request.set_timeout(deadline);

        let mut client = self.client();
        let response = with_deadline(deadline, client.get_model_metadata(request)).await?;

        let any = response
            .metadata
            .get("signature_def")
            .ok_or_else(|| Error::Backend("metadata response has no signature_def".to_string()))?;
        if any.type_url != SIGNATURE_DEF_TYPE_URL {
            warn!(type_url = %any.type_url, "Unexpected signature_def type");
        }
        let map = SignatureDefMap::decode(any.value.as_slice())
            .map_err(|e| Error::Backend(format!("malformed signature_def: {}", e)))?;

        ModelMetadata::from_signature_map(&map, &self.config.signature_name)
    }

    async fn run_predict(&self, metadata: &ModelMetadata, batch: Array4<f32>) -> Result<Vec<f32>> {
        let deadline = self.config.predict_timeout;
        let tensor = TensorProto {
            dtype: DataType::DtFloat as i32,
            tensor_shape: Some(TensorShapeProto::from_dims(batch.shape())),
            float_val: batch.iter().copied().collect(),
            ..Default::default()
        };

        let mut request = tonic::Request::new(PredictRequest {
            model_spec: Some(self.model_spec(&self.config.model_name)),
            inputs: HashMap::from([(metadata.input_name.clone(), tensor)]),
            output_filter: vec![metadata.output_name.clone()],
        });
        request.set_timeout(deadline);

        let mut client = self.client();
        let response = with_deadline(deadline, client.predict(request)).await?;

        let output = response.outputs.get(&metadata.output_name).ok_or_else(|| {
            Error::Backend(format!("response has no output '{}'", metadata.output_name))
        })?;
        scores_from_tensor(output)
    }
}

#[async_trait]
impl ScoreBackend for ServingBackend {
    async fn predict(&self, batch: Array4<f32>) -> Result<Vec<f32>> {
        let metadata = self.metadata().await?;
        let result = self.run_predict(&metadata, batch).await;
        if result.is_err() {
            self.invalidate_metadata().await;
        }
        result
    }

    async fn input_size(&self) -> Result<ImageSize> {
        self.metadata().await?.image_size()
    }

    fn resize_mode(&self) -> ResizeMode {
        self.config.resize_mode
    }
}

/// Awaits a unary call, giving up once `deadline` has passed.
async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<tonic::Response<T>, Status>>,
{
    match tokio::time::timeout(deadline, call).await {
        Err(_) => Err(Error::Timeout(deadline)),
        Ok(Err(status)) => Err(status_to_error(status, deadline)),
        Ok(Ok(response)) => Ok(response.into_inner()),
    }
}

fn status_to_error(status: Status, deadline: Duration) -> Error {
    match status.code() {
        Code::DeadlineExceeded => Error::Timeout(deadline),
        // the channel enforces the request's grpc-timeout itself and reports it as Cancelled
        Code::Cancelled if status.message() == REQUEST_TIMEOUT_MESSAGE => Error::Timeout(deadline),
        Code::Unavailable => Error::Unavailable(status.message().to_string()),
        // transport failures surface as Unknown with the hyper error as source
        Code::Unknown if status.source().is_some() => {
            Error::Unavailable(status.message().to_string())
        }
        code => Error::Backend(format!("{:?}: {}", code, status.message())),
    }
}

fn scores_from_tensor(tensor: &TensorProto) -> Result<Vec<f32>> {
    if !tensor.float_val.is_empty() {
        return Ok(tensor.float_val.clone());
    }
    if !tensor.tensor_content.is_empty() {
        if tensor.tensor_content.len() % 4 != 0 {
            return Err(Error::Backend("tensor_content is not a float buffer".to_string()));
        }
        return Ok(tensor
            .tensor_content
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect());
    }
    if !tensor.double_val.is_empty() {
        return Ok(tensor.double_val.iter().map(|&v| v as f32).collect());
    }
    Err(Error::Backend("output tensor is empty".to_string()))
}
