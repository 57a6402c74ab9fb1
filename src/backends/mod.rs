//! Model backends reachable from the prediction endpoints.
//!
//! Every backend takes a normalized `(1, H, W, 3)` batch and returns the raw
//! class scores, indexed in [`OctLabel`](crate::labels::OctLabel) order.

mod ai_platform;
mod interpreter;
pub mod proto;
mod serving;

pub use ai_platform::{AiPlatformBackend, AiPlatformConfig};
pub use interpreter::LocalInterpreter;
pub use serving::{ModelMetadata, ServingBackend, ServingConfig};

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image_utils::{ImageSize, ResizeMode};

/// Selector for the three prediction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "tf-serving")]
    TfServing,
    #[serde(rename = "tf-lite")]
    TfLite,
    #[serde(rename = "ai-platform")]
    AiPlatform,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::TfServing,
        BackendKind::TfLite,
        BackendKind::AiPlatform,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::TfServing => "tf-serving",
            BackendKind::TfLite => "tf-lite",
            BackendKind::AiPlatform => "ai-platform",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownBackend(s.to_string()))
    }
}

#[async_trait]
pub trait ScoreBackend: Send + Sync {
    /// Runs the classifier on a single-image batch and returns its raw scores.
    async fn predict(&self, batch: Array4<f32>) -> Result<Vec<f32>>;

    /// Spatial input size the model expects.
    async fn input_size(&self) -> Result<ImageSize>;

    fn resize_mode(&self) -> ResizeMode {
        ResizeMode::Smart
    }
}
