//! Routes a batch to the selected backend and turns its scores into a label.

use std::sync::Arc;

use ndarray::Array4;
use serde::Serialize;
use tracing::debug;

use crate::backends::{BackendKind, ScoreBackend};
use crate::error::{Error, Result};
use crate::image_utils::{ImageSize, ResizeMode};
use crate::labels::OctLabel;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub label: OctLabel,
    /// Percentage in `[0, 100]`.
    pub confidence: f64,
}

// float rounding in a softmax can land just outside [0, 1]
const PROBABILITY_SLACK: f32 = 1e-4;

/// Picks the best-scoring class.
///
/// Scores must be probabilities. Ties resolve to the lowest class index.
/// Confidence is the top score rounded to four decimals, expressed as a
/// percentage.
pub fn classify(scores: &[f32]) -> Result<Prediction> {
    if scores.len() != OctLabel::COUNT {
        return Err(Error::InvalidScores(format!(
            "expected {} scores, got {}",
            OctLabel::COUNT,
            scores.len()
        )));
    }
    if let Some(bad) = scores.iter().find(|s| !s.is_finite()) {
        return Err(Error::InvalidScores(format!("non-finite score {}", bad)));
    }
    if let Some(bad) = scores
        .iter()
        .find(|&&s| s < -PROBABILITY_SLACK || s > 1.0 + PROBABILITY_SLACK)
    {
        return Err(Error::InvalidScores(format!(
            "score {} is not a probability",
            bad
        )));
    }

    let mut best = 0;
    for (i, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = i;
        }
    }

    let label = OctLabel::from_index(best)
        .ok_or_else(|| Error::InvalidScores(format!("no label for index {}", best)))?;
    let top = (scores[best] as f64).clamp(0.0, 1.0);
    let confidence = (top * 10_000.0).round() / 100.0;

    Ok(Prediction { label, confidence })
}

/// One handle per backend kind. Unconfigured backends stay `None`.
#[derive(Clone, Default)]
pub struct Dispatcher {
    serving: Option<Arc<dyn ScoreBackend>>,
    interpreter: Option<Arc<dyn ScoreBackend>>,
    ai_platform: Option<Arc<dyn ScoreBackend>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, kind: BackendKind, backend: Arc<dyn ScoreBackend>) -> Self {
        match kind {
            BackendKind::TfServing => self.serving = Some(backend),
            BackendKind::TfLite => self.interpreter = Some(backend),
            BackendKind::AiPlatform => self.ai_platform = Some(backend),
        }
        self
    }

    pub fn backend(&self, kind: BackendKind) -> Result<&dyn ScoreBackend> {
        let backend = match kind {
            BackendKind::TfServing => &self.serving,
            BackendKind::TfLite => &self.interpreter,
            BackendKind::AiPlatform => &self.ai_platform,
        };
        backend
            .as_deref()
            .ok_or(Error::BackendNotConfigured(kind))
    }

    pub fn configured(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| self.backend(*kind).is_ok())
            .collect()
    }

    /// Input size and resize mode the selected backend expects.
    pub async fn input_spec(&self, kind: BackendKind) -> Result<(ImageSize, ResizeMode)> {
        let backend = self.backend(kind)?;
        Ok((backend.input_size().await?, backend.resize_mode()))
    }

    pub async fn predict(&self, kind: BackendKind, batch: Array4<f32>) -> Result<Prediction> {
        let scores = self.backend(kind)?.predict(batch).await?;
        debug!(backend = %kind, ?scores, "raw scores");
        classify(&scores)
    }
}
