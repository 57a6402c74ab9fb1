use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ndarray::Array4;
use tract_core::prelude::Tensor;
use tract_onnx::prelude::*;
use tracing::info;

use super::ScoreBackend;
use crate::error::{Error, Result};
use crate::image_utils::{ImageSize, ResizeMode};

type Plan = TypedRunnableModel<TypedModel>;

/// Fixed set of instances handed out round-robin, each usable by one caller at a time.
pub(crate) struct InstancePool<T> {
    slots: Vec<Arc<Mutex<T>>>,
    next: AtomicUsize,
}

impl<T> InstancePool<T> {
    pub(crate) fn new(instances: Vec<T>) -> Self {
        Self {
            slots: instances.into_iter().map(|i| Arc::new(Mutex::new(i))).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn checkout(&self) -> Arc<Mutex<T>> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        Arc::clone(&self.slots[slot])
    }
}

pub(crate) fn lock<T>(slot: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    slot.lock()
        .map_err(|_| Error::Server("interpreter slot poisoned".to_string()))
}

/// On-disk ONNX classifier executed in-process with tract.
///
/// The model is loaded once into `pool_size` independent plans. A plan is
/// only ever run by the holder of its lock, so at most `pool_size`
/// predictions execute at the same time.
pub struct LocalInterpreter {
    pool: InstancePool<Plan>,
    input_size: ImageSize,
    resize_mode: ResizeMode,
}

impl LocalInterpreter {
    pub fn load(
        path: impl AsRef<Path>,
        input_size: ImageSize,
        pool_size: usize,
        resize_mode: ResizeMode,
    ) -> Result<Self> {
        let path = path.as_ref();
        let pool_size = pool_size.max(1);
        let plans = (0..pool_size)
            .map(|_| load_plan(path, input_size))
            .collect::<TractResult<Vec<_>>>()
            .map_err(|e| {
                Error::Backend(format!("Model loading error for {}: {}", path.display(), e))
            })?;

        info!(
            path = %path.display(),
            height = input_size.height,
            width = input_size.width,
            pool_size,
            "Loaded local interpreter"
        );

        Ok(Self {
            pool: InstancePool::new(plans),
            input_size,
            resize_mode,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }
}

fn load_plan(path: &Path, size: ImageSize) -> TractResult<Plan> {
    tract_onnx::onnx()
        .model_for_path(path)?
        .with_input_fact(
            0,
            f32::fact([1, size.height as usize, size.width as usize, 3]).into(),
        )?
        .into_optimized()?
        .into_runnable()
}

#[async_trait]
impl ScoreBackend for LocalInterpreter {
    async fn predict(&self, batch: Array4<f32>) -> Result<Vec<f32>> {
        let slot = self.pool.checkout();
        tokio::task::spawn_blocking(move || {
            let plan = lock(&slot)?;
            let input: Tensor = batch.into();
            let outputs = plan
                .run(tvec!(input.into()))
                .map_err(|e| Error::Backend(format!("Inference error: {}", e)))?;
            let scores = outputs
                .first()
                .ok_or_else(|| Error::Backend("model produced no output".to_string()))?
                .to_array_view::<f32>()
                .map_err(|e| Error::Backend(format!("unexpected output type: {}", e)))?;
            Ok(scores.iter().copied().collect())
        })
        .await
        .map_err(|e| Error::Server(format!("interpreter task failed: {}", e)))?
    }

    async fn input_size(&self) -> Result<ImageSize> {
        Ok(self.input_size)
    }

    fn resize_mode(&self) -> ResizeMode {
        self.resize_mode
    }
}
