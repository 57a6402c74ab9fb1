//! Shared application state, built once at startup and handed to every worker.

use std::sync::Arc;

use tracing::{info, warn};

use crate::backends::{
    AiPlatformBackend, BackendKind, LocalInterpreter, ScoreBackend, ServingBackend,
};
use crate::cache::PredictionCache;
use crate::config::{Config, StorageBackend};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::gcp::TokenSource;
use crate::gradcam::{GradientSource, OnnxGradientModel};
use crate::report::{ReportConfig, ReportGenerator};
use crate::storage::{GcsStore, InMemoryStore, ObjectStore, UrlMode};

/// Per-request knobs of the prediction endpoints.
#[derive(Debug, Clone)]
pub struct PredictSettings {
    pub default_backend: BackendKind,
    pub confidence_threshold: f64,
    pub uploaded_images_path: String,
    pub gradcam_images_path: String,
    pub gradcam_alpha: f32,
    pub image_url_mode: UrlMode,
    pub max_upload_bytes: usize,
}

impl PredictSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_backend: config.default_backend,
            confidence_threshold: config.confidence_threshold,
            uploaded_images_path: config.storage.uploaded_images_path.clone(),
            gradcam_images_path: config.storage.gradcam_images_path.clone(),
            gradcam_alpha: config.gradcam_alpha,
            image_url_mode: UrlMode::Public,
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

pub struct AppState {
    pub settings: PredictSettings,
    pub dispatcher: Dispatcher,
    /// Kept separately for the metadata endpoint.
    pub serving: Option<Arc<ServingBackend>>,
    pub store: Arc<dyn ObjectStore>,
    pub gradcam: Option<Arc<dyn GradientSource>>,
    pub reports: ReportGenerator,
    pub cache: PredictionCache,
}

impl AppState {
    pub fn new(
        settings: PredictSettings,
        dispatcher: Dispatcher,
        store: Arc<dyn ObjectStore>,
        reports: ReportConfig,
    ) -> Self {
        Self {
            settings,
            dispatcher,
            serving: None,
            reports: ReportGenerator::new(store.clone(), reports),
            store,
            gradcam: None,
            cache: PredictionCache::disabled(),
        }
    }

    pub fn with_serving(mut self, backend: Arc<ServingBackend>) -> Self {
        self.dispatcher = self
            .dispatcher
            .with_backend(BackendKind::TfServing, backend.clone());
        self.serving = Some(backend);
        self
    }

    pub fn with_gradcam(mut self, source: Arc<dyn GradientSource>) -> Self {
        self.gradcam = Some(source);
        self
    }

    pub fn with_cache(mut self, cache: PredictionCache) -> Self {
        self.cache = cache;
        self
    }

    /// Builds every configured backend and store.
    ///
    /// Must run inside a Tokio runtime: the gRPC channel is created lazily on it.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Server(format!("HTTP client setup failed: {}", e)))?;

        let needs_cloud = matches!(config.storage.backend, StorageBackend::Gcs(_))
            || config.ai_platform.is_some();
        let tokens = Arc::new(match (&config.storage.access_token, needs_cloud) {
            (Some(token), _) => TokenSource::Static(token.clone()),
            (None, true) => TokenSource::metadata_server(client.clone()),
            (None, false) => TokenSource::Anonymous,
        });

        let (store, report_url_mode): (Arc<dyn ObjectStore>, UrlMode) =
            match &config.storage.backend {
                StorageBackend::Gcs(gcs) => {
                    let mode = if gcs.hmac_key.is_some() {
                        UrlMode::Signed {
                            expires: config.storage.signed_url_expiry,
                        }
                    } else {
                        warn!("No HMAC key configured, report URLs will not be signed");
                        UrlMode::Public
                    };
                    let store = GcsStore::new(gcs.clone(), client.clone(), tokens.clone());
                    (Arc::new(store), mode)
                }
                StorageBackend::Memory => {
                    info!("Using in-memory object store");
                    let mode = UrlMode::Signed {
                        expires: config.storage.signed_url_expiry,
                    };
                    (Arc::new(InMemoryStore::new()), mode)
                }
            };

        let mut dispatcher = Dispatcher::new();

        if let Some(interpreter) = &config.interpreter {
            let backend = LocalInterpreter::load(
                &interpreter.model_file,
                config.image_size,
                interpreter.pool_size,
                config.resize_mode,
            )?;
            dispatcher = dispatcher.with_backend(BackendKind::TfLite, Arc::new(backend));
        }

        if let Some(ai_platform) = &config.ai_platform {
            let backend: Arc<dyn ScoreBackend> = Arc::new(AiPlatformBackend::new(
                ai_platform.clone(),
                client.clone(),
                tokens.clone(),
            ));
            dispatcher = dispatcher.with_backend(BackendKind::AiPlatform, backend);
        }

        let reports = ReportConfig {
            title: config.report_title.clone(),
            reports_path: config.storage.reports_path.clone(),
            logo_path: config.storage.logo_path.clone(),
            url_mode: report_url_mode,
        };

        let mut state = Self::new(PredictSettings::from_config(config), dispatcher, store, reports)
            .with_cache(PredictionCache::new(config.prediction_cache_size));

        if let Some(serving) = &config.serving {
            state = state.with_serving(Arc::new(ServingBackend::new(serving.clone())?));
        }

        if let Some(path) = &config.gradcam_model_file {
            let model = OnnxGradientModel::load(path, config.gradcam_image_size)?;
            state = state.with_gradcam(Arc::new(model));
        }

        if state.dispatcher.backend(config.default_backend).is_err() {
            warn!(
                backend = %config.default_backend,
                "Default backend is not configured, /predict will answer 503"
            );
        }
        info!(backends = ?state.dispatcher.configured(), "Backends ready");

        Ok(state)
    }
}
