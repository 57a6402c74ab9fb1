//! Environment-driven configuration.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::backends::{AiPlatformConfig, BackendKind, ServingConfig};
use crate::image_utils::{ImageSize, ResizeMode};
use crate::storage::{GcsConfig, HmacKey, MAX_SIGNED_URL_EXPIRY};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{key}={value} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Gcs(GcsConfig),
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub uploaded_images_path: String,
    pub gradcam_images_path: String,
    pub reports_path: String,
    pub logo_path: Option<String>,
    pub access_token: Option<String>,
    pub signed_url_expiry: Duration,
}

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub model_file: PathBuf,
    pub pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub default_backend: BackendKind,
    pub image_size: ImageSize,
    pub resize_mode: ResizeMode,
    pub confidence_threshold: f64,
    pub serving: Option<ServingConfig>,
    pub interpreter: Option<InterpreterConfig>,
    pub ai_platform: Option<AiPlatformConfig>,
    pub gradcam_model_file: Option<PathBuf>,
    /// Input resolution of the Grad-CAM export, independent of the selected backend.
    pub gradcam_image_size: ImageSize,
    pub gradcam_alpha: f32,
    pub storage: StorageConfig,
    pub report_title: String,
    pub prediction_cache_size: usize,
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, key: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default_ms).map(Duration::from_millis)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let image_size = ImageSize::square(env.parse("IMAGE_SIZE", 80u32)?);
        if image_size.height == 0 {
            return Err(ConfigError::Invalid {
                key: "IMAGE_SIZE",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let gradcam_image_size =
            ImageSize::square(env.parse("GRADCAM_IMAGE_SIZE", image_size.height)?);
        if gradcam_image_size.height == 0 {
            return Err(ConfigError::Invalid {
                key: "GRADCAM_IMAGE_SIZE",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let resize_mode: ResizeMode = env.parse("RESIZE_MODE", ResizeMode::Smart)?;

        let serving = match env.get("MODEL_URI") {
            Some(uri) => Some(ServingConfig {
                uri,
                model_name: env.string("SERVING_MODEL_NAME", "dense_net"),
                signature_name: env.string("SERVING_SIGNATURE", "serving_default"),
                metadata_timeout: env.millis("METADATA_TIMEOUT_MS", 2_000)?,
                predict_timeout: env.millis("PREDICT_TIMEOUT_MS", 5_000)?,
                metadata_ttl: Duration::from_secs(env.parse("METADATA_TTL_SECS", 300u64)?),
                resize_mode,
            }),
            None => None,
        };

        let interpreter = match env.get("TF_LITE_MODEL_FILE") {
            Some(path) => Some(InterpreterConfig {
                model_file: PathBuf::from(path),
                pool_size: env.parse("INTERPRETER_POOL_SIZE", 1usize)?.max(1),
            }),
            None => None,
        };

        let ai_platform = match env.get("AI_PLATFORM_PROJECT") {
            Some(project) => Some(AiPlatformConfig {
                project,
                region: env.string("AI_PLATFORM_REGION", "us-central1"),
                model: env.string("AI_PLATFORM_MODEL", "samsung-oct-classifier"),
                version: Some(env.string("AI_PLATFORM_VERSION", "v1")),
                timeout: env.millis("AI_PLATFORM_TIMEOUT_MS", 10_000)?,
                input_size: image_size,
                resize_mode,
                endpoint: env.get("AI_PLATFORM_ENDPOINT"),
            }),
            None => None,
        };

        let hmac_key = match (env.get("GCS_HMAC_ACCESS_ID"), env.get("GCS_HMAC_SECRET")) {
            (Some(access_id), Some(secret)) => Some(HmacKey { access_id, secret }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("GCS_HMAC_SECRET")),
            (None, Some(_)) => return Err(ConfigError::Missing("GCS_HMAC_ACCESS_ID")),
        };

        let bucket = env.get("GCS_PROJECT_BUCKET");
        let default_store = if bucket.is_some() { "gcs" } else { "memory" };
        let backend = match env.string("STORAGE_BACKEND", default_store).as_str() {
            "gcs" => {
                let bucket = bucket.ok_or(ConfigError::Missing("GCS_PROJECT_BUCKET"))?;
                let mut gcs = GcsConfig::new(bucket);
                gcs.hmac_key = hmac_key;
                if let Some(base) = env.get("GCS_API_BASE") {
                    gcs.api_base = base.trim_end_matches('/').to_string();
                }
                StorageBackend::Gcs(gcs)
            }
            "memory" => StorageBackend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    key: "STORAGE_BACKEND",
                    value: other.to_string(),
                    reason: "expected gcs or memory".to_string(),
                })
            }
        };

        let signed_url_expiry =
            Duration::from_secs(env.parse("SIGNED_URL_EXPIRY_SECS", MAX_SIGNED_URL_EXPIRY.as_secs())?);
        if signed_url_expiry.is_zero() || signed_url_expiry > MAX_SIGNED_URL_EXPIRY {
            return Err(ConfigError::Invalid {
                key: "SIGNED_URL_EXPIRY_SECS",
                value: signed_url_expiry.as_secs().to_string(),
                reason: format!("must be between 1 and {}", MAX_SIGNED_URL_EXPIRY.as_secs()),
            });
        }

        let storage = StorageConfig {
            backend,
            uploaded_images_path: env.string("UPLOADED_IMAGES_GCS_PATH", "uploads"),
            gradcam_images_path: env.string("GRADCAM_IMAGES_GCS_PATH", "gradcam"),
            reports_path: env.string("REPORTS_GCS_PATH", "pdf_reports"),
            logo_path: env.get("LOGO_GCS_PATH"),
            access_token: env.get("GCS_ACCESS_TOKEN"),
            signed_url_expiry,
        };

        let confidence_threshold: f64 = env.parse("CONFIDENCE_THRESHOLD", 80.0)?;
        if !(0.0..=100.0).contains(&confidence_threshold) {
            return Err(ConfigError::Invalid {
                key: "CONFIDENCE_THRESHOLD",
                value: confidence_threshold.to_string(),
                reason: "must be a percentage".to_string(),
            });
        }

        Ok(Self {
            host: env.string("HOST", "0.0.0.0"),
            port: env.parse("PORT", 8080u16)?,
            max_upload_bytes: env.parse("MAX_UPLOAD_BYTES", 20 * 1024 * 1024usize)?,
            default_backend: env.parse("DEFAULT_BACKEND", BackendKind::TfLite)?,
            image_size,
            resize_mode,
            confidence_threshold,
            serving,
            interpreter,
            ai_platform,
            gradcam_model_file: env.get("GRADCAM_MODEL_FILE").map(PathBuf::from),
            gradcam_image_size,
            gradcam_alpha: env.parse("GRADCAM_ALPHA", crate::gradcam::DEFAULT_ALPHA)?,
            storage,
            report_title: env.string("REPORT_TITLE", crate::report::DEFAULT_TITLE),
            prediction_cache_size: env.parse("PREDICTION_CACHE_SIZE", 0usize)?,
        })
    }
}
