use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use image::{DynamicImage, ImageFormat};
use tracing::{debug, info};
use uuid::Uuid;

use crate::backends::BackendKind;
use crate::error::{Error, Result};
use crate::gradcam;
use crate::image_utils::{decode, encode_png, prepare, sniff_format};
use crate::models::{HealthResponse, PredictionResponse, ReportRequest, ReportResponse};
use crate::state::AppState;

const UPLOAD_FIELD: &str = "file";

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| Error::BadRequest(err.to_string()).into()),
    )
    .service(web::resource("/").route(web::get().to(home)))
    .service(web::resource("/info").route(web::get().to(default_model_info)))
    .service(web::resource("/info/{model_name}").route(web::get().to(model_info)))
    .service(web::resource("/predict").route(web::post().to(predict)))
    .service(web::resource("/predict/{backend}").route(web::post().to(predict_with_backend)))
    .service(web::resource("/report").route(web::post().to(report)));
}

pub async fn home(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        backends: state.dispatcher.configured(),
    })
}

pub async fn default_model_info(state: web::Data<AppState>) -> Result<HttpResponse> {
    let serving = state
        .serving
        .as_ref()
        .ok_or(Error::BackendNotConfigured(BackendKind::TfServing))?;
    Ok(HttpResponse::Ok().json(serving.metadata().await?))
}

pub async fn model_info(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let serving = state
        .serving
        .as_ref()
        .ok_or(Error::BackendNotConfigured(BackendKind::TfServing))?;
    let metadata = serving.fetch_metadata(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(metadata))
}

pub async fn predict(payload: Multipart, state: web::Data<AppState>) -> Result<HttpResponse> {
    let kind = state.settings.default_backend;
    let response = run_prediction(&state, kind, payload).await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn predict_with_backend(
    path: web::Path<String>,
    payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let kind = BackendKind::from_str(&path.into_inner())?;
    let response = run_prediction(&state, kind, payload).await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn report(
    body: web::Json<ReportRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let records = body.into_inner().prediction_data;
    let report_url = state.reports.generate(records).await?;
    Ok(HttpResponse::Ok().json(ReportResponse { report_url }))
}

struct Upload {
    filename: Option<String>,
    bytes: Vec<u8>,
}

fn multipart_error(e: actix_multipart::MultipartError) -> Error {
    Error::BadRequest(format!("malformed multipart body: {}", e))
}

/// Keeps only the last path component of a client supplied name.
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_string())
    }
}

async fn read_upload(mut payload: Multipart, limit: usize) -> Result<Upload> {
    while let Some(item) = payload.next().await {
        let mut field = item.map_err(multipart_error)?;
        let disposition = field.content_disposition();
        let name = disposition.get_name().map(str::to_owned);
        let filename = disposition.get_filename().and_then(sanitize_filename);

        if name.as_deref() != Some(UPLOAD_FIELD) {
            while let Some(chunk) = field.next().await {
                chunk.map_err(multipart_error)?;
            }
            continue;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let data = chunk.map_err(multipart_error)?;
            if bytes.len() + data.len() > limit {
                return Err(Error::BadRequest(format!(
                    "upload is larger than {} bytes",
                    limit
                )));
            }
            bytes.extend_from_slice(&data);
        }
        return Ok(Upload { filename, bytes });
    }

    Err(Error::BadRequest(format!(
        "multipart field '{}' is missing",
        UPLOAD_FIELD
    )))
}

fn content_type(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::Gif => "image/gif",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Tiff => "image/tiff",
        ImageFormat::WebP => "image/webp",
        _ => "application/octet-stream",
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

async fn run_prediction(
    state: &AppState,
    kind: BackendKind,
    payload: Multipart,
) -> Result<PredictionResponse> {
    let settings = &state.settings;
    state.dispatcher.backend(kind)?;

    let upload = read_upload(payload, settings.max_upload_bytes).await?;
    let (format, extension) = sniff_format(&upload.bytes)?;
    let filename = upload
        .filename
        .unwrap_or_else(|| format!("{}.{}", Uuid::new_v4(), extension));

    if let Some(cached) = state.cache.get(kind, &filename) {
        debug!(backend = %kind, filename = %filename, "Serving cached prediction");
        return Ok(cached);
    }

    // nothing is stored unless the whole image decodes
    let (size, mode) = state.dispatcher.input_spec(kind).await?;
    let bytes = upload.bytes;
    let (bytes, original, batch) = web::block(move || {
        let original = decode(&bytes)?;
        let batch = prepare(&original, size, mode);
        Ok::<_, Error>((bytes, original, batch))
    })
    .await??;

    let image_path = format!(
        "{}/{}",
        settings.uploaded_images_path.trim_end_matches('/'),
        filename
    );
    state
        .store
        .upload(&image_path, bytes, content_type(format))
        .await?;
    let uploaded_image_url = state.store.url_for(&image_path, settings.image_url_mode)?;

    let started = Instant::now();
    let prediction = state.dispatcher.predict(kind, batch).await?;
    let inference_time = started.elapsed().as_secs_f64();

    let grad_cam_image_url = match state.gradcam.clone() {
        Some(source) => {
            let label = prediction.label;
            let alpha = settings.gradcam_alpha;
            let png = web::block(move || {
                let overlay = gradcam::explain(source.as_ref(), &original, mode, label, alpha)?;
                encode_png(&DynamicImage::ImageRgb8(overlay))
            })
            .await??;

            let stem = Path::new(&filename)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("upload");
            let gradcam_path = format!(
                "{}/{}_gradcam.png",
                settings.gradcam_images_path.trim_end_matches('/'),
                stem
            );
            state.store.upload(&gradcam_path, png, "image/png").await?;
            state.store.url_for(&gradcam_path, settings.image_url_mode)?
        }
        None => uploaded_image_url.clone(),
    };

    let confidence = round4(prediction.confidence);
    let response = PredictionResponse {
        uploaded_image_url,
        grad_cam_image_url,
        predicted_label: prediction.label,
        assigned_label: prediction.label,
        prediction_confidence: confidence,
        is_confirmed: (confidence >= settings.confidence_threshold).to_string(),
        filename,
        inference_time: round4(inference_time),
    };

    info!(
        backend = %kind,
        filename = %response.filename,
        label = %prediction.label,
        confidence,
        inference_time,
        "Prediction served"
    );

    state.cache.insert(kind, &response.filename, response.clone());
    Ok(response)
}
