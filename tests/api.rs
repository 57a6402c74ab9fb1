use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{http::header, http::StatusCode, test, web, App};
use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{Array3, Array4};
use serde_json::{json, Value};

use oct_triage::backends::{BackendKind, ScoreBackend};
use oct_triage::cache::PredictionCache;
use oct_triage::dispatcher::Dispatcher;
use oct_triage::gradcam::GradientSource;
use oct_triage::handlers;
use oct_triage::image_utils::{encode_png, ImageSize};
use oct_triage::report::ReportConfig;
use oct_triage::state::{AppState, PredictSettings};
use oct_triage::storage::{InMemoryStore, UrlMode};
use oct_triage::Result;

const BOUNDARY: &str = "----octboundary";

struct Scores {
    scores: Vec<f32>,
    calls: AtomicUsize,
}

impl Scores {
    fn new(scores: &[f32]) -> Arc<Self> {
        Arc::new(Self {
            scores: scores.to_vec(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ScoreBackend for Scores {
    async fn predict(&self, batch: Array4<f32>) -> Result<Vec<f32>> {
        assert_eq!(batch.shape(), &[1, 16, 16, 3]);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.scores.clone())
    }

    async fn input_size(&self) -> Result<ImageSize> {
        Ok(ImageSize::square(16))
    }
}

struct CenterSpot;

// Explains at a coarser resolution than the 16px classifier fake.
impl GradientSource for CenterSpot {
    fn input_size(&self) -> ImageSize {
        ImageSize::square(8)
    }

    fn activations_and_gradients(
        &self,
        batch: &Array4<f32>,
        _class_index: usize,
    ) -> Result<(Array3<f32>, Array3<f32>)> {
        assert_eq!(batch.shape(), &[1, 8, 8, 3]);
        let mut activations = Array3::<f32>::zeros((3, 3, 1));
        activations[[1, 1, 0]] = 1.0;
        Ok((activations, Array3::from_elem((3, 3, 1), 1.0)))
    }
}

fn settings() -> PredictSettings {
    PredictSettings {
        default_backend: BackendKind::TfLite,
        confidence_threshold: 80.0,
        uploaded_images_path: "uploads".to_string(),
        gradcam_images_path: "gradcam".to_string(),
        gradcam_alpha: 0.5,
        image_url_mode: UrlMode::Public,
        max_upload_bytes: 1024 * 1024,
    }
}

fn reports() -> ReportConfig {
    ReportConfig {
        title: "OCT Prediction Summary Report.".to_string(),
        reports_path: "pdf_reports".to_string(),
        logo_path: None,
        url_mode: UrlMode::Signed {
            expires: Duration::from_secs(604_800),
        },
    }
}

fn state(dispatcher: Dispatcher, store: Arc<InMemoryStore>) -> AppState {
    AppState::new(settings(), dispatcher, store, reports())
}

fn scan_png() -> Vec<u8> {
    let img = RgbImage::from_fn(32, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, 90]));
    encode_png(&DynamicImage::ImageRgb8(img)).unwrap()
}

fn other_scan_png() -> Vec<u8> {
    let img = RgbImage::from_pixel(32, 24, Rgb([40, 40, 40]));
    encode_png(&DynamicImage::ImageRgb8(img)).unwrap()
}

fn multipart(field: &str, filename: Option<&str>, bytes: &[u8]) -> Vec<u8> {
    let disposition = match filename {
        Some(name) => format!("form-data; name=\"{}\"; filename=\"{}\"", field, name),
        None => format!("form-data; name=\"{}\"", field),
    };
    let mut body = format!(
        "--{}\r\nContent-Disposition: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
        BOUNDARY, disposition
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn upload_request(uri: &str, body: Vec<u8>) -> test::TestRequest {
    test::TestRequest::post()
        .uri(uri)
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        ))
        .set_payload(body)
}

#[actix_rt::test]
async fn health_lists_configured_backends() {
    let dispatcher = Dispatcher::new().with_backend(BackendKind::TfLite, Scores::new(&[0.0; 4]));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(dispatcher, Arc::new(InMemoryStore::new()))))
            .configure(handlers::routes),
    )
    .await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({"status": "ok", "backends": ["tf-lite"]}));
}

#[actix_rt::test]
async fn predict_uses_default_backend_and_stores_the_upload() {
    let backend = Scores::new(&[0.1, 0.7, 0.1, 0.1]);
    let store = Arc::new(InMemoryStore::new());
    let dispatcher = Dispatcher::new().with_backend(BackendKind::TfLite, backend.clone());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(dispatcher, store.clone())))
            .configure(handlers::routes),
    )
    .await;

    let png = scan_png();
    let resp = test::call_service(
        &app,
        upload_request("/predict", multipart("file", Some("scan.png"), &png)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["predictedLabel"], "DME");
    assert_eq!(body["assignedLabel"], "DME");
    assert_eq!(body["predictionConfidence"], 70.0);
    assert_eq!(body["isConfirmed"], "false");
    assert_eq!(body["filename"], "scan.png");
    assert_eq!(body["uploadedImageUrl"], "memory://uploads/scan.png");
    assert_eq!(body["gradCamImageUrl"], body["uploadedImageUrl"]);
    assert!(body["inferenceTime"].as_f64().unwrap() >= 0.0);

    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    let stored = store.get("uploads/scan.png").unwrap();
    assert_eq!(stored.bytes, png);
    assert_eq!(stored.content_type, "image/png");
}

#[actix_rt::test]
async fn only_the_selected_backend_is_called() {
    let lite = Scores::new(&[0.0, 0.0, 0.0, 1.0]);
    let serving = Scores::new(&[0.95, 0.05, 0.0, 0.0]);
    let dispatcher = Dispatcher::new()
        .with_backend(BackendKind::TfLite, lite.clone())
        .with_backend(BackendKind::TfServing, serving.clone());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(dispatcher, Arc::new(InMemoryStore::new()))))
            .configure(handlers::routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        upload_request("/predict/tf-serving", multipart("file", Some("a.png"), &scan_png())).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["predictedLabel"], "CNV");
    assert_eq!(body["predictionConfidence"], 95.0);
    assert_eq!(body["isConfirmed"], "true");

    assert_eq!(serving.calls.load(Ordering::SeqCst), 1);
    assert_eq!(lite.calls.load(Ordering::SeqCst), 0);
}

#[actix_rt::test]
async fn unnamed_uploads_get_a_generated_filename() {
    let dispatcher =
        Dispatcher::new().with_backend(BackendKind::TfLite, Scores::new(&[0.0, 0.0, 1.0, 0.0]));
    let store = Arc::new(InMemoryStore::new());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(dispatcher, store.clone())))
            .configure(handlers::routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        upload_request("/predict/tf-lite", multipart("file", None, &scan_png())).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    let filename = body["filename"].as_str().unwrap();
    assert!(filename.ends_with(".png"));
    assert_eq!(store.paths(), vec![format!("uploads/{}", filename)]);
}

#[actix_rt::test]
async fn gradcam_overlay_is_stored_next_to_the_upload() {
    let dispatcher =
        Dispatcher::new().with_backend(BackendKind::TfLite, Scores::new(&[0.0, 0.0, 0.9, 0.1]));
    let store = Arc::new(InMemoryStore::new());
    let app_state = state(dispatcher, store.clone()).with_gradcam(Arc::new(CenterSpot));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(app_state))
            .configure(handlers::routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        upload_request("/predict", multipart("file", Some("left eye.png"), &scan_png())).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["predictedLabel"], "DRUSEN");
    assert_eq!(body["gradCamImageUrl"], "memory://gradcam/left eye_gradcam.png");

    let overlay = store.get("gradcam/left eye_gradcam.png").unwrap();
    let decoded = image::load_from_memory(&overlay.bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 24));
}

#[actix_rt::test]
async fn unknown_backend_is_not_found() {
    let lite = Scores::new(&[0.25; 4]);
    let dispatcher = Dispatcher::new().with_backend(BackendKind::TfLite, lite.clone());
    let store = Arc::new(InMemoryStore::new());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(dispatcher, store.clone())))
            .configure(handlers::routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        upload_request("/predict/pytorch", multipart("file", Some("a.png"), &scan_png())).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], true);
    assert!(body["message"].as_str().unwrap().contains("pytorch"));
    assert_eq!(lite.calls.load(Ordering::SeqCst), 0);
    assert!(store.paths().is_empty());
}

#[actix_rt::test]
async fn unconfigured_backend_is_unavailable() {
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(Dispatcher::new(), Arc::new(InMemoryStore::new()))))
            .configure(handlers::routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        upload_request("/predict/ai-platform", multipart("file", Some("a.png"), &scan_png())).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/info/dense_net").to_request()).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[actix_rt::test]
async fn invalid_image_is_a_bad_request() {
    let backend = Scores::new(&[0.25; 4]);
    let dispatcher = Dispatcher::new().with_backend(BackendKind::TfLite, backend.clone());
    let store = Arc::new(InMemoryStore::new());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(dispatcher, store.clone())))
            .configure(handlers::routes),
    )
    .await;

    let resp = test::call_service(
        &app,
        upload_request("/predict", multipart("file", Some("notes.txt"), b"plain text, not a scan")).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    assert!(store.paths().is_empty());

    let resp = test::call_service(
        &app,
        upload_request("/predict", multipart("image", Some("a.png"), &scan_png())).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_rt::test]
async fn truncated_image_stores_nothing() {
    let backend = Scores::new(&[0.25; 4]);
    let dispatcher = Dispatcher::new().with_backend(BackendKind::TfLite, backend.clone());
    let store = Arc::new(InMemoryStore::new());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(dispatcher, store.clone())))
            .configure(handlers::routes),
    )
    .await;

    // the PNG signature survives so the format still sniffs
    let png = scan_png();
    let cut = &png[..png.len() / 2];
    let resp = test::call_service(
        &app,
        upload_request("/predict", multipart("file", Some("cut.png"), cut)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    assert!(store.get("uploads/cut.png").is_none());
    assert!(store.paths().is_empty());
}

#[actix_rt::test]
async fn cached_predictions_skip_backend_and_upload() {
    let lite = Scores::new(&[0.1, 0.7, 0.1, 0.1]);
    let serving = Scores::new(&[0.9, 0.1, 0.0, 0.0]);
    let dispatcher = Dispatcher::new()
        .with_backend(BackendKind::TfLite, lite.clone())
        .with_backend(BackendKind::TfServing, serving.clone());
    let store = Arc::new(InMemoryStore::new());
    let app_state = state(dispatcher, store.clone()).with_cache(PredictionCache::new(4));
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(app_state))
            .configure(handlers::routes),
    )
    .await;

    let first_png = scan_png();
    let resp = test::call_service(
        &app,
        upload_request("/predict/tf-lite", multipart("file", Some("scan.png"), &first_png)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let first: Value = test::read_body_json(resp).await;

    let resp = test::call_service(
        &app,
        upload_request("/predict/tf-lite", multipart("file", Some("scan.png"), &other_scan_png()))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let second: Value = test::read_body_json(resp).await;

    assert_eq!(first, second);
    assert_eq!(lite.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get("uploads/scan.png").unwrap().bytes, first_png);

    // same filename on another backend is a separate entry
    let resp = test::call_service(
        &app,
        upload_request("/predict/tf-serving", multipart("file", Some("scan.png"), &first_png))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["predictedLabel"], "CNV");
    assert_eq!(serving.calls.load(Ordering::SeqCst), 1);
    assert_eq!(lite.calls.load(Ordering::SeqCst), 1);
}

#[actix_rt::test]
async fn report_is_rendered_and_stored() {
    let store = Arc::new(InMemoryStore::new());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(Dispatcher::new(), store.clone())))
            .configure(handlers::routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/report")
        .set_json(json!({
            "predictionData": [{
                "uploadedImageUrl": "memory://uploads/a.png",
                "gradCamImageUrl": "memory://uploads/a.png",
                "predictedLabel": "DME",
                "assignedLabel": "NORMAL",
                "predictionConfidence": 70.0,
                "filename": "a.png",
                "isConfirmed": "false",
                "inferenceTime": 0.01,
            }]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    let url = body["reportUrl"].as_str().unwrap();
    assert!(url.starts_with("memory://pdf_reports/oct_summary_report_"));
    assert!(url.ends_with(".pdf?expires=604800"));

    let paths = store.paths();
    assert_eq!(paths.len(), 1);
    assert!(store.get(&paths[0]).unwrap().bytes.starts_with(b"%PDF"));
}

#[actix_rt::test]
async fn malformed_report_body_is_a_bad_request() {
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(Dispatcher::new(), Arc::new(InMemoryStore::new()))))
            .configure(handlers::routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/report")
        .set_json(json!({"records": []}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], true);
}
