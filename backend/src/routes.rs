use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures::TryStreamExt;
use shared::{
    ClassificationResult, ClassifyResponse, HealthResponse, HistoryResponse, PredictRequest,
    PredictResponse,
};

use crate::error::ApiError;
use crate::history::{HistoryEntry, HistoryService};
use crate::imaging::loader::{fingerprint, ImageInput, ImageLoader, LoadError};
use crate::imaging::preprocess::Preprocessor;
use crate::model::handler::ModelHandler;
use crate::model::ModelError;

/// Headroom for the JSON envelope and patient fields around a base64 image.
const JSON_SLACK_BYTES: usize = 64 * 1024;

/// Shared state handed to every worker.
#[derive(Clone)]
pub struct AppServices {
    pub model: web::Data<ModelHandler>,
    pub preprocessor: web::Data<Preprocessor>,
    pub loader: web::Data<ImageLoader>,
    pub history: web::Data<HistoryService>,
}

impl AppServices {
    pub fn new(
        model: ModelHandler,
        preprocessor: Preprocessor,
        loader: ImageLoader,
        history: HistoryService,
    ) -> Self {
        Self {
            model: web::Data::new(model),
            preprocessor: web::Data::new(preprocessor),
            loader: web::Data::new(loader),
            history: web::Data::new(history),
        }
    }

    /// Base64 inflates the payload by a third, so the body limit follows the
    /// decoded image limit.
    pub fn json_limit(&self) -> usize {
        self.loader.max_bytes().saturating_mul(4) / 3 + JSON_SLACK_BYTES
    }
}

/// Registers state, the JSON extractor settings and all routes.
pub fn configure_services(cfg: &mut web::ServiceConfig, services: &AppServices) {
    let json_config = web::JsonConfig::default()
        .limit(services.json_limit())
        .error_handler(|err, _req| ApiError::InvalidJson(err.to_string()).into());

    cfg.app_data(json_config)
        .app_data(services.model.clone())
        .app_data(services.preprocessor.clone())
        .app_data(services.loader.clone())
        .app_data(services.history.clone());
    configure_routes(cfg);
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/predict").route(web::post().to(predict)))
        .service(web::resource("/classify").route(web::post().to(classify)))
        .service(web::resource("/history").route(web::get().to(history)))
        .service(web::resource("/health").route(web::get().to(health)));
}

async fn predict(
    model: web::Data<ModelHandler>,
    preprocessor: web::Data<Preprocessor>,
    loader: web::Data<ImageLoader>,
    history: web::Data<HistoryService>,
    payload: web::Json<PredictRequest>,
) -> Result<HttpResponse, ApiError> {
    let PredictRequest {
        base64_image,
        image_url,
        patient,
    } = payload.into_inner();

    let input = select_input(image_url, base64_image)?;
    if !model.is_loaded() {
        return Err(ModelError::NotLoaded.into());
    }

    let image_source = input.source();
    let bytes = loader.acquire(input).await?;
    let image_sha256 = fingerprint(&bytes);
    log::info!(
        "Classifying {} image ({} bytes, sha256 {})",
        image_source,
        bytes.len(),
        image_sha256
    );

    let result = run_pipeline(model, preprocessor, loader, bytes).await?;

    history
        .record(HistoryEntry {
            patient,
            result: result.clone(),
            image_source,
            image_sha256,
        })
        .await;

    Ok(HttpResponse::Ok().json(PredictResponse::new(result)))
}

async fn classify(
    model: web::Data<ModelHandler>,
    preprocessor: web::Data<Preprocessor>,
    loader: web::Data<ImageLoader>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    if !model.is_loaded() {
        return Err(ModelError::NotLoaded.into());
    }

    let upload = read_upload(&mut payload, loader.max_bytes()).await?;
    let bytes = loader.acquire(ImageInput::Upload(upload)).await?;
    log::info!("Classifying uploaded image ({} bytes)", bytes.len());

    let result = run_pipeline(model, preprocessor, loader, bytes).await?;
    Ok(HttpResponse::Ok().json(ClassifyResponse::from(result)))
}

async fn history(history: web::Data<HistoryService>) -> Result<HttpResponse, ApiError> {
    let records = history.list().await?;
    Ok(HttpResponse::Ok().json(HistoryResponse {
        success: true,
        records,
    }))
}

async fn health(model: web::Data<ModelHandler>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse::from_model_state(model.is_loaded()))
}

/// Exactly one non-blank image source must be present.
fn select_input(
    image_url: Option<String>,
    base64_image: Option<String>,
) -> Result<ImageInput, ApiError> {
    let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

    match (present(image_url), present(base64_image)) {
        (Some(url), None) => Ok(ImageInput::Url(url)),
        (None, Some(data)) => Ok(ImageInput::Base64(data)),
        (None, None) => Err(ApiError::MissingInput(
            "No image provided. Send either image_url or base64_image".to_string(),
        )),
        (Some(_), Some(_)) => Err(ApiError::MissingInput(
            "Provide only one of image_url or base64_image".to_string(),
        )),
    }
}

/// Decode, preprocess and infer off the async workers.
async fn run_pipeline(
    model: web::Data<ModelHandler>,
    preprocessor: web::Data<Preprocessor>,
    loader: web::Data<ImageLoader>,
    bytes: Vec<u8>,
) -> Result<ClassificationResult, ApiError> {
    web::block(move || -> Result<ClassificationResult, ApiError> {
        let image = loader.decode(&bytes)?;
        let tensor = preprocessor.tensor(&image)?;
        Ok(model.predict(tensor.view())?)
    })
    .await?
}

/// Reads the first file part of a multipart body. Parts without a filename
/// or content type are skipped.
async fn read_upload(payload: &mut Multipart, max_bytes: usize) -> Result<Vec<u8>, ApiError> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| ApiError::InvalidMultipart(e.to_string()))?
    {
        let has_filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .is_some();
        let content_type = field.content_type().map(|mime| mime.essence_str().to_string());
        if !has_filename && content_type.is_none() {
            continue;
        }

        match content_type {
            Some(mime) if mime.starts_with("image/") => {}
            _ => return Err(ApiError::UnsupportedMedia),
        }

        let mut data = Vec::new();
        while let Some(chunk) = field
            .try_next()
            .await
            .map_err(|e| ApiError::InvalidMultipart(e.to_string()))?
        {
            if data.len() + chunk.len() > max_bytes {
                return Err(LoadError::TooLarge { limit: max_bytes }.into());
            }
            data.extend_from_slice(&chunk);
        }
        return Ok(data);
    }

    Err(ApiError::MissingInput("No image file uploaded".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::memory::MemoryHistoryStore;
    use crate::history::tests::FailingStore;
    use crate::imaging::loader::tests::{png_bytes, rgb_png};
    use crate::imaging::preprocess::TensorLayout;
    use crate::model::labels::LabelTable;
    use crate::model::runtime::mock::MockRuntime;
    use actix_web::http::{header, StatusCode};
    use actix_web::{test, App};
    use base64::{engine::general_purpose, Engine as _};
    use image::{DynamicImage, GrayImage};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const SCORES: [f32; 7] = [0.1, 0.05, 0.05, 0.6, 0.1, 0.05, 0.05];
    const BOUNDARY: &str = "dermascan-boundary";

    fn services(model: ModelHandler, history: HistoryService) -> AppServices {
        AppServices::new(
            model,
            Preprocessor::new(8, 8, TensorLayout::Nhwc),
            ImageLoader::new(Duration::from_secs(5), 1024 * 1024).unwrap(),
            history,
        )
    }

    fn unloaded_model() -> ModelHandler {
        ModelHandler::new(LabelTable::default(), Some(0.5), [1, 8, 8, 3])
    }

    fn loaded_model() -> (ModelHandler, Arc<AtomicUsize>) {
        let model = unloaded_model();
        let (runtime, calls) = MockRuntime::new(SCORES.to_vec());
        model.install(Box::new(runtime)).unwrap();
        (model, calls)
    }

    fn png_base64() -> String {
        general_purpose::STANDARD.encode(rgb_png(16, 12, [180, 90, 60]))
    }

    fn multipart_body(filename: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn classify_request(body: Vec<u8>) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/classify")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(body)
    }

    #[actix_web::test]
    async fn predict_classifies_base64_and_records_history() {
        let (model, calls) = loaded_model();
        let history = HistoryService::new(Arc::new(MemoryHistoryStore::new()));
        let services = services(model, history);
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/predict")
            .set_json(json!({
                "base64_image": png_base64(),
                "patient_name": "Ada",
                "patient_age": 36,
                "contact_no": 5551234,
                "scar_duration": 2
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["result"]["predicted_class"], "bcc");
        assert_eq!(body["result"]["description"], "Basal cell carcinoma");
        assert_eq!(body["result"]["probabilities"].as_array().unwrap().len(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let req = test::TestRequest::get().uri("/history").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        let records = body["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["patient_name"], "Ada");
        assert_eq!(records[0]["contact_no"], "5551234");
        assert_eq!(records[0]["image_source"], "base64");
        assert_eq!(records[0]["result"]["predicted_class"], "bcc");
        assert_eq!(records[0]["image_sha256"].as_str().unwrap().len(), 64);
    }

    #[actix_web::test]
    async fn predict_without_image_is_rejected_before_inference() {
        let (model, calls) = loaded_model();
        let services = services(model, HistoryService::disabled());
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        for payload in [
            json!({ "patient_name": "Ada" }),
            json!({ "image_url": "   ", "base64_image": "" }),
            json!({ "image_url": "http://example.com/a.png", "base64_image": png_base64() }),
        ] {
            let req = test::TestRequest::post()
                .uri("/predict")
                .set_json(payload)
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["success"], false);
            assert!(body["error"].as_str().unwrap().contains("image_url"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn predict_rejects_undecodable_payloads() {
        let (model, calls) = loaded_model();
        let services = services(model, HistoryService::disabled());
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/predict")
            .set_json(json!({ "base64_image": "%%%not-base64%%%" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let not_an_image = general_purpose::STANDARD.encode(b"plain text, not pixels");
        let req = test::TestRequest::post()
            .uri("/predict")
            .set_json(json!({ "base64_image": not_an_image }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn malformed_json_uses_failure_envelope() {
        let (model, _) = loaded_model();
        let services = services(model, HistoryService::disabled());
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/predict")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload("{\"base64_image\": ")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));
    }

    #[actix_web::test]
    async fn unreachable_image_url_is_a_bad_gateway() {
        let (model, _) = loaded_model();
        let services = services(model, HistoryService::disabled());
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/predict")
            .set_json(json!({ "image_url": "http://127.0.0.1:1/lesion.png" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[actix_web::test]
    async fn failed_history_write_does_not_fail_the_prediction() {
        let (model, _) = loaded_model();
        let services = services(model, HistoryService::new(Arc::new(FailingStore)));
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/predict")
            .set_json(json!({ "base64_image": png_base64() }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/history").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[actix_web::test]
    async fn unloaded_model_reports_unhealthy_and_refuses_work() {
        let services = services(unloaded_model(), HistoryService::disabled());
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({ "status": "unhealthy", "model_loaded": false }));

        let req = test::TestRequest::post()
            .uri("/predict")
            .set_json(json!({ "base64_image": png_base64() }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Model not loaded");

        let resp = test::call_service(
            &app,
            classify_request(multipart_body("a.png", "image/png", &rgb_png(4, 4, [0, 0, 0])))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        services
            .model
            .install(MockRuntime::boxed(SCORES.to_vec()))
            .unwrap();
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({ "status": "healthy", "model_loaded": true }));
    }

    #[actix_web::test]
    async fn history_without_store_is_unavailable() {
        let (model, _) = loaded_model();
        let services = services(model, HistoryService::disabled());
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let req = test::TestRequest::get().uri("/history").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
    }

    #[actix_web::test]
    async fn classify_accepts_image_uploads() {
        let (model, calls) = loaded_model();
        let services = services(model, HistoryService::disabled());
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let body = multipart_body("lesion.png", "image/png", &rgb_png(10, 10, [200, 120, 90]));
        let resp = test::call_service(&app, classify_request(body).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["predictions"].as_array().unwrap().len(), 7);
        assert_eq!(body["top_prediction"]["class"], "bcc");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[actix_web::test]
    async fn classify_rejects_non_image_uploads() {
        let (model, calls) = loaded_model();
        let services = services(model, HistoryService::disabled());
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let body = multipart_body("notes.txt", "text/plain", b"hello");
        let resp = test::call_service(&app, classify_request(body).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Only image files are accepted");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn classify_gates_top_prediction_below_threshold() {
        let model = ModelHandler::new(LabelTable::default(), Some(0.7), [1, 8, 8, 3]);
        model.install(MockRuntime::boxed(SCORES.to_vec())).unwrap();
        let services = services(model, HistoryService::disabled());
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let body = multipart_body("lesion.png", "image/png", &rgb_png(10, 10, [200, 120, 90]));
        let resp = test::call_service(&app, classify_request(body).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["top_prediction"]["class"], "unrelated");
        let top = body["top_prediction"]["probability"].as_f64().unwrap();
        assert!((top - 0.6).abs() < 1e-4);
        assert_eq!(body["predictions"][3]["class"], "bcc");
    }

    #[actix_web::test]
    async fn oversized_image_dimensions_are_unprocessable() {
        let (model, calls) = loaded_model();
        let services = services(model, HistoryService::disabled());
        let app = test::init_service(
            App::new().configure(|cfg| configure_services(cfg, &services)),
        )
        .await;

        let strip = png_bytes(DynamicImage::ImageLuma8(GrayImage::new(9000, 1)));
        let req = test::TestRequest::post()
            .uri("/predict")
            .set_json(json!({ "base64_image": general_purpose::STANDARD.encode(strip) }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[::core::prelude::v1::test]
    fn json_limit_covers_base64_expansion() {
        let (model, _) = loaded_model();
        let services = services(model, HistoryService::disabled());
        assert!(services.json_limit() > 1024 * 1024 * 4 / 3);
    }
}
