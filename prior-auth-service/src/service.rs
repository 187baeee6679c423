use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use pa_flow::{RunOutcome, RunReport};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    models::{PageImage, ProcessImagesRequest, ProcessRequest, ProcessResponse},
    workflow::PaProcessor,
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "case_id": id
        })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub processor: PaProcessor,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/pa/process", post(process_documents))
        .route("/pa/process/images", post(process_images))
        .route("/pa/cases/{case_id}", get(get_case))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Prior Authorization Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Clinical extraction, policy retrieval and determination for prior authorization requests",
        "endpoints": {
            "POST /pa/process": "Process a case from uploaded PDF documents",
            "POST /pa/process/images": "Process a case from rendered page images",
            "GET /pa/cases/{case_id}": "Get the stored case document",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

fn pdf_files(uploaded_files: Vec<String>) -> Vec<String> {
    uploaded_files
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| {
            let path = f.split('?').next().unwrap_or(f);
            path.to_lowercase().ends_with(".pdf")
        })
        .collect()
}

fn check_case_id(case_id: Option<&String>) -> Result<(), ApiError> {
    match case_id {
        Some(id) => pa_flow::check_case_id(id).map_err(|e| bad_request_error(&e.to_string())),
        None => Ok(()),
    }
}

fn build_response(report: RunReport) -> ProcessResponse {
    let message = match &report.outcome {
        RunOutcome::Completed => None,
        RunOutcome::Stopped { reason, .. } => Some(reason.clone()),
        RunOutcome::Failed { error, .. } => Some(error.clone()),
    };
    ProcessResponse {
        case_id: report.case_id,
        status: report.outcome.label().to_string(),
        message,
        elapsed_seconds: report.elapsed.as_secs_f64(),
        results: report.results,
    }
}

async fn process_documents(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> ApiResult<ProcessResponse> {
    let files = pdf_files(request.uploaded_files);
    if files.is_empty() {
        return Err(bad_request_error("At least one PDF file is required"));
    }
    check_case_id(request.case_id.as_ref())?;
    info!(files = files.len(), case_id = ?request.case_id, "Processing prior authorization documents");

    let report = state
        .processor
        .process_documents(request.case_id, files, request.use_reasoning)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start case processing");
            internal_error("Failed to process case", &e.to_string())
        })?;

    Ok(Json(build_response(report)))
}

async fn process_images(
    State(state): State<AppState>,
    Json(request): Json<ProcessImagesRequest>,
) -> ApiResult<ProcessResponse> {
    let images: Vec<PageImage> = request
        .images
        .into_iter()
        .filter(|image| !image.trim().is_empty())
        .enumerate()
        .map(|(i, image)| PageImage::new(format!("page_{}.png", i + 1), image))
        .collect();
    if images.is_empty() {
        return Err(bad_request_error("At least one page image is required"));
    }
    check_case_id(request.case_id.as_ref())?;
    info!(pages = images.len(), case_id = ?request.case_id, "Processing prior authorization page images");

    let report = state
        .processor
        .process_images(request.case_id, images, request.use_reasoning)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start case processing");
            internal_error("Failed to process case", &e.to_string())
        })?;

    Ok(Json(build_response(report)))
}

async fn get_case(State(state): State<AppState>, Path(case_id): Path<String>) -> ApiResult<Value> {
    info!("Getting case document: {}", case_id);

    match state.processor.repository().get(&case_id).await {
        Ok(Some(document)) => Ok(Json(document)),
        Ok(None) => Err(not_found_error("Case not found", &case_id)),
        Err(e) => {
            error!("Failed to load case {}: {}", case_id, e);
            Err(internal_error("Failed to load case", &e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fakes::{FakeAnalyzer, FakeGeneration, FakeSearch, MemoryBlobStore, output};
    use crate::{config::Settings, workflow::Backends};
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use pa_flow::InMemoryCaseRepository;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router() -> Router {
        let backends = Backends {
            generation: FakeGeneration::responding("chat", |_| {
                output(json!({"optimized_query": "omalizumab asthma"}))
            }),
            reasoning: None,
            search: FakeSearch::with_paths(&[]),
            blob_store: Arc::new(MemoryBlobStore::default()),
            documents: FakeAnalyzer::returning(""),
        };
        let processor = PaProcessor::new(
            &backends,
            &Settings::default(),
            Arc::new(InMemoryCaseRepository::new()),
        );
        build_router(AppState { processor })
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn only_pdf_uploads_are_kept() {
        let files = pdf_files(vec![
            "notes.txt".to_string(),
            " /data/referral.PDF ".to_string(),
            "https://host/c/policy.pdf?sv=1".to_string(),
        ]);
        assert_eq!(files, vec!["/data/referral.PDF", "https://host/c/policy.pdf?sv=1"]);
    }

    #[tokio::test]
    async fn process_without_pdfs_is_rejected() {
        let response = router()
            .oneshot(post_json(
                "/pa/process",
                json!({"uploaded_files": ["scan.docx"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn case_ids_with_path_segments_are_rejected() {
        let app = router();
        let response = app
            .clone()
            .oneshot(post_json(
                "/pa/process",
                json!({"case_id": "../../escape", "uploaded_files": ["/data/referral.pdf"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json(
                "/pa/process/images",
                json!({"case_id": "a/b", "images": ["iVBORw0KGgo="]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("Invalid case id"));
    }

    #[tokio::test]
    async fn unknown_case_is_not_found() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/pa/cases/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn image_run_reports_status_and_is_retrievable() {
        let app = router();
        let response = app
            .clone()
            .oneshot(post_json(
                "/pa/process/images",
                json!({"case_id": "case-http", "images": ["iVBORw0KGgo="]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["case_id"], "case-http");
        // the fake search finds nothing, so the run stops after retrieval
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["message"], "no results found");

        let stored = app
            .oneshot(
                Request::builder()
                    .uri("/pa/cases/case-http")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stored.status(), StatusCode::OK);
        assert_eq!(body_json(stored).await["policy_location"], "no results found");
    }
}
