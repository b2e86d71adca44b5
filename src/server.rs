//! HTTP endpoint.
//!
//! Exposes extraction and ingestion behind a single action-dispatched route,
//! for browser front-ends that upload a file and download the resulting CSV.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST`/`GET` | `/api/processData?action=...` | Run `mergecsv`, `imgtocsv` or `pdfcsv` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Parameters come from the query string, or from a JSON body when the query
//! string carries no `action`. The raw request body is otherwise the uploaded
//! file (CSV text, image bytes, or PDF bytes).
//!
//! # Error Contract
//!
//! ```json
//! { "error": "Missing 'action' parameter" }
//! ```
//!
//! `400` for missing/invalid parameters, `404` when a referenced file does not
//! exist, `500` for processing failures.
//!
//! Ingestions are serialized through one mutex around the [`Engine`], so the
//! signature snapshot has a single writer per process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::extract::{self, ExtractError, ImageExtractor, PdfExtractor};
use crate::ingest::{Engine, IngestError};
use crate::table;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    engine: Arc<Mutex<Engine>>,
    image: Arc<dyn ImageExtractor>,
    pdf: Arc<dyn PdfExtractor>,
}

impl AppState {
    pub fn new(
        config: Config,
        engine: Engine,
        image: Arc<dyn ImageExtractor>,
        pdf: Arc<dyn PdfExtractor>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            engine: Arc::new(Mutex::new(engine)),
            image,
            pdf,
        }
    }
}

/// Starts the server on `[server].bind`. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Engine::open(config)?;
    if !config.classifier.is_enabled() {
        warn!("Classifier is disabled; mergecsv requests will fail");
    }
    let image: Arc<dyn ImageExtractor> = match extract::GeminiImageExtractor::new(config) {
        Ok(extractor) => Arc::new(extractor),
        Err(e) => {
            warn!("Image extraction unavailable: {}", e);
            Arc::new(extract::UnavailableImageExtractor::new(e.to_string()))
        }
    };
    let pdf = Arc::new(extract::TextLayoutPdfExtractor::new(
        config.extract.pdf_min_rows,
    ));

    let bind_addr = config.server.bind.clone();
    let app = router(AppState::new(config.clone(), engine, image, pdf));

    info!("Server listening on http://{}", bind_addr);
    println!("Server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the router with permissive CORS (preflight `OPTIONS` included).
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/processData",
            post(handle_process).get(handle_process),
        )
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: message.into(),
    }
}

fn ingest_error(err: IngestError) -> AppError {
    error!("Error processing CSV: {}", err);
    match err {
        IngestError::NotFound(_) => not_found("CSV file not found"),
        IngestError::Input { .. } => bad_request(err.to_string()),
        other => internal(format!("Error processing CSV: {}", other)),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /api/processData ============

#[derive(Debug, Default, Deserialize)]
struct ProcessParams {
    action: Option<String>,
    identifier: Option<String>,
    input_path: Option<PathBuf>,
    image_path: Option<PathBuf>,
    pdf_path: Option<PathBuf>,
    output_file: Option<String>,
}

/// Resolves parameters: query string first, JSON body as fallback.
///
/// Returns the parameters and the upload payload (empty when the body was
/// consumed as parameters).
fn resolve_params(query: ProcessParams, body: Bytes) -> (ProcessParams, Bytes) {
    if query.action.is_some() {
        return (query, body);
    }
    match serde_json::from_slice::<ProcessParams>(&body) {
        Ok(from_body) => (from_body, Bytes::new()),
        Err(_) => (query, body),
    }
}

async fn handle_process(
    State(state): State<AppState>,
    Query(query): Query<ProcessParams>,
    body: Bytes,
) -> Result<Response, AppError> {
    let (params, payload) = resolve_params(query, body);

    let Some(action) = params.action.clone() else {
        warn!("Missing 'action' parameter");
        return Err(bad_request("Missing 'action' parameter"));
    };

    match action.as_str() {
        "mergecsv" => handle_mergecsv(&state, params, payload).await,
        "imgtocsv" => handle_imgtocsv(&state, params, payload).await,
        "pdfcsv" => handle_pdfcsv(&state, params, payload).await,
        other => {
            warn!("Invalid action parameter: {}", other);
            Err(bad_request("Invalid action parameter"))
        }
    }
}

async fn handle_mergecsv(
    state: &AppState,
    params: ProcessParams,
    payload: Bytes,
) -> Result<Response, AppError> {
    let mut engine = state.engine.lock().await;

    let outcome = if let Some(path) = params.input_path {
        engine.ingest_path(&path).await.map_err(ingest_error)?
    } else if !payload.is_empty() {
        let identifier = params
            .identifier
            .unwrap_or_else(|| format!("new_{}.csv", extract::random_hex()));
        let table = table::parse_table(&identifier, &String::from_utf8_lossy(&payload))
            .map_err(|e| bad_request(e.to_string()))?;
        if table.headers.is_empty() || table.is_empty() {
            return Err(bad_request("File is empty"));
        }
        engine.ingest(&table).await.map_err(ingest_error)?
    } else {
        warn!("Missing CSV data or 'input_path' parameter");
        return Err(bad_request(
            "Please provide CSV data or 'input_path' parameter",
        ));
    };
    drop(engine);

    match outcome.merged_artifacts.first() {
        Some(first) => {
            info!(
                "CSV matched and merged. Generated {} merged files",
                outcome.merged_artifacts.len()
            );
            csv_response(&first.path)
        }
        None => {
            info!("CSV analyzed but no matches found to merge");
            Ok(Json(serde_json::json!({
                "result": "success",
                "message": "CSV analyzed but no matches found",
            }))
            .into_response())
        }
    }
}

async fn handle_imgtocsv(
    state: &AppState,
    params: ProcessParams,
    payload: Bytes,
) -> Result<Response, AppError> {
    let image = match (&params.image_path, payload.is_empty()) {
        (Some(path), _) => read_input(path, "Image file not found")?,
        (None, false) => payload.to_vec(),
        (None, true) => {
            return Err(bad_request(
                "Please provide an image file or 'image_path' parameter",
            ))
        }
    };

    let name = params
        .output_file
        .unwrap_or_else(extract::random_output_name);
    let output_path = state.config.storage.output_dir.join(sanitize_name(&name)?);

    let path = extract::image_to_csv(state.image.as_ref(), &image, &output_path)
        .await
        .map_err(|e| {
            error!("Error processing image: {}", e);
            internal(format!("Error processing image: {}", e))
        })?;
    csv_response(&path)
}

async fn handle_pdfcsv(
    state: &AppState,
    params: ProcessParams,
    payload: Bytes,
) -> Result<Response, AppError> {
    let pdf = match (&params.pdf_path, payload.is_empty()) {
        (Some(path), _) => read_input(path, "PDF file not found")?,
        (None, false) => payload.to_vec(),
        (None, true) => {
            return Err(bad_request(
                "Please provide a PDF file or 'pdf_path' parameter",
            ))
        }
    };

    let extractor = state.pdf.clone();
    let output_dir = state.config.storage.output_dir.clone();
    let paths = tokio::task::spawn_blocking(move || {
        extract::pdf_to_csv(extractor.as_ref(), &pdf, &output_dir)
    })
    .await
    .map_err(|e| internal(format!("Error processing PDF: {}", e)))?
    .map_err(|e: ExtractError| {
        error!("Error processing PDF: {}", e);
        internal(format!("Error processing PDF: {}", e))
    })?;

    info!(
        "PDF processed successfully. Generated {} CSV files",
        paths.len()
    );
    match paths.first() {
        Some(first) => csv_response(first),
        None => Err(internal("No CSV files were generated from the PDF")),
    }
}

fn read_input(path: &Path, missing: &str) -> Result<Vec<u8>, AppError> {
    std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            error!("{}: {}", missing, path.display());
            not_found(missing)
        } else {
            internal(e.to_string())
        }
    })
}

/// Output files must land inside the output directory.
fn sanitize_name(name: &str) -> Result<&str, AppError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(bad_request("output_file must be a plain file name"));
    }
    Ok(name)
}

fn csv_response(path: &Path) -> Result<Response, AppError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| internal(format!("could not read {}: {}", path.display(), e)))?;
    let filename = table::identifier_for(path).unwrap_or_else(|| "output.csv".to_string());
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", filename),
            ),
        ],
        content,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_action_wins_over_body() {
        let query = ProcessParams {
            action: Some("mergecsv".into()),
            ..Default::default()
        };
        let (params, payload) = resolve_params(query, Bytes::from_static(b"a,b\n1,2\n"));
        assert_eq!(params.action.as_deref(), Some("mergecsv"));
        assert_eq!(&payload[..], b"a,b\n1,2\n");
    }

    #[test]
    fn test_json_body_supplies_params() {
        let body = Bytes::from_static(br#"{"action": "mergecsv", "input_path": "data/a.csv"}"#);
        let (params, payload) = resolve_params(ProcessParams::default(), body);
        assert_eq!(params.action.as_deref(), Some("mergecsv"));
        assert_eq!(params.input_path, Some(PathBuf::from("data/a.csv")));
        assert!(payload.is_empty());
    }

    #[test]
    fn test_non_json_body_without_action_stays_payload() {
        let (params, payload) =
            resolve_params(ProcessParams::default(), Bytes::from_static(b"a,b\n"));
        assert!(params.action.is_none());
        assert_eq!(payload.len(), 4);
    }

    #[test]
    fn test_sanitize_name_rejects_paths() {
        assert!(sanitize_name("out.csv").is_ok());
        assert!(sanitize_name("../out.csv").is_err());
        assert!(sanitize_name("..").is_err());
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let err = ingest_error(IngestError::NotFound(PathBuf::from("x.csv")));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "CSV file not found");
    }
}
