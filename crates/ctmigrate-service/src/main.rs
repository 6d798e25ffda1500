use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use ctmigrate_api::{ArchiveRequest, MigrationApi, OperationStatus, API_CONTRACT_VERSION};
use ctmigrate_core::{Collection, ExportOptions, MigrationType, RestoreOptions};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const UPLOAD_LIMIT_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
struct ServiceState {
    api: MigrationApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct CountsResponse {
    record_counts: BTreeMap<Collection, usize>,
    total_records: usize,
}

fn default_migration_type() -> MigrationType {
    MigrationType::CompleteReplacement
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct ExportQuery {
    #[serde(default = "default_migration_type")]
    migration_type: MigrationType,
    #[serde(default = "default_true")]
    include_source_store: bool,
    #[serde(default)]
    source_label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RestoreQuery {
    #[serde(default)]
    progress_every: Option<usize>,
}

#[derive(Debug, Parser)]
#[command(name = "ctmigrate-service")]
#[command(about = "Local HTTP service for CT library backups")]
struct Args {
    #[arg(long, default_value = "./ctmigrate.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Decode failures are client errors; an unreachable store is 503.
fn http_status(status: &OperationStatus) -> StatusCode {
    match status {
        OperationStatus::Ok => StatusCode::OK,
        OperationStatus::Failed { kind, .. } => match kind.as_str() {
            "decode" => StatusCode::BAD_REQUEST,
            "connection" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn outcome<T>(status: &OperationStatus, data: &T) -> Response
where
    T: Serialize,
{
    (http_status(status), Json(envelope(data))).into_response()
}

fn attachment(content_type: &str, file_name: &str, body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{file_name}\"")),
        ],
        body,
    )
        .into_response()
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/init", post(db_init))
        .route("/v1/db/counts", get(db_counts))
        .route("/v1/backup/archive", get(backup_archive))
        .route("/v1/backup/document", get(backup_document))
        .route("/v1/backup/preview", post(backup_preview))
        .route("/v1/backup/restore", post(backup_restore))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ctmigrate=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let state = ServiceState { api: MigrationApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "ctmigrate service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_init(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ctmigrate_api::SchemaReport>>, ServiceError> {
    let report = state.api.init_schema().map_err(|err| ServiceState::error(format!("{err:#}")))?;
    Ok(Json(envelope(report)))
}

async fn db_counts(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CountsResponse>>, ServiceError> {
    let record_counts =
        state.api.collection_counts().map_err(|err| ServiceState::error(format!("{err:#}")))?;
    let total_records = record_counts.values().sum();
    Ok(Json(envelope(CountsResponse { record_counts, total_records })))
}

async fn backup_archive(
    State(state): State<ServiceState>,
    Query(query): Query<ExportQuery>,
) -> Response {
    let request = ArchiveRequest {
        migration_type: query.migration_type,
        include_source_store: query.include_source_store,
        source_label: query.source_label,
    };
    let mut result = state.api.export_migration_archive(&request);
    match (result.archive.take(), result.summary.as_ref()) {
        (Some(archive), Some(summary)) => attachment("application/zip", &summary.file_name, archive),
        _ => outcome(&result.status, &result),
    }
}

async fn backup_document(
    State(state): State<ServiceState>,
    Query(query): Query<ExportQuery>,
) -> Response {
    let options =
        ExportOptions { migration_type: query.migration_type, source_label: query.source_label };
    let mut result = state.api.export_document(&options);
    match (result.document.take(), result.summary.as_ref()) {
        (Some(document), Some(summary)) => {
            attachment("application/json", &summary.file_name, document.into_bytes())
        }
        _ => outcome(&result.status, &result),
    }
}

async fn backup_preview(State(state): State<ServiceState>, body: Bytes) -> Response {
    let result = state.api.preview_upload(&body);
    outcome(&result.status, &result)
}

async fn backup_restore(
    State(state): State<ServiceState>,
    Query(query): Query<RestoreQuery>,
    body: Bytes,
) -> Response {
    let options = query
        .progress_every
        .map_or_else(RestoreOptions::default, |progress_every| RestoreOptions { progress_every });
    let result = state.api.restore_from_upload_with(&body, &options);
    outcome(&result.status, &result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("ctmigrate-service-{}.sqlite3", ulid::Ulid::new()))
    }

    async fn response_bytes(response: Response) -> Vec<u8> {
        match to_bytes(response.into_body(), 64 * 1024 * 1024).await {
            Ok(bytes) => bytes.to_vec(),
            Err(err) => panic!("failed to read response body: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = response_bytes(response).await;
        let body = match String::from_utf8(bytes) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Vec<u8>) -> Response {
        match router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method(method)
                    .body(axum::body::Body::from(body))
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn seed_document() -> Vec<u8> {
        serde_json::json!({
            "export_info": {
                "timestamp": "2024-05-01T10:00:00Z",
                "format_version": "2.0",
                "migration_type": "complete_replacement",
                "source_label": "fixture"
            },
            "clinical_entries": [
                { "disease": "Stroke", "disease_text": "Acute" },
                { "disease": "Pneumonia", "disease_text": "Chest" }
            ],
            "notices": [],
            "protocols": [{ "category": "Head", "title": "Non-contrast", "content": "5mm" }]
        })
        .to_string()
        .into_bytes()
    }

    fn data_field<'a>(value: &'a serde_json::Value, key: &str) -> &'a serde_json::Value {
        value
            .get("data")
            .and_then(|data| data.get(key))
            .unwrap_or_else(|| panic!("missing data.{key} in response: {value}"))
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(ServiceState { api: MigrationApi::new(unique_temp_db_path()) });

        let response = send(&router, "GET", "/v1/health", Vec::new()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(data_field(&value, "status"), &serde_json::json!("ok"));
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn restore_archive_and_preview_flow() {
        let db_path = unique_temp_db_path();
        let router = app(ServiceState { api: MigrationApi::new(db_path.clone()) });

        let restored = send(&router, "POST", "/v1/backup/restore", seed_document()).await;
        assert_eq!(restored.status(), StatusCode::OK);
        let restored = response_json(restored).await;
        assert_eq!(data_field(&restored, "status"), &serde_json::json!("ok"));

        let archive = send(&router, "GET", "/v1/backup/archive", Vec::new()).await;
        assert_eq!(archive.status(), StatusCode::OK);
        assert_eq!(
            archive.headers().get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok()),
            Some("application/zip")
        );
        let disposition = archive
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(disposition.contains("ct_system_backup_"));
        let archive_bytes = response_bytes(archive).await;

        let preview = send(&router, "POST", "/v1/backup/preview", archive_bytes).await;
        assert_eq!(preview.status(), StatusCode::OK);
        let preview = response_json(preview).await;
        let details = data_field(&preview, "preview");
        assert_eq!(details["record_counts"]["clinical_entries"], serde_json::json!(2));
        assert_eq!(details["record_counts"]["protocols"], serde_json::json!(1));
        assert_eq!(details["migration_type"], serde_json::json!("complete_replacement"));

        let counts = response_json(send(&router, "GET", "/v1/db/counts", Vec::new()).await).await;
        assert_eq!(data_field(&counts, "total_records"), &serde_json::json!(3));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn archive_route_applies_source_label() {
        let db_path = unique_temp_db_path();
        let router = app(ServiceState { api: MigrationApi::new(db_path.clone()) });
        let restored = send(&router, "POST", "/v1/backup/restore", seed_document()).await;
        assert_eq!(restored.status(), StatusCode::OK);

        let archive = send(
            &router,
            "GET",
            "/v1/backup/archive?include_source_store=false&source_label=ward-7",
            Vec::new(),
        )
        .await;
        assert_eq!(archive.status(), StatusCode::OK);
        let archive_bytes = response_bytes(archive).await;

        let preview = response_json(send(&router, "POST", "/v1/backup/preview", archive_bytes).await).await;
        assert_eq!(data_field(&preview, "preview")["source_label"], serde_json::json!("ward-7"));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn malformed_upload_is_a_bad_request() {
        let router = app(ServiceState { api: MigrationApi::new(unique_temp_db_path()) });

        let response = send(&router, "POST", "/v1/backup/restore", b"not json".to_vec()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(data_field(&value, "status"), &serde_json::json!("failed"));
        assert_eq!(data_field(&value, "kind"), &serde_json::json!("decode"));
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn export_from_missing_database_is_unavailable() {
        let db_path = unique_temp_db_path();
        let router = app(ServiceState { api: MigrationApi::new(db_path.clone()) });

        let response =
            send(&router, "GET", "/v1/backup/document?migration_type=additive", Vec::new()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let value = response_json(response).await;
        assert_eq!(data_field(&value, "kind"), &serde_json::json!("connection"));
        assert!(!db_path.exists());
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn document_export_carries_requested_migration_type() {
        let db_path = unique_temp_db_path();
        let router = app(ServiceState { api: MigrationApi::new(db_path.clone()) });

        let init = send(&router, "POST", "/v1/db/init", Vec::new()).await;
        assert_eq!(init.status(), StatusCode::OK);

        let response =
            send(&router, "GET", "/v1/backup/document?migration_type=additive", Vec::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let document = response_json(response).await;
        assert_eq!(document["export_info"]["migration_type"], serde_json::json!("additive"));
        assert_eq!(document["clinical_entries"], serde_json::json!([]));

        let _ = std::fs::remove_file(&db_path);
    }
}
