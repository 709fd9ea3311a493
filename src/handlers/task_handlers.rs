//! HTTP handlers for downloads, tiering and migrations.
//! Each handler resolves the caller's [`RequestContext`] from headers and hands
//! the request to the shared `TransferEngine`.

use crate::{
    errors::AppError,
    models::{
        collection::normalize_path,
        context::RequestContext,
        data_object::FileLocation,
        download::{CollectionDownloadTask, DownloadSubmission, DownloadTaskStatus},
        tiering::{MigrationRequest, MigrationResponse, TierRequest, TierResponse},
    },
    services::engine::TransferEngine,
    state::AppState,
};
use axum::{
    Json,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const USER_HEADER: &str = "x-user-id";
pub const DOC_HEADER: &str = "x-doc";

fn required_header(parts: &Parts, name: &str) -> Result<String, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request(format!("missing {} header", name)))
}

/// Canonical form of a caller-supplied logical path. Blank paths are rejected
/// rather than collapsing to the root collection.
fn logical_path(raw: &str) -> Result<String, AppError> {
    if raw.trim().is_empty() {
        return Err(AppError::bad_request("empty path"));
    }
    Ok(normalize_path(raw.trim()))
}

fn logical_paths(raw: &[String]) -> Result<Vec<String>, AppError> {
    raw.iter().map(|p| logical_path(p)).collect()
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = required_header(parts, USER_HEADER)?;
        let doc = required_header(parts, DOC_HEADER)?;
        Ok(RequestContext::new(user_id, doc))
    }
}

#[derive(Debug, Deserialize)]
pub struct CollectionDownloadBody {
    pub path: String,
    pub destination: FileLocation,
}

#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    pub task_id: Uuid,
}

/// `POST /downloads/collections`
pub async fn submit_collection_download(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<CollectionDownloadBody>,
) -> Result<impl IntoResponse, AppError> {
    let task_id = state
        .engine
        .submit_collection_download(&ctx, &logical_path(&body.path)?, body.destination)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

/// `GET /downloads/collections/{id}`
pub async fn collection_download_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CollectionDownloadTask>, AppError> {
    Ok(Json(state.engine.collection_download_task(id).await?))
}

/// `POST /downloads/collections/{id}/cancel`
pub async fn cancel_collection_download(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.engine.cancel_collection_download(&ctx, id).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id: id })))
}

/// A download of several paths into one destination.
#[derive(Debug, Deserialize)]
pub struct PathListDownloadBody {
    pub paths: Vec<String>,
    pub destination: FileLocation,
}

/// `POST /downloads/collection-lists`
pub async fn submit_collections_download(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<PathListDownloadBody>,
) -> Result<impl IntoResponse, AppError> {
    let task_id = state
        .engine
        .submit_collections_download(&ctx, &logical_paths(&body.paths)?, body.destination)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

/// `POST /downloads/data-object-lists`
pub async fn submit_data_objects_download(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<PathListDownloadBody>,
) -> Result<impl IntoResponse, AppError> {
    let task_id = state
        .engine
        .submit_data_objects_download(&ctx, &logical_paths(&body.paths)?, body.destination)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

fn default_completion_event() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct DataObjectDownloadBody {
    pub path: String,
    pub destination: FileLocation,
    #[serde(default = "default_completion_event")]
    pub completion_event: bool,
}

/// `POST /downloads/data-objects`
pub async fn submit_data_object_download(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<DataObjectDownloadBody>,
) -> Result<impl IntoResponse, AppError> {
    let path = logical_path(&body.path)?;
    let submission: DownloadSubmission = state
        .engine
        .submit_data_object_download(&ctx, &path, body.destination, body.completion_event)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// `GET /downloads/data-objects/{id}`
pub async fn data_object_download_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DownloadTaskStatus>, AppError> {
    Ok(Json(state.engine.download_task_status(id).await?))
}

/// `POST /downloads/data-objects/{id}/cancel`
pub async fn cancel_data_object_download(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.engine.cancel_data_object_download(&ctx, id).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id: id })))
}

/// Tiering body: a single data object, a single collection, or a bulk list.
#[derive(Debug, Default, Deserialize)]
pub struct TierBody {
    pub data_object_path: Option<String>,
    pub collection_path: Option<String>,
    #[serde(flatten)]
    pub bulk: TierRequest,
}

enum TierTarget {
    DataObject(String),
    Collection(String),
    Bulk(TierRequest),
}

impl TierBody {
    fn target(self) -> Result<TierTarget, AppError> {
        let bulk_given =
            !self.bulk.data_object_paths.is_empty() || !self.bulk.collection_paths.is_empty();
        match (self.data_object_path, self.collection_path, bulk_given) {
            (Some(path), None, false) => Ok(TierTarget::DataObject(logical_path(&path)?)),
            (None, Some(path), false) => Ok(TierTarget::Collection(logical_path(&path)?)),
            (None, None, true) => Ok(TierTarget::Bulk(TierRequest {
                data_object_paths: logical_paths(&self.bulk.data_object_paths)?,
                collection_paths: logical_paths(&self.bulk.collection_paths)?,
            })),
            (None, None, false) => Err(AppError::bad_request("nothing to tier")),
            _ => Err(AppError::bad_request(
                "specify one of data_object_path, collection_path or a bulk list",
            )),
        }
    }

    async fn submit(
        self,
        engine: &TransferEngine,
        ctx: &RequestContext,
    ) -> Result<TierResponse, AppError> {
        let response = match self.target()? {
            TierTarget::DataObject(path) => engine.tier_data_object(ctx, &path).await?,
            TierTarget::Collection(path) => engine.tier_collection(ctx, &path).await?,
            TierTarget::Bulk(request) => {
                engine.tier_data_objects_or_collections(ctx, &request).await?
            }
        };
        Ok(response)
    }
}

/// `POST /tiering`
pub async fn tier(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<TierBody>,
) -> Result<Json<TierResponse>, AppError> {
    Ok(Json(body.submit(&state.engine, &ctx).await?))
}

#[derive(Debug, Deserialize)]
pub struct MigrationBody {
    pub path: String,
    #[serde(flatten)]
    pub request: MigrationRequest,
}

/// `POST /migrations`
pub async fn migrate_data_object(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<MigrationBody>,
) -> Result<impl IntoResponse, AppError> {
    let response: MigrationResponse = state
        .engine
        .migrate_data_object(&ctx, &logical_path(&body.path)?, &body.request)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::data_object::UploadStatus;
    use crate::services::scheduler::SweepMonitor;
    use crate::testing::{Harness, record};
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/tiering");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn context_is_read_from_headers() {
        let mut parts = parts(&[(USER_HEADER, "alice"), (DOC_HEADER, "DOC")]);
        let ctx = RequestContext::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(ctx, RequestContext::new("alice", "DOC"));
    }

    #[tokio::test]
    async fn missing_doc_header_is_a_bad_request() {
        let mut parts = parts(&[(USER_HEADER, "alice")]);
        let err = RequestContext::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tier_body_routes_a_single_object() {
        let h = Harness::new().await;
        h.seed(&["/p"], &[record("/p/a", UploadStatus::Archived)]).await;

        let body: TierBody = serde_json::from_str(r#"{"data_object_path": "p//a/"}"#).unwrap();
        let response = body
            .submit(&h.engine, &RequestContext::new("alice", "DOC"))
            .await
            .unwrap();
        assert_eq!(response.tiered_paths, vec!["/p/a"]);
    }

    #[tokio::test]
    async fn tier_body_with_two_targets_is_rejected() {
        let h = Harness::new().await;
        let body: TierBody = serde_json::from_str(
            r#"{"data_object_path": "/p/a", "collection_paths": ["/p"]}"#,
        )
        .unwrap();
        let err = body
            .submit(&h.engine, &RequestContext::new("alice", "DOC"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(h.archive.calls(), 0);
    }

    #[test]
    fn blank_paths_are_rejected_before_normalizing() {
        assert_eq!(logical_path(" /p/a/ ").unwrap(), "/p/a");
        assert_eq!(
            logical_path("  ").unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }

    fn state(h: Harness) -> AppState {
        AppState {
            db: h.catalog.db.clone(),
            engine: std::sync::Arc::new(h.engine),
            temp_archive_dir: std::env::temp_dir(),
            sweeps: std::sync::Arc::new(SweepMonitor::new(std::time::Duration::from_secs(30))),
        }
    }

    #[tokio::test]
    async fn data_object_list_paths_are_normalized_before_submission() {
        let h = Harness::new().await;
        h.seed(
            &["/p"],
            &[
                record("/p/a", UploadStatus::Archived),
                record("/p/b", UploadStatus::Archived),
            ],
        )
        .await;
        let state = state(h);

        let body: PathListDownloadBody = serde_json::from_str(
            r#"{"paths": ["p//a/", "/p/b"], "destination": {"container_id": "ep", "object_id": "/x"}}"#,
        )
        .unwrap();
        let response = submit_data_objects_download(
            State(state.clone()),
            RequestContext::new("alice", "DOC"),
            Json(body),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let accepted: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let id: Uuid = accepted["task_id"].as_str().unwrap().parse().unwrap();
        let task = state.engine.collection_download_task(id).await.unwrap();
        assert_eq!(task.paths, vec!["/p/a", "/p/b"]);
    }

    #[tokio::test]
    async fn blank_entry_in_a_collection_list_is_a_bad_request() {
        let h = Harness::new().await;
        h.seed(&["/p"], &[]).await;
        let body: PathListDownloadBody = serde_json::from_str(
            r#"{"paths": ["/p", " "], "destination": {"container_id": "ep", "object_id": "/x"}}"#,
        )
        .unwrap();
        let err = submit_collections_download(
            State(state(h)),
            RequestContext::new("alice", "DOC"),
            Json(body),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn canceling_an_unknown_download_is_not_found() {
        let h = Harness::new().await;
        let err = cancel_data_object_download(
            State(state(h)),
            RequestContext::new("alice", "DOC"),
            Path(Uuid::new_v4()),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn download_body_defaults_to_emitting_completion_events() {
        let body: DataObjectDownloadBody = serde_json::from_str(
            r#"{"path": "/p/a", "destination": {"container_id": "c", "object_id": "o"}}"#,
        )
        .unwrap();
        assert!(body.completion_event);
    }
}
