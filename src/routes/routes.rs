//! Defines routes for transfer task submission and inspection.
//!
//! ## Structure
//! - **Downloads**
//!   - `POST /downloads/collections` -> submit a collection download
//!   - `GET  /downloads/collections/{id}` -> collection download task
//!   - `POST /downloads/collections/{id}/cancel` -> cancel a collection download
//!   - `POST /downloads/collection-lists` -> submit a download of several collections
//!   - `POST /downloads/data-object-lists` -> submit a download of several data objects
//!   - `POST /downloads/data-objects` -> submit a data-object download
//!   - `GET  /downloads/data-objects/{id}` -> data-object download status
//!   - `POST /downloads/data-objects/{id}/cancel` -> cancel a data-object download
//!
//! - **Tiering and migration**
//!   - `POST /tiering` -> tier a data object, a collection, or a bulk list
//!   - `POST /migrations` -> queue a data-object migration
//!
//! Every submission reads the caller from the `x-user-id` and `x-doc` headers.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        task_handlers::{
            cancel_collection_download, cancel_data_object_download, collection_download_task,
            data_object_download_status, migrate_data_object, submit_collection_download,
            submit_collections_download, submit_data_object_download,
            submit_data_objects_download, tier,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for the orchestration API.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Downloads
        .route("/downloads/collections", post(submit_collection_download))
        .route("/downloads/collections/{id}", get(collection_download_task))
        .route(
            "/downloads/collections/{id}/cancel",
            post(cancel_collection_download),
        )
        .route(
            "/downloads/collection-lists",
            post(submit_collections_download),
        )
        .route(
            "/downloads/data-object-lists",
            post(submit_data_objects_download),
        )
        .route("/downloads/data-objects", post(submit_data_object_download))
        .route(
            "/downloads/data-objects/{id}",
            get(data_object_download_status),
        )
        .route(
            "/downloads/data-objects/{id}/cancel",
            post(cancel_data_object_download),
        )
        // Tiering and migration
        .route("/tiering", post(tier))
        .route("/migrations", post(migrate_data_object))
}
