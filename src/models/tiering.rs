//! Tiering and migration request shapes.

use super::data_object::TransferType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One object (or prefix) handed to a backend's tiering API.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BulkTierItem {
    /// Backend object id (not the logical path).
    pub path: String,
    pub configuration_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BulkTierRequest {
    pub items: Vec<BulkTierItem>,
}

/// What a single tiering call submits to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TierSubmission {
    Single(BulkTierItem),
    Bulk(BulkTierRequest),
}

/// Caller-facing bulk tiering request. Exactly one list may be non-empty.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TierRequest {
    #[serde(default)]
    pub data_object_paths: Vec<String>,
    #[serde(default)]
    pub collection_paths: Vec<String>,
}

/// Summary of a tiering submission.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TierResponse {
    /// Logical paths whose deep archive status is now IN_PROGRESS.
    pub tiered_paths: Vec<String>,

    /// Paths dropped from a bulk request, with the reason.
    pub skipped: Vec<(String, String)>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MigrationRequest {
    /// Target backend (archive) configuration.
    pub s3_archive_configuration_id: String,
}

#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Received,
    InProgress,
    Completed,
    Failed,
}

/// A queued migration of one data object between backend configurations.
#[derive(Serialize, Deserialize, Clone, Debug, sqlx::FromRow)]
pub struct DataMigrationTask {
    pub id: Uuid,
    pub path: String,
    pub user_id: String,
    pub configuration_id: String,
    pub from_s3_archive_configuration_id: Option<String>,
    pub to_s3_archive_configuration_id: String,
    pub transfer_type: TransferType,
    pub status: MigrationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Clone, Debug)]
pub struct MigrationResponse {
    pub task_id: Uuid,
}
