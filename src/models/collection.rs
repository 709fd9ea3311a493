//! Catalog view of a collection: one level of the hierarchy.

use serde::{Deserialize, Serialize};

/// A collection's direct children, as returned by the catalog.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CollectionListing {
    pub path: String,
    pub configuration_id: Option<String>,
    pub data_objects: Vec<String>,
    pub sub_collections: Vec<String>,
}

/// Final segment of a logical path (`/a/b/c` -> `c`).
pub fn final_segment(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Parent collection of a logical path (`/a/b/c` -> `/a/b`).
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(pos) => &trimmed[..pos],
        None => "/",
    }
}

/// Normalize a logical path: single leading slash, no trailing slash, no empty segments.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}
