//! Depth-first walk over a collection subtree.
//!
//! Uses an explicit stack instead of recursion. Depth is bounded and a collection
//! reached twice (a cycle in a corrupt hierarchy) is skipped rather than walked again.

use crate::models::collection::{CollectionListing, final_segment};
use crate::services::catalog::{Catalog, CatalogError};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TraversalError {
    #[error("collection `{0}` not found")]
    RootNotFound(String),
    #[error("collection `{path}` is deeper than the traversal limit of {limit}")]
    DepthExceeded { path: String, limit: usize },
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// One collection reached by the walk.
#[derive(Clone, Debug)]
pub struct CollectionVisit {
    pub listing: CollectionListing,

    /// Final segments of each collection between the root (exclusive) and this one.
    pub relative: Vec<String>,
}

impl CollectionVisit {
    pub fn depth(&self) -> usize {
        self.relative.len()
    }
}

/// Visit `root` and every sub-collection beneath it in depth-first preorder.
///
/// Flattening `data_objects` across the returned visits yields each data object in
/// the same order a recursive walk (objects first, then sub-collections) would.
pub async fn walk_collection(
    catalog: &dyn Catalog,
    root: &str,
    max_depth: usize,
) -> Result<Vec<CollectionVisit>, TraversalError> {
    let listing = catalog
        .get_collection(root)
        .await?
        .ok_or_else(|| TraversalError::RootNotFound(root.to_string()))?;

    let mut visited = HashSet::from([listing.path.clone()]);
    let mut stack = vec![CollectionVisit {
        listing,
        relative: Vec::new(),
    }];
    let mut visits = Vec::new();

    while let Some(visit) = stack.pop() {
        let mut children = Vec::with_capacity(visit.listing.sub_collections.len());
        for child_path in &visit.listing.sub_collections {
            if !visited.insert(child_path.clone()) {
                warn!(
                    "collection {} reached twice under {}, skipping",
                    child_path, root
                );
                continue;
            }
            if visit.depth() + 1 > max_depth {
                return Err(TraversalError::DepthExceeded {
                    path: child_path.clone(),
                    limit: max_depth,
                });
            }

            let Some(child) = catalog.get_collection(child_path).await? else {
                debug!("sub-collection {} vanished during walk", child_path);
                continue;
            };

            let mut relative = visit.relative.clone();
            relative.push(final_segment(child_path).to_string());
            children.push(CollectionVisit {
                listing: child,
                relative,
            });
        }

        // Pushed in reverse so the first sub-collection is walked first.
        stack.extend(children.into_iter().rev());
        visits.push(visit);
    }

    Ok(visits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::data_object::UploadStatus;
    use crate::testing::{memory_catalog, record};

    #[tokio::test]
    async fn walk_is_depth_first_preorder() {
        let catalog = memory_catalog().await;
        for path in ["/c", "/c/a", "/c/a/deep", "/c/b"] {
            catalog.insert_collection(path, Some("cfg")).await.unwrap();
        }
        for path in ["/c/x", "/c/a/y", "/c/a/deep/z", "/c/b/w"] {
            catalog
                .insert_data_object(&record(path, UploadStatus::Archived))
                .await
                .unwrap();
        }

        let visits = walk_collection(&catalog, "/c", 8).await.unwrap();
        let order: Vec<_> = visits
            .iter()
            .flat_map(|v| v.listing.data_objects.iter().map(String::as_str))
            .collect();
        assert_eq!(order, vec!["/c/x", "/c/a/y", "/c/a/deep/z", "/c/b/w"]);
        assert_eq!(visits[2].relative, vec!["a", "deep"]);
    }

    #[tokio::test]
    async fn depth_limit_is_enforced() {
        let catalog = memory_catalog().await;
        for path in ["/c", "/c/1", "/c/1/2", "/c/1/2/3"] {
            catalog.insert_collection(path, None).await.unwrap();
        }

        assert!(walk_collection(&catalog, "/c", 3).await.is_ok());
        let err = walk_collection(&catalog, "/c", 2).await.unwrap_err();
        assert!(matches!(
            err,
            TraversalError::DepthExceeded { ref path, limit: 2 } if path == "/c/1/2/3"
        ));
    }

    #[tokio::test]
    async fn missing_root_is_reported() {
        let catalog = memory_catalog().await;
        let err = walk_collection(&catalog, "/nope", 8).await.unwrap_err();
        assert!(matches!(err, TraversalError::RootNotFound(_)));
    }
}
