//! Static table describing which backend configurations support tiering.
//!
//! Loaded once at startup from a JSON file and shared read-only.

use crate::models::data_object::TransferType;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TieringConfigError {
    #[error("reading tiering configuration `{path}`: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing tiering configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One archive configuration entry.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveConfiguration {
    pub configuration_id: String,
    pub s3_archive_configuration_id: Option<String>,
    pub transfer_type: TransferType,
    #[serde(default)]
    pub tiering_supported: bool,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct TieringConfig {
    #[serde(default)]
    pub configurations: Vec<ArchiveConfiguration>,
}

impl TieringConfig {
    pub fn from_json(raw: &str) -> Result<Self, TieringConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TieringConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| TieringConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn is_tiering_supported(
        &self,
        configuration_id: &str,
        s3_archive_configuration_id: Option<&str>,
        transfer_type: TransferType,
    ) -> bool {
        self.configurations.iter().any(|entry| {
            entry.tiering_supported
                && entry.configuration_id == configuration_id
                && entry.transfer_type == transfer_type
                && (entry.s3_archive_configuration_id.is_none()
                    || entry.s3_archive_configuration_id.as_deref() == s3_archive_configuration_id)
        })
    }

    pub fn has_archive_configuration(&self, s3_archive_configuration_id: &str) -> bool {
        self.configurations.iter().any(|entry| {
            entry.s3_archive_configuration_id.as_deref() == Some(s3_archive_configuration_id)
        })
    }
}
