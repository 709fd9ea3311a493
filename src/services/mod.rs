pub mod backend;
pub mod catalog;
pub mod collection_download;
pub mod download_completer;
pub mod engine;
pub mod events;
pub mod locks;
pub mod posix_archive;
pub mod scheduler;
pub mod sweep;
pub mod temp_migrator;
pub mod tiering;
pub mod tiering_config;
pub mod traversal;
pub mod upload_reconciler;
