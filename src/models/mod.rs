//! Core data models for the transfer orchestration engine.
//!
//! These entities describe data objects, collections and the transfer tasks that
//! move their bytes between backends. Enum columns map to SQLite text via
//! `sqlx::Type` and everything serializes as JSON via `serde`.

pub mod collection;
pub mod context;
pub mod data_object;
pub mod download;
pub mod tiering;
