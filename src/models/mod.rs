//! Core data models for the chunked-upload file store.
//!
//! An `Upload` is a logical, client-named container; a `Part` is one named
//! chunk of its bytes. Both map to SQLite tables via `sqlx::FromRow` and
//! serialize as JSON via `serde`.

pub mod part;
pub mod upload;
