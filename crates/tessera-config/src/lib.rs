//! Tessera Config
//!
//! This crate contains the serializable configuration types for tessera.
//!
//! - [`ServerConfig`] selects the storage backend and tunes the upload path,
//!   the metadata cache and the external report generator. It is loaded once
//!   at process start from an optional JSON file; every field has a default.
//! - [`SiteConfig`] is the small white-label blob that lives next to the
//!   artifacts themselves and is read and merged through the artifact store.

mod server;
mod site;

pub use server::{
  CacheConfig, ConfigError, DEFAULT_CHUNK_SIZE, GeneratorConfig, S3Config, ServerConfig, StorageConfig, UploadConfig,
};
pub use site::{CronSettings, JiraSettings, SiteConfig, merge_json};
