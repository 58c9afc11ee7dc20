//! Tessera Artifact
//!
//! This crate provides the artifact storage trait and its implementations.
//! Artifacts are uploaded test-run archives ("results") and the browsable HTML
//! reports generated by merging them.
//!
//! The [`ArtifactStore`] trait is the backend-agnostic contract. Two
//! implementations exist:
//! - [`FsStore`] keeps results and reports as files on local disk.
//! - [`BucketStore`] keeps them as keys in an S3-compatible bucket and streams
//!   large archives up as multipart uploads.
//!
//! Bulk operations (listing, deletion, report upload) fan out through the
//! [`BatchExecutor`], which bounds the number of in-flight items.
//!
//! Both backends share the same layout:
//!
//! ```text
//! results/{resultID}.json      result sidecar
//! results/{resultID}.zip       result archive
//! reports/{reportID}/index.html
//! reports/{reportID}/metadata.json
//! reports/{reportID}/...       generated assets
//! config.json                  site configuration
//! ```

mod batch;
mod bucket;
mod fs;
mod generator;
mod html;
mod keys;
mod repair;
mod size;
mod types;

pub use batch::{BatchExecutor, retry_fixed};
pub use bucket::{
  BucketSettings, BucketStore, ChunkAccumulator, CompletedPart, MultipartUploader, PartSink,
  UploadOutcome,
};
pub use fs::FsStore;
pub use generator::ReportGenerator;
pub use html::{HtmlReportSummary, parse_html_report};
pub use repair::KeyedLocks;
pub use size::format_bytes;
pub use types::{
  GeneratedReport, Listing, ParsedTest, Report, ReportRequest, ReportStats, ResultDetails,
  ResultRecord, ServerDataInfo,
};

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tessera_config::SiteConfig;

/// A boxed stream of bytes for artifact data.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Error type for artifact storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested result, report or object was not found.
  #[error("artifact not found: {0}")]
  NotFound(String),

  /// A local I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The object store rejected or failed a request.
  #[error("object store error: {0}")]
  ObjectStore(object_store::Error),

  /// The site configuration blob is malformed or fails its schema check.
  #[error("invalid config: {0}")]
  InvalidConfig(String),

  /// A multipart upload was aborted after a mid-sequence failure. The remote
  /// upload has been aborted before this error is returned.
  #[error("upload of '{key}' aborted: {source}")]
  UploadAborted {
    key: String,
    #[source]
    source: Box<Error>,
  },

  /// The external report generator failed or produced no report.
  #[error("report generation failed: {0}")]
  Generation(String),

  /// A sidecar could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// The caller passed something the store cannot act on.
  #[error("invalid input: {0}")]
  InvalidInput(String),
}

impl Error {
  /// Returns true if this error means the artifact does not exist.
  pub fn is_not_found(&self) -> bool {
    match self {
      Self::NotFound(_) => true,
      Self::UploadAborted { source, .. } => source.is_not_found(),
      _ => false,
    }
  }
}

impl From<object_store::Error> for Error {
  fn from(err: object_store::Error) -> Self {
    match err {
      object_store::Error::NotFound { path, .. } => Error::NotFound(path),
      other => Error::ObjectStore(other),
    }
  }
}

/// Backend-agnostic artifact storage.
///
/// Implementations own the durable copy of every result and report. Nothing
/// here touches the metadata cache; the service layer updates the cache after
/// these calls succeed.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
  /// List every result sidecar.
  async fn read_results(&self) -> Result<Listing<ResultRecord>, Error>;

  /// List every report, repairing missing sidecars on the way.
  async fn read_reports(&self) -> Result<Listing<Report>, Error>;

  /// Read a single report. `location` is the report's directory relative to
  /// the reports root when it differs from the report ID.
  async fn read_report(&self, report_id: &str, location: Option<&str>) -> Result<Report, Error>;

  /// Stream a result archive back.
  async fn read_result_archive(&self, result_id: &str) -> Result<ByteStream, Error>;

  /// Store a result archive under `filename` (e.g. `{resultID}.zip`).
  ///
  /// Returns the number of bytes written. Nothing is left behind when the
  /// stream errors mid-transfer.
  async fn save_result(&self, filename: &str, data: ByteStream) -> Result<u64, Error>;

  /// Persist the JSON sidecar for a result whose archive is already stored.
  async fn save_result_details(
    &self,
    result_id: &str,
    details: ResultDetails,
    size_bytes: u64,
  ) -> Result<ResultRecord, Error>;

  /// Merge the given results into a new report.
  async fn generate_report(
    &self,
    result_ids: &[String],
    request: ReportRequest,
  ) -> Result<GeneratedReport, Error>;

  /// Rewrite a report's metadata sidecar.
  async fn update_report_metadata(&self, report: &Report) -> Result<(), Error>;

  /// Delete results. Missing or undeletable items are logged and skipped.
  async fn delete_results(&self, result_ids: &[String]) -> Result<(), Error>;

  /// Delete reports. Missing or undeletable items are logged and skipped.
  async fn delete_reports(&self, report_ids: &[String]) -> Result<(), Error>;

  /// Read the site configuration. A missing blob yields the defaults.
  async fn read_config_file(&self) -> Result<SiteConfig, Error>;

  /// Merge `partial` into the stored site configuration and write it back.
  async fn save_config_file(&self, partial: serde_json::Value) -> Result<SiteConfig, Error>;

  /// Aggregate counts and sizes by walking the backend.
  async fn server_data_info(&self) -> Result<ServerDataInfo, Error>;

  /// A short-lived URL the client can PUT a result archive to directly.
  ///
  /// Backends without direct upload support return `None`.
  async fn presign_result_upload(
    &self,
    _filename: &str,
    _expires_in: Duration,
  ) -> Result<Option<String>, Error> {
    Ok(None)
  }
}
