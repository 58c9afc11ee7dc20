//! Tessera Upload
//!
//! Moves an inbound result archive into storage. When the backend can mint a
//! presigned URL and the caller declared the length up front, the bytes go
//! straight to the bucket with a single PUT; otherwise they are piped through
//! [`ArtifactStore::save_result`]. Either way the number of bytes that
//! actually arrived must match the declared length, or the upload is thrown
//! away.

mod counter;

use std::sync::Arc;
use std::time::Duration;

use tessera_artifact::{ArtifactStore, ByteStream};
use tessera_config::UploadConfig;
use tracing::{info, instrument, warn};

use counter::{CountingStream, Tally};

/// Error type for result uploads.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
  /// The client declared one length and sent another.
  #[error("size mismatch: declared {expected} bytes, received {actual}")]
  SizeMismatch { expected: u64, actual: u64 },

  /// The presigned PUT was answered with a non-2xx status.
  #[error("direct upload failed with status {status}: {body}")]
  UploadFailed { status: u16, body: String },

  /// The presigned PUT never got an answer.
  #[error("direct upload request failed: {0}")]
  Request(#[from] reqwest::Error),

  #[error(transparent)]
  Store(#[from] tessera_artifact::Error),
}

/// How the bytes reached storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRoute {
  Presigned,
  Store,
}

/// A successfully stored archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
  pub result_id: String,
  pub filename: String,
  pub size_bytes: u64,
  pub route: UploadRoute,
}

/// Streams result archives into an [`ArtifactStore`].
#[derive(Clone)]
pub struct UploadPipeline {
  store: Arc<dyn ArtifactStore>,
  client: reqwest::Client,
  presign: bool,
  presign_expiry: Duration,
}

impl UploadPipeline {
  pub fn new(store: Arc<dyn ArtifactStore>, config: &UploadConfig) -> Self {
    Self {
      store,
      client: reqwest::Client::new(),
      presign: config.presign,
      presign_expiry: Duration::from_secs(config.presign_expiry_secs),
    }
  }

  pub fn with_client(mut self, client: reqwest::Client) -> Self {
    self.client = client;
    self
  }

  /// Store the archive for `result_id`.
  ///
  /// `declared_length` is the length the client announced (e.g. its
  /// `Content-Length`). It enables the presigned route and is checked against
  /// the bytes actually received.
  #[instrument(skip(self, data))]
  pub async fn upload(
    &self,
    result_id: &str,
    data: ByteStream,
    declared_length: Option<u64>,
  ) -> Result<UploadReceipt, UploadError> {
    let filename = format!("{}.zip", result_id);

    let presigned = match declared_length {
      Some(_) if self.presign => {
        self
          .store
          .presign_result_upload(&filename, self.presign_expiry)
          .await?
      }
      _ => None,
    };

    let (counted, tally) = CountingStream::new(data, declared_length);
    let data: ByteStream = Box::pin(counted);

    let (outcome, route) = match (presigned, declared_length) {
      (Some(url), Some(expected)) => (
        self.put_presigned(&url, data, expected).await,
        UploadRoute::Presigned,
      ),
      _ => (
        self
          .store
          .save_result(&filename, data)
          .await
          .map_err(UploadError::from),
        UploadRoute::Store,
      ),
    };
    let size_bytes = settle(result_id, outcome, declared_length, &tally)?;

    info!(result_id = %result_id, size_bytes, route = ?route, "result archive stored");
    Ok(UploadReceipt {
      result_id: result_id.to_string(),
      filename,
      size_bytes,
      route,
    })
  }

  /// PUT the stream to a presigned URL, returning the length that was sent.
  ///
  /// A body that errors part way drops the request, so the bucket never
  /// commits the object.
  async fn put_presigned(
    &self,
    url: &str,
    data: ByteStream,
    expected: u64,
  ) -> Result<u64, UploadError> {
    let response = self
      .client
      .put(url)
      .header(reqwest::header::CONTENT_LENGTH, expected)
      .header(reqwest::header::CONTENT_TYPE, "application/zip")
      .body(reqwest::Body::wrap_stream(data))
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(UploadError::UploadFailed {
        status: status.as_u16(),
        body,
      });
    }
    Ok(expected)
  }
}

/// Turn a transfer the length check failed into `SizeMismatch`.
///
/// Nothing is deleted here: the check fails the stream before the store
/// commits, so an earlier archive under the same ID survives.
fn settle(
  result_id: &str,
  outcome: Result<u64, UploadError>,
  declared_length: Option<u64>,
  tally: &Tally,
) -> Result<u64, UploadError> {
  let Some(expected) = declared_length else {
    return outcome;
  };
  let actual = if tally.mismatched() {
    tally.seen()
  } else {
    outcome?
  };
  if actual == expected {
    return Ok(actual);
  }

  warn!(result_id = %result_id, expected, actual, "discarded result archive with wrong size");
  Err(UploadError::SizeMismatch { expected, actual })
}
