//! Streaming multipart upload.
//!
//! [`ChunkAccumulator`] slices an arbitrary sequence of reads into fixed-size
//! parts. [`MultipartUploader`] drives it from a [`ByteStream`] against a
//! [`PartSink`], uploading one part at a time so at most one chunk is
//! buffered no matter how fast the source produces data.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use tracing::{debug, warn};

use crate::{ByteStream, Error};

/// Buffers incoming bytes and hands them out in `chunk_size` slices.
#[derive(Debug)]
pub struct ChunkAccumulator {
  chunk_size: usize,
  buffer: BytesMut,
}

impl ChunkAccumulator {
  pub fn new(chunk_size: usize) -> Self {
    let chunk_size = chunk_size.max(1);
    Self {
      chunk_size,
      buffer: BytesMut::new(),
    }
  }

  pub fn push(&mut self, bytes: &[u8]) {
    self.buffer.extend_from_slice(bytes);
  }

  pub fn has_full_chunk(&self) -> bool {
    self.buffer.len() >= self.chunk_size
  }

  /// Take exactly one chunk off the front, if a full one is buffered.
  pub fn take_chunk(&mut self) -> Option<Bytes> {
    if !self.has_full_chunk() {
      return None;
    }
    Some(self.buffer.split_to(self.chunk_size).freeze())
  }

  /// Take whatever is left, if anything.
  pub fn take_remainder(&mut self) -> Option<Bytes> {
    if self.buffer.is_empty() {
      return None;
    }
    Some(self.buffer.split().freeze())
  }

  pub fn len(&self) -> usize {
    self.buffer.len()
  }

  pub fn is_empty(&self) -> bool {
    self.buffer.is_empty()
  }
}

/// A part accepted by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
  /// 1-based, strictly increasing in source order.
  pub part_number: usize,
  pub e_tag: String,
}

/// The remote side of a multipart upload.
#[async_trait]
pub trait PartSink: Send + Sync {
  /// Open a multipart upload and return its upload id.
  async fn create(&self, key: &str) -> Result<String, Error>;

  async fn put_part(
    &self,
    key: &str,
    upload_id: &str,
    part_number: usize,
    data: Bytes,
  ) -> Result<CompletedPart, Error>;

  async fn complete(
    &self,
    key: &str,
    upload_id: &str,
    parts: Vec<CompletedPart>,
  ) -> Result<(), Error>;

  async fn abort(&self, key: &str, upload_id: &str) -> Result<(), Error>;

  /// Store a small object in one request.
  async fn put_single(&self, key: &str, data: Bytes) -> Result<(), Error>;
}

/// [`PartSink`] backed by an `object_store` client.
pub(crate) struct ObjectPartSink {
  store: Arc<dyn ObjectStore>,
  multipart: Arc<dyn MultipartStore>,
}

impl ObjectPartSink {
  pub(crate) fn new(store: Arc<dyn ObjectStore>, multipart: Arc<dyn MultipartStore>) -> Self {
    Self { store, multipart }
  }
}

#[async_trait]
impl PartSink for ObjectPartSink {
  async fn create(&self, key: &str) -> Result<String, Error> {
    Ok(self.multipart.create_multipart(&Path::from(key)).await?)
  }

  async fn put_part(
    &self,
    key: &str,
    upload_id: &str,
    part_number: usize,
    data: Bytes,
  ) -> Result<CompletedPart, Error> {
    // object_store numbers parts from zero.
    let part = self
      .multipart
      .put_part(
        &Path::from(key),
        &upload_id.to_string(),
        part_number - 1,
        PutPayload::from_bytes(data),
      )
      .await?;
    Ok(CompletedPart {
      part_number,
      e_tag: part.content_id,
    })
  }

  async fn complete(
    &self,
    key: &str,
    upload_id: &str,
    mut parts: Vec<CompletedPart>,
  ) -> Result<(), Error> {
    parts.sort_by_key(|p| p.part_number);
    let parts = parts
      .into_iter()
      .map(|p| PartId {
        content_id: p.e_tag,
      })
      .collect();
    self
      .multipart
      .complete_multipart(&Path::from(key), &upload_id.to_string(), parts)
      .await?;
    Ok(())
  }

  async fn abort(&self, key: &str, upload_id: &str) -> Result<(), Error> {
    self
      .multipart
      .abort_multipart(&Path::from(key), &upload_id.to_string())
      .await?;
    Ok(())
  }

  async fn put_single(&self, key: &str, data: Bytes) -> Result<(), Error> {
    self
      .store
      .put(&Path::from(key), PutPayload::from_bytes(data))
      .await?;
    Ok(())
  }
}

/// What a finished upload looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOutcome {
  pub bytes: u64,
  /// Number of multipart parts; zero when the object went up in one request.
  pub parts: usize,
}

/// Aborts the remote upload if the uploading future is dropped before it
/// finished or cleaned up after itself.
struct AbortOnDrop {
  sink: Arc<dyn PartSink>,
  key: String,
  upload_id: String,
  armed: bool,
}

impl AbortOnDrop {
  fn disarm(&mut self) {
    self.armed = false;
  }
}

impl Drop for AbortOnDrop {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      warn!(key = %self.key, upload_id = %self.upload_id, "no runtime to abort dropped multipart upload");
      return;
    };
    let sink = self.sink.clone();
    let key = std::mem::take(&mut self.key);
    let upload_id = std::mem::take(&mut self.upload_id);
    handle.spawn(async move {
      match sink.abort(&key, &upload_id).await {
        Ok(()) => debug!(key = %key, upload_id = %upload_id, "aborted dropped multipart upload"),
        Err(e) => warn!(key = %key, upload_id = %upload_id, error = %e, "failed to abort dropped multipart upload"),
      }
    });
  }
}

struct OpenUpload {
  upload_id: String,
  parts: Vec<CompletedPart>,
  guard: AbortOnDrop,
}

/// Streams a [`ByteStream`] into a [`PartSink`].
///
/// The multipart upload is opened lazily once the first full chunk is
/// buffered, so a stream shorter than one chunk becomes a single put.
#[derive(Clone)]
pub struct MultipartUploader {
  sink: Arc<dyn PartSink>,
  chunk_size: usize,
}

impl MultipartUploader {
  pub fn new(sink: Arc<dyn PartSink>, chunk_size: usize) -> Self {
    Self {
      sink,
      chunk_size: chunk_size.max(1),
    }
  }

  pub fn chunk_size(&self) -> usize {
    self.chunk_size
  }

  /// Upload `data` to `key`.
  ///
  /// On any failure after the upload was opened, the upload is aborted before
  /// the error is returned as [`Error::UploadAborted`].
  pub async fn upload(&self, key: &str, data: ByteStream) -> Result<UploadOutcome, Error> {
    let mut open: Option<OpenUpload> = None;
    match self.drive(key, data, &mut open).await {
      Ok(outcome) => Ok(outcome),
      Err(e) => match open {
        Some(mut upload) => {
          if let Err(abort_err) = self.sink.abort(key, &upload.upload_id).await {
            warn!(key = %key, upload_id = %upload.upload_id, error = %abort_err, "failed to abort multipart upload");
          } else {
            debug!(key = %key, upload_id = %upload.upload_id, "aborted multipart upload");
          }
          upload.guard.disarm();
          Err(Error::UploadAborted {
            key: key.to_string(),
            source: Box::new(e),
          })
        }
        None => Err(e),
      },
    }
  }

  async fn drive(
    &self,
    key: &str,
    data: ByteStream,
    open: &mut Option<OpenUpload>,
  ) -> Result<UploadOutcome, Error> {
    let mut stream = data;
    let mut buffer = ChunkAccumulator::new(self.chunk_size);
    let mut total = 0u64;

    // The source is only polled again once the current part is stored.
    while let Some(chunk) = stream.next().await {
      let chunk = chunk?;
      total += chunk.len() as u64;
      buffer.push(&chunk);

      while let Some(part) = buffer.take_chunk() {
        self.put_next_part(key, part, open).await?;
      }
    }

    let Some(upload) = open.as_mut() else {
      // Never reached a full chunk.
      let data = buffer.take_remainder().unwrap_or_default();
      self.sink.put_single(key, data).await?;
      return Ok(UploadOutcome {
        bytes: total,
        parts: 0,
      });
    };

    if let Some(last) = buffer.take_remainder() {
      let part_number = upload.parts.len() + 1;
      let part = self
        .sink
        .put_part(key, &upload.upload_id, part_number, last)
        .await?;
      upload.parts.push(part);
    }

    let parts = upload.parts.clone();
    let count = parts.len();
    self.sink.complete(key, &upload.upload_id, parts).await?;
    upload.guard.disarm();
    debug!(key = %key, parts = count, bytes = total, "completed multipart upload");

    Ok(UploadOutcome {
      bytes: total,
      parts: count,
    })
  }

  async fn put_next_part(
    &self,
    key: &str,
    part: Bytes,
    open: &mut Option<OpenUpload>,
  ) -> Result<(), Error> {
    let upload = match open.take() {
      Some(upload) => upload,
      None => {
        let upload_id = self.sink.create(key).await?;
        debug!(key = %key, upload_id = %upload_id, "opened multipart upload");
        OpenUpload {
          guard: AbortOnDrop {
            sink: self.sink.clone(),
            key: key.to_string(),
            upload_id: upload_id.clone(),
            armed: true,
          },
          upload_id,
          parts: Vec::new(),
        }
      }
    };
    let upload = open.insert(upload);

    let part_number = upload.parts.len() + 1;
    let completed = self
      .sink
      .put_part(key, &upload.upload_id, part_number, part)
      .await?;
    upload.parts.push(completed);
    Ok(())
  }
}
