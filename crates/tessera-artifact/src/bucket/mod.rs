//! S3-compatible bucket backend.

mod listing;
mod multipart;

pub use multipart::{ChunkAccumulator, CompletedPart, MultipartUploader, PartSink, UploadOutcome};

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::multipart::MultipartStore;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_config::{DEFAULT_CHUNK_SIZE, S3Config, SiteConfig};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::batch::{BatchExecutor, retry_fixed};
use crate::generator::ReportGenerator;
use crate::html::parse_html_report;
use crate::keys::{self, REPORT_INDEX, REPORT_METADATA};
use crate::repair::KeyedLocks;
use crate::types::{
  GeneratedReport, Listing, Report, ReportRequest, ResultDetails, ResultRecord, ServerDataInfo,
};
use crate::{ArtifactStore, ByteStream, Error};

use listing::Inventory;
use multipart::ObjectPartSink;

/// Tunables for [`BucketStore`].
#[derive(Debug, Clone)]
pub struct BucketSettings {
  pub chunk_size: usize,
  pub batch: BatchExecutor,
  /// Attempts per file when uploading a generated report.
  pub file_upload_attempts: u32,
  pub report_url_prefix: String,
  /// Local directory checked for result archives before downloading them.
  pub staging_dir: Option<PathBuf>,
}

impl Default for BucketSettings {
  fn default() -> Self {
    Self {
      chunk_size: DEFAULT_CHUNK_SIZE,
      batch: BatchExecutor::default(),
      file_upload_attempts: 3,
      report_url_prefix: "/api/serve".to_string(),
      staging_dir: None,
    }
  }
}

/// Artifact store backed by an S3-compatible bucket.
///
/// Uses the same key layout as [`FsStore`](crate::FsStore). Result archives
/// are streamed up through a [`MultipartUploader`]; generated reports are
/// built in a local scratch directory and uploaded file by file.
pub struct BucketStore {
  store: Arc<dyn ObjectStore>,
  uploader: MultipartUploader,
  signer: Option<Arc<dyn Signer>>,
  generator: ReportGenerator,
  settings: BucketSettings,
  repairs: KeyedLocks,
}

impl BucketStore {
  /// Connect to S3 (or a compatible endpoint) using `AWS_*` credentials from
  /// the environment.
  pub fn s3(
    config: &S3Config,
    settings: BucketSettings,
    generator: ReportGenerator,
  ) -> Result<Self, Error> {
    let mut builder = AmazonS3Builder::from_env()
      .with_bucket_name(&config.bucket)
      .with_allow_http(config.allow_http);
    if let Some(region) = &config.region {
      builder = builder.with_region(region);
    }
    if let Some(endpoint) = &config.endpoint {
      builder = builder.with_endpoint(endpoint);
    }
    let s3 = Arc::new(
      builder
        .build()
        .map_err(|e| Error::InvalidConfig(format!("failed to create S3 client: {}", e)))?,
    );

    info!(bucket = %config.bucket, "using S3 artifact store");
    let mut store = Self::new(s3.clone(), s3.clone(), settings, generator);
    store.signer = Some(s3);
    Ok(store)
  }

  /// An in-memory bucket, for tests and local experiments.
  pub fn memory(settings: BucketSettings, generator: ReportGenerator) -> Self {
    let inner = Arc::new(InMemory::new());
    Self::new(inner.clone(), inner, settings, generator)
  }

  pub fn new(
    store: Arc<dyn ObjectStore>,
    multipart: Arc<dyn MultipartStore>,
    settings: BucketSettings,
    generator: ReportGenerator,
  ) -> Self {
    let sink = Arc::new(ObjectPartSink::new(store.clone(), multipart));
    Self {
      store,
      uploader: MultipartUploader::new(sink, settings.chunk_size),
      signer: None,
      generator,
      settings,
      repairs: KeyedLocks::new(),
    }
  }

  /// Replace the part sink, e.g. to inject failures.
  pub fn with_part_sink(mut self, sink: Arc<dyn PartSink>) -> Self {
    self.uploader = MultipartUploader::new(sink, self.settings.chunk_size);
    self
  }

  /// The underlying object store client.
  pub fn inner(&self) -> &Arc<dyn ObjectStore> {
    &self.store
  }

  async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
    match self.store.get(&Path::from(key)).await {
      Ok(result) => {
        let raw = result.bytes().await?;
        Ok(Some(serde_json::from_slice(&raw)?))
      }
      Err(object_store::Error::NotFound { .. }) => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
    let encoded = serde_json::to_vec_pretty(value)?;
    self
      .store
      .put(&Path::from(key), PutPayload::from_bytes(Bytes::from(encoded)))
      .await?;
    Ok(())
  }

  async fn exists(&self, key: &str) -> Result<bool, Error> {
    match self.store.head(&Path::from(key)).await {
      Ok(_) => Ok(true),
      Err(object_store::Error::NotFound { .. }) => Ok(false),
      Err(e) => Err(e.into()),
    }
  }

  async fn prefix_size(&self, prefix: &str) -> Result<u64, Error> {
    let prefix = Path::from(prefix);
    self
      .store
      .list(Some(&prefix))
      .try_fold(0u64, |total, meta| async move {
        Ok::<_, object_store::Error>(total + meta.size as u64)
      })
      .await
      .map_err(Error::from)
  }

  /// Report metadata, repairing a missing sidecar. Size is left to the caller.
  ///
  /// `listed_sidecar` is false when a listing already showed there is no
  /// sidecar; the GET is skipped and the report goes straight to repair.
  async fn load_report(
    &self,
    report_id: &str,
    location: &str,
    listed_sidecar: bool,
  ) -> Result<Report, Error> {
    let existing = if listed_sidecar {
      self
        .get_json::<Report>(&keys::report_file(location, REPORT_METADATA))
        .await?
    } else {
      None
    };
    let mut report = match existing {
      Some(report) => report,
      None => self.repair_report(report_id, location).await?,
    };
    if report.report_url.is_empty() {
      report.report_url = keys::report_url(&self.settings.report_url_prefix, location);
    }
    Ok(report)
  }

  async fn repair_report(&self, report_id: &str, location: &str) -> Result<Report, Error> {
    let _guard = self.repairs.lock(location).await;
    let sidecar = keys::report_file(location, REPORT_METADATA);

    if let Some(report) = self.get_json::<Report>(&sidecar).await? {
      return Ok(report);
    }

    let index = Path::from(keys::report_file(location, REPORT_INDEX));
    let fetched = match self.store.get(&index).await {
      Ok(fetched) => fetched,
      Err(object_store::Error::NotFound { .. }) => {
        return Err(Error::NotFound(format!("report {}", report_id)));
      }
      Err(e) => return Err(e.into()),
    };
    let created_at = fetched.meta.last_modified;
    let html = fetched.bytes().await?;
    let stats = match parse_html_report(&String::from_utf8_lossy(&html)) {
      Ok(summary) => summary.unwrap_or_default().stats,
      Err(e) => {
        warn!(report_id = %report_id, error = %e, "could not parse report html, using empty stats");
        Default::default()
      }
    };
    let project = location
      .rsplit_once('/')
      .map(|(project, _)| project.to_string())
      .unwrap_or_default();

    let report = Report::synthesized(
      report_id,
      project,
      stats,
      created_at,
      keys::report_url(&self.settings.report_url_prefix, location),
    );
    self.put_json(&sidecar, &report).await?;
    info!(report_id = %report_id, "synthesized missing report metadata");

    Ok(report)
  }

  /// Put every result archive into `input`, preferring the staging directory.
  async fn fetch_results(&self, result_ids: &[String], input: &FsPath) -> Result<(), Error> {
    self
      .settings
      .batch
      .try_run(result_ids, |result_id| async move {
        let dest = input.join(format!("{}.zip", result_id));
        if let Some(staging) = &self.settings.staging_dir {
          let staged = staging.join(format!("{}.zip", result_id));
          if fs::try_exists(&staged).await.unwrap_or(false) {
            debug!(result_id = %result_id, "using staged result archive");
            fs::copy(&staged, &dest).await?;
            return Ok(());
          }
        }

        let mut archive = self.read_result_archive(result_id).await?;
        let mut file = fs::File::create(&dest).await?;
        while let Some(chunk) = archive.next().await {
          file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok::<_, Error>(())
      })
      .await?;
    Ok(())
  }

  /// Upload every file under `dir` below `reports/{report_id}/`.
  ///
  /// The sidecar goes up first, so a listing that finds the entry page also
  /// finds the metadata and never repairs a report still being uploaded.
  async fn upload_report_tree(&self, report_id: &str, dir: &FsPath) -> Result<(), Error> {
    let (sidecar, rest): (Vec<String>, Vec<String>) = walk_files(dir)
      .await?
      .into_iter()
      .partition(|relative| relative == REPORT_METADATA);

    self.upload_report_files(report_id, dir, sidecar).await?;
    self.upload_report_files(report_id, dir, rest).await
  }

  async fn upload_report_files(
    &self,
    report_id: &str,
    dir: &FsPath,
    files: Vec<String>,
  ) -> Result<(), Error> {
    let attempts = self.settings.file_upload_attempts;

    self
      .settings
      .batch
      .try_run(files, |relative| async move {
        let key = keys::report_file(report_id, &relative);
        let path = dir.join(&relative);
        let (key, path, uploader) = (&key, &path, &self.uploader);
        retry_fixed(attempts, key, move || async move {
          let file = fs::File::open(path).await?;
          let stream: ByteStream = Box::pin(ReaderStream::new(file).map_err(Error::Io));
          uploader.upload(key, stream).await.map(|_| ())
        })
        .await
      })
      .await?;
    Ok(())
  }

  async fn delete_prefix(&self, prefix: &str) -> Result<usize, Error> {
    let prefix = Path::from(prefix);
    let locations: Vec<Path> = self
      .store
      .list(Some(&prefix))
      .map_ok(|meta| meta.location)
      .try_collect()
      .await?;
    let count = locations.len();

    self
      .settings
      .batch
      .run(locations, |location| async move {
        match self.store.delete(&location).await {
          Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
          Err(e) => warn!(key = %location, error = %e, "failed to delete object"),
        }
      })
      .await;
    Ok(count)
  }

  async fn build_report(
    &self,
    report_id: &str,
    scratch: &FsPath,
    result_ids: &[String],
    request: ReportRequest,
  ) -> Result<GeneratedReport, Error> {
    let input = scratch.join("input");
    let output = scratch.join("output");
    fs::create_dir_all(&input).await?;

    self.fetch_results(result_ids, &input).await?;
    self.generator.run(&input, &output).await?;

    let html = fs::read_to_string(output.join(REPORT_INDEX)).await?;
    let summary = parse_html_report(&html)?.unwrap_or_default();
    let mut report = Report::generated(
      report_id,
      request,
      summary.stats,
      keys::report_url(&self.settings.report_url_prefix, report_id),
    );
    fs::write(
      output.join(REPORT_METADATA),
      serde_json::to_vec_pretty(&report)?,
    )
    .await?;
    report.set_size(local_tree_size(&output).await?);

    self.upload_report_tree(report_id, &output).await?;

    Ok(GeneratedReport {
      report_id: report_id.to_string(),
      report_path: keys::report_prefix(report_id),
      report,
      tests: summary.tests,
    })
  }
}

#[async_trait]
impl ArtifactStore for BucketStore {
  async fn read_results(&self) -> Result<Listing<ResultRecord>, Error> {
    let inventory = Inventory::scan(self.store.as_ref(), Some(keys::RESULTS_DIR)).await?;
    let archive_sizes = &inventory.archive_sizes;

    let outcomes = self
      .settings
      .batch
      .run(&inventory.result_sidecars, |result_id| async move {
        let record = self
          .get_json::<ResultRecord>(&keys::result_sidecar(result_id))
          .await?;
        let mut record = record.ok_or_else(|| Error::NotFound(format!("result {}", result_id)))?;
        if record.size_bytes == 0
          && let Some(size) = archive_sizes.get(result_id)
        {
          record.size_bytes = *size;
          record.size = crate::format_bytes(*size);
        }
        Ok::<_, Error>(record)
      })
      .await;

    let mut records = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
      match outcome {
        Ok(record) => records.push(record),
        Err(e) => warn!(error = %e, "skipping unreadable result sidecar"),
      }
    }
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(Listing::new(records))
  }

  async fn read_reports(&self) -> Result<Listing<Report>, Error> {
    let inventory = Inventory::scan(self.store.as_ref(), Some(keys::REPORTS_DIR)).await?;
    let sizes = &inventory.report_sizes;
    let sidecars = &inventory.report_sidecars;

    let outcomes = self
      .settings
      .batch
      .run(&inventory.report_indexes, |report_id| async move {
        let listed = sidecars.contains(report_id);
        let outcome = self
          .load_report(report_id, report_id, listed)
          .await
          .map(|mut report| {
            report.set_size(sizes.get(report_id).copied().unwrap_or_default());
            report
          });
        (report_id, outcome)
      })
      .await;

    let mut reports = Vec::with_capacity(outcomes.len());
    for (report_id, outcome) in outcomes {
      match outcome {
        Ok(report) => reports.push(report),
        Err(e) => warn!(report_id = %report_id, error = %e, "skipping unreadable report"),
      }
    }
    reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(Listing::new(reports))
  }

  async fn read_report(&self, report_id: &str, location: Option<&str>) -> Result<Report, Error> {
    keys::validate_id(report_id)?;
    let location = location.unwrap_or(report_id);
    keys::validate_location(location)?;

    let mut report = self.load_report(report_id, location, true).await?;
    report.set_size(self.prefix_size(&keys::report_prefix(location)).await?);
    Ok(report)
  }

  async fn read_result_archive(&self, result_id: &str) -> Result<ByteStream, Error> {
    keys::validate_id(result_id)?;
    let fetched = self
      .store
      .get(&Path::from(keys::result_archive(result_id)))
      .await
      .map_err(|e| match e {
        object_store::Error::NotFound { .. } => Error::NotFound(format!("result {}", result_id)),
        other => other.into(),
      })?;
    Ok(Box::pin(fetched.into_stream().map_err(Error::from)))
  }

  async fn save_result(&self, filename: &str, data: ByteStream) -> Result<u64, Error> {
    keys::validate_id(filename)?;
    let key = keys::result_file(filename);
    let outcome = self.uploader.upload(&key, data).await?;
    info!(key = %key, bytes = outcome.bytes, parts = outcome.parts, "stored result archive");
    Ok(outcome.bytes)
  }

  async fn save_result_details(
    &self,
    result_id: &str,
    details: ResultDetails,
    size_bytes: u64,
  ) -> Result<ResultRecord, Error> {
    keys::validate_id(result_id)?;
    let record = ResultRecord::from_details(result_id, details, size_bytes);
    self
      .put_json(&keys::result_sidecar(result_id), &record)
      .await?;
    Ok(record)
  }

  async fn generate_report(
    &self,
    result_ids: &[String],
    request: ReportRequest,
  ) -> Result<GeneratedReport, Error> {
    if result_ids.is_empty() {
      return Err(Error::InvalidInput(
        "at least one result is required".to_string(),
      ));
    }
    for result_id in result_ids {
      keys::validate_id(result_id)?;
    }

    let report_id = uuid::Uuid::new_v4().to_string();
    let scratch = tempfile::Builder::new()
      .prefix("tessera-report-")
      .tempdir()?;
    let started = Utc::now();

    let outcome = self
      .build_report(&report_id, scratch.path(), result_ids, request)
      .await;

    match &outcome {
      Ok(_) => info!(
        report_id = %report_id,
        results = result_ids.len(),
        elapsed_ms = (Utc::now() - started).num_milliseconds(),
        "report generated and uploaded"
      ),
      Err(e) => {
        warn!(report_id = %report_id, error = %e, "report generation failed");
        if let Err(cleanup) = self.delete_prefix(&keys::report_prefix(&report_id)).await {
          warn!(report_id = %report_id, error = %cleanup, "failed to remove partial report");
        }
      }
    }

    outcome
  }

  async fn update_report_metadata(&self, report: &Report) -> Result<(), Error> {
    keys::validate_id(&report.report_id)?;
    if !self
      .exists(&keys::report_file(&report.report_id, REPORT_INDEX))
      .await?
    {
      return Err(Error::NotFound(format!("report {}", report.report_id)));
    }
    self
      .put_json(&keys::report_file(&report.report_id, REPORT_METADATA), report)
      .await
  }

  async fn delete_results(&self, result_ids: &[String]) -> Result<(), Error> {
    let targets: Vec<String> = result_ids
      .iter()
      .filter(|id| match keys::validate_id(id) {
        Ok(()) => true,
        Err(e) => {
          warn!(result_id = %id, error = %e, "skipping result deletion");
          false
        }
      })
      .flat_map(|id| [keys::result_sidecar(id), keys::result_archive(id)])
      .collect();

    self
      .settings
      .batch
      .run(targets, |key| async move {
        match self.store.delete(&Path::from(key.as_str())).await {
          Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
          Err(e) => warn!(key = %key, error = %e, "failed to delete result object"),
        }
      })
      .await;
    Ok(())
  }

  async fn delete_reports(&self, report_ids: &[String]) -> Result<(), Error> {
    self
      .settings
      .batch
      .run(report_ids, |report_id| async move {
        if let Err(e) = keys::validate_location(report_id) {
          warn!(report_id = %report_id, error = %e, "skipping report deletion");
          return;
        }
        match self.delete_prefix(&keys::report_prefix(report_id)).await {
          Ok(0) => debug!(report_id = %report_id, "report had no objects"),
          Ok(_) => {}
          Err(e) => warn!(report_id = %report_id, error = %e, "failed to delete report"),
        }
      })
      .await;
    Ok(())
  }

  async fn read_config_file(&self) -> Result<SiteConfig, Error> {
    match self.store.get(&Path::from(keys::CONFIG_FILE)).await {
      Ok(fetched) => {
        let raw = fetched.bytes().await?;
        SiteConfig::from_slice(&raw).map_err(|e| Error::InvalidConfig(e.to_string()))
      }
      Err(object_store::Error::NotFound { .. }) => Ok(SiteConfig::default()),
      Err(e) => Err(e.into()),
    }
  }

  async fn save_config_file(&self, partial: serde_json::Value) -> Result<SiteConfig, Error> {
    let existing = match self.read_config_file().await {
      Ok(config) => config,
      Err(Error::InvalidConfig(message)) => {
        warn!(error = %message, "stored config is invalid, merging onto defaults");
        SiteConfig::default()
      }
      Err(e) => return Err(e),
    };
    let merged = existing
      .merged(partial)
      .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    self.put_json(keys::CONFIG_FILE, &merged).await?;
    Ok(merged)
  }

  async fn server_data_info(&self) -> Result<ServerDataInfo, Error> {
    let inventory = Inventory::scan(self.store.as_ref(), None).await?;
    Ok(ServerDataInfo::new(
      inventory.results_count(),
      inventory.results_bytes,
      inventory.reports_count(),
      inventory.reports_bytes,
    ))
  }

  async fn presign_result_upload(
    &self,
    filename: &str,
    expires_in: Duration,
  ) -> Result<Option<String>, Error> {
    let Some(signer) = &self.signer else {
      return Ok(None);
    };
    keys::validate_id(filename)?;
    let url = signer
      .signed_url(
        reqwest::Method::PUT,
        &Path::from(keys::result_file(filename)),
        expires_in,
      )
      .await?;
    Ok(Some(url.to_string()))
  }
}

/// Relative paths of every regular file under `root`.
async fn walk_files(root: &FsPath) -> Result<Vec<String>, Error> {
  let mut files = Vec::new();
  let mut pending = vec![PathBuf::new()];

  while let Some(relative) = pending.pop() {
    let mut entries = fs::read_dir(root.join(&relative)).await?;
    while let Some(entry) = entries.next_entry().await? {
      let path = relative.join(entry.file_name());
      if entry.file_type().await?.is_dir() {
        pending.push(path);
      } else {
        files.push(path.to_string_lossy().replace('\\', "/"));
      }
    }
  }

  files.sort();
  Ok(files)
}

async fn local_tree_size(root: &FsPath) -> Result<u64, Error> {
  let mut total = 0;
  for relative in walk_files(root).await? {
    total += fs::metadata(root.join(relative)).await?.len();
  }
  Ok(total)
}
