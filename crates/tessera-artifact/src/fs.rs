use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tessera_config::SiteConfig;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::batch::BatchExecutor;
use crate::generator::ReportGenerator;
use crate::html::parse_html_report;
use crate::keys::{self, REPORT_INDEX, REPORT_METADATA};
use crate::repair::KeyedLocks;
use crate::types::{
  GeneratedReport, Listing, Report, ReportRequest, ResultDetails, ResultRecord, ServerDataInfo,
};
use crate::{ArtifactStore, ByteStream, Error};

/// Filesystem-based artifact store.
///
/// ```text
/// {root}/
/// ├── config.json
/// ├── .staging/              reports being generated
/// ├── results/
/// │   ├── {resultID}.json
/// │   └── {resultID}.zip
/// └── reports/
///     └── {reportID}/
///         ├── index.html
///         ├── metadata.json
///         └── ...
/// ```
pub struct FsStore {
  root: PathBuf,
  generator: ReportGenerator,
  batch: BatchExecutor,
  report_url_prefix: String,
  repairs: KeyedLocks,
}

impl FsStore {
  /// Create a new filesystem store with the given base path.
  pub fn new(root: impl Into<PathBuf>, generator: ReportGenerator) -> Self {
    Self {
      root: root.into(),
      generator,
      batch: BatchExecutor::default(),
      report_url_prefix: "/api/serve".to_string(),
      repairs: KeyedLocks::new(),
    }
  }

  pub fn with_batch(mut self, batch: BatchExecutor) -> Self {
    self.batch = batch;
    self
  }

  pub fn with_report_url_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.report_url_prefix = prefix.into();
    self
  }

  /// Get the root directory of the store.
  pub fn root(&self) -> &Path {
    &self.root
  }

  fn key_to_path(&self, key: &str) -> PathBuf {
    self.root.join(key)
  }

  fn report_dir(&self, location: &str) -> PathBuf {
    self.key_to_path(&keys::report_prefix(location))
  }

  async fn read_report_sidecar(&self, dir: &Path) -> Result<Option<Report>, Error> {
    match fs::read(dir.join(REPORT_METADATA)).await {
      Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  /// Synthesize and persist the sidecar of a report created out-of-band.
  async fn repair_report(&self, report_id: &str, location: &str) -> Result<Report, Error> {
    let _guard = self.repairs.lock(location).await;
    let dir = self.report_dir(location);

    // Someone else may have repaired it while we waited.
    if let Some(report) = self.read_report_sidecar(&dir).await? {
      return Ok(report);
    }

    let index = dir.join(REPORT_INDEX);
    let html = fs::read_to_string(&index)
      .await
      .map_err(|e| not_found_or_io(e, report_id))?;
    let stats = match parse_html_report(&html) {
      Ok(summary) => summary.unwrap_or_default().stats,
      Err(e) => {
        warn!(report_id = %report_id, error = %e, "could not parse report html, using empty stats");
        Default::default()
      }
    };
    let created_at = fs::metadata(&index)
      .await?
      .modified()
      .map(DateTime::<Utc>::from)
      .unwrap_or_else(|_| Utc::now());
    let project = location
      .rsplit_once('/')
      .map(|(project, _)| project.to_string())
      .unwrap_or_default();

    let report = Report::synthesized(
      report_id,
      project,
      stats,
      created_at,
      keys::report_url(&self.report_url_prefix, location),
    );
    write_json(&dir.join(REPORT_METADATA), &report).await?;
    info!(report_id = %report_id, "synthesized missing report metadata");

    Ok(report)
  }

  /// Build the report in `staged`, then move the finished directory to
  /// `report_dir`. Readers never see a report without its sidecar.
  async fn build_report(
    &self,
    report_id: &str,
    staged: &Path,
    report_dir: &Path,
    scratch: &Path,
    result_ids: &[String],
    request: ReportRequest,
  ) -> Result<GeneratedReport, Error> {
    let results_dir = self.key_to_path(keys::RESULTS_DIR);
    self
      .batch
      .try_run(result_ids, |result_id| {
        let src = results_dir.join(format!("{}.zip", result_id));
        let dest = scratch.join(format!("{}.zip", result_id));
        async move {
          fs::copy(&src, &dest)
            .await
            .map(|_| ())
            .map_err(|e| not_found_or_io(e, &format!("result {}", result_id)))
        }
      })
      .await?;

    fs::create_dir_all(staged).await?;
    self.generator.run(scratch, staged).await?;

    let html = fs::read_to_string(staged.join(REPORT_INDEX)).await?;
    let summary = parse_html_report(&html)?.unwrap_or_default();

    let mut report = Report::generated(
      report_id,
      request,
      summary.stats,
      keys::report_url(&self.report_url_prefix, report_id),
    );
    write_json(&staged.join(REPORT_METADATA), &report).await?;
    report.set_size(dir_size(staged).await?);

    fs::rename(staged, report_dir).await?;

    Ok(GeneratedReport {
      report_id: report_id.to_string(),
      report_path: report_dir.to_string_lossy().into_owned(),
      report,
      tests: summary.tests,
    })
  }
}

#[async_trait]
impl ArtifactStore for FsStore {
  async fn read_results(&self) -> Result<Listing<ResultRecord>, Error> {
    let results_dir = self.key_to_path(keys::RESULTS_DIR);
    let sidecars = match list_dir(&results_dir).await {
      Ok(entries) => entries
        .into_iter()
        .filter(|name| !name.starts_with('.') && name.ends_with(".json"))
        .collect::<Vec<_>>(),
      Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
      Err(e) => return Err(e.into()),
    };

    let outcomes = self
      .batch
      .run(sidecars, |name| {
        let path = results_dir.join(&name);
        async move {
          let raw = fs::read(&path).await?;
          let mut record: ResultRecord = serde_json::from_slice(&raw)?;
          if record.size_bytes == 0 {
            let archive = path.with_extension("zip");
            if let Ok(meta) = fs::metadata(&archive).await {
              record.size_bytes = meta.len();
              record.size = crate::format_bytes(meta.len());
            }
          }
          Ok::<_, Error>(record)
        }
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
    let reports_dir = self.key_to_path(keys::REPORTS_DIR);
    let ids = match list_dir(&reports_dir).await {
      Ok(entries) => entries,
      Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
      Err(e) => return Err(e.into()),
    };

    let outcomes = self
      .batch
      .run(ids, |id| async move {
        let outcome = self.read_report(&id, None).await;
        (id, outcome)
      })
      .await;

    let mut reports = Vec::with_capacity(outcomes.len());
    for (id, outcome) in outcomes {
      match outcome {
        Ok(report) => reports.push(report),
        Err(e) if e.is_not_found() => {
          warn!(report_id = %id, "report directory has no index, skipping");
        }
        Err(e) => warn!(report_id = %id, error = %e, "skipping unreadable report"),
      }
    }
    reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(Listing::new(reports))
  }

  async fn read_report(&self, report_id: &str, location: Option<&str>) -> Result<Report, Error> {
    keys::validate_id(report_id)?;
    let location = location.unwrap_or(report_id);
    keys::validate_location(location)?;

    let dir = self.report_dir(location);
    if !fs::try_exists(&dir).await? {
      return Err(Error::NotFound(format!("report {}", report_id)));
    }

    let mut report = match self.read_report_sidecar(&dir).await? {
      Some(report) => report,
      None => self.repair_report(report_id, location).await?,
    };
    if report.report_url.is_empty() {
      report.report_url = keys::report_url(&self.report_url_prefix, location);
    }
    report.set_size(dir_size(&dir).await?);

    Ok(report)
  }

  async fn read_result_archive(&self, result_id: &str) -> Result<ByteStream, Error> {
    keys::validate_id(result_id)?;
    let path = self.key_to_path(&keys::result_archive(result_id));
    let file = File::open(&path)
      .await
      .map_err(|e| not_found_or_io(e, &format!("result {}", result_id)))?;
    let stream = ReaderStream::new(file).map(|r| r.map_err(Error::Io));
    Ok(Box::pin(stream))
  }

  async fn save_result(&self, filename: &str, data: ByteStream) -> Result<u64, Error> {
    keys::validate_id(filename)?;
    let path = self.key_to_path(&keys::result_file(filename));
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    // Stream into a hidden temp file so a broken upload never leaves a
    // truncated archive under the real name.
    let partial = path.with_file_name(format!(".{}.{}.part", filename, uuid::Uuid::new_v4()));
    match write_stream(&partial, data).await {
      Ok(written) => {
        fs::rename(&partial, &path).await?;
        Ok(written)
      }
      Err(e) => {
        if let Err(cleanup) = fs::remove_file(&partial).await
          && cleanup.kind() != ErrorKind::NotFound
        {
          warn!(path = %partial.display(), error = %cleanup, "failed to remove partial upload");
        }
        Err(e)
      }
    }
  }

  async fn save_result_details(
    &self,
    result_id: &str,
    details: ResultDetails,
    size_bytes: u64,
  ) -> Result<ResultRecord, Error> {
    keys::validate_id(result_id)?;
    let record = ResultRecord::from_details(result_id, details, size_bytes);
    let path = self.key_to_path(&keys::result_sidecar(result_id));
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }
    write_json(&path, &record).await?;
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
    let report_dir = self.report_dir(&report_id);
    let staged = self.key_to_path(keys::STAGING_DIR).join(&report_id);
    fs::create_dir_all(self.key_to_path(keys::REPORTS_DIR)).await?;

    // Removed on drop, whether generation succeeds or not.
    let scratch = tempfile::Builder::new()
      .prefix("tessera-report-")
      .tempdir()?;

    let outcome = self
      .build_report(
        &report_id,
        &staged,
        &report_dir,
        scratch.path(),
        result_ids,
        request,
      )
      .await;

    if let Err(e) = &outcome {
      warn!(report_id = %report_id, error = %e, "report generation failed");
      if let Err(cleanup) = fs::remove_dir_all(&staged).await
        && cleanup.kind() != ErrorKind::NotFound
      {
        warn!(report_id = %report_id, error = %cleanup, "failed to remove staged report");
      }
    } else {
      info!(report_id = %report_id, results = result_ids.len(), "report generated");
    }

    outcome
  }

  async fn update_report_metadata(&self, report: &Report) -> Result<(), Error> {
    keys::validate_id(&report.report_id)?;
    let dir = self.report_dir(&report.report_id);
    if !fs::try_exists(&dir).await? {
      return Err(Error::NotFound(format!("report {}", report.report_id)));
    }
    write_json(&dir.join(REPORT_METADATA), report).await
  }

  async fn delete_results(&self, result_ids: &[String]) -> Result<(), Error> {
    self
      .batch
      .run(result_ids, |result_id| async move {
        if let Err(e) = keys::validate_id(result_id) {
          warn!(result_id = %result_id, error = %e, "skipping result deletion");
          return;
        }
        for key in [
          keys::result_sidecar(result_id),
          keys::result_archive(result_id),
        ] {
          match fs::remove_file(self.key_to_path(&key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(key = %key, error = %e, "failed to delete result file"),
          }
        }
      })
      .await;
    Ok(())
  }

  async fn delete_reports(&self, report_ids: &[String]) -> Result<(), Error> {
    self
      .batch
      .run(report_ids, |report_id| async move {
        if let Err(e) = keys::validate_location(report_id) {
          warn!(report_id = %report_id, error = %e, "skipping report deletion");
          return;
        }
        match fs::remove_dir_all(self.report_dir(report_id)).await {
          Ok(()) => {}
          Err(e) if e.kind() == ErrorKind::NotFound => {}
          Err(e) => warn!(report_id = %report_id, error = %e, "failed to delete report"),
        }
      })
      .await;
    Ok(())
  }

  async fn read_config_file(&self) -> Result<SiteConfig, Error> {
    match fs::read(self.key_to_path(keys::CONFIG_FILE)).await {
      Ok(raw) => SiteConfig::from_slice(&raw).map_err(|e| Error::InvalidConfig(e.to_string())),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(SiteConfig::default()),
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

    fs::create_dir_all(&self.root).await?;
    write_json(&self.key_to_path(keys::CONFIG_FILE), &merged).await?;
    Ok(merged)
  }

  async fn server_data_info(&self) -> Result<ServerDataInfo, Error> {
    let results_dir = self.key_to_path(keys::RESULTS_DIR);
    let (results_count, results_size) = match list_dir(&results_dir).await {
      Ok(entries) => {
        let count = entries.iter().filter(|n| n.ends_with(".json")).count() as u64;
        (count, dir_size(&results_dir).await?)
      }
      Err(e) if e.kind() == ErrorKind::NotFound => (0, 0),
      Err(e) => return Err(e.into()),
    };

    let reports_dir = self.key_to_path(keys::REPORTS_DIR);
    let (reports_count, reports_size) = match list_dir(&reports_dir).await {
      Ok(entries) => (entries.len() as u64, dir_size(&reports_dir).await?),
      Err(e) if e.kind() == ErrorKind::NotFound => (0, 0),
      Err(e) => return Err(e.into()),
    };

    Ok(ServerDataInfo::new(
      results_count,
      results_size,
      reports_count,
      reports_size,
    ))
  }
}

fn not_found_or_io(e: std::io::Error, what: &str) -> Error {
  if e.kind() == ErrorKind::NotFound {
    Error::NotFound(what.to_string())
  } else {
    Error::Io(e)
  }
}

/// Names of the entries directly under `dir`.
async fn list_dir(dir: &Path) -> Result<Vec<String>, std::io::Error> {
  let mut names = Vec::new();
  let mut entries = fs::read_dir(dir).await?;
  while let Some(entry) = entries.next_entry().await? {
    if let Some(name) = entry.file_name().to_str() {
      names.push(name.to_string());
    }
  }
  Ok(names)
}

/// Total size of all files below `path`.
async fn dir_size(path: &Path) -> Result<u64, std::io::Error> {
  let mut total = 0;
  let mut entries = fs::read_dir(path).await?;
  while let Some(entry) = entries.next_entry().await? {
    let meta = entry.metadata().await?;
    if meta.is_dir() {
      total += Box::pin(dir_size(&entry.path())).await?;
    } else {
      total += meta.len();
    }
  }
  Ok(total)
}

async fn write_stream(path: &Path, data: ByteStream) -> Result<u64, Error> {
  let mut file = File::create(path).await?;
  let mut stream = data;
  let mut written = 0u64;

  while let Some(chunk) = stream.next().await {
    let bytes = chunk?;
    file.write_all(&bytes).await?;
    written += bytes.len() as u64;
  }

  file.flush().await?;
  file.sync_all().await?;
  Ok(written)
}

/// Write JSON next to its destination and rename it into place.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
  let encoded = serde_json::to_vec_pretty(value)?;
  let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
  fs::write(&tmp, encoded).await?;
  if let Err(e) = fs::rename(&tmp, path).await {
    let _ = fs::remove_file(&tmp).await;
    return Err(e.into());
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use tessera_config::GeneratorConfig;

  fn store(root: &Path) -> FsStore {
    FsStore::new(root, ReportGenerator::new(GeneratorConfig::default()))
  }

  fn stream_of(chunks: Vec<Result<Bytes, Error>>) -> ByteStream {
    Box::pin(futures::stream::iter(chunks))
  }

  #[tokio::test]
  async fn test_save_result_counts_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());

    let written = store
      .save_result(
        "r1.zip",
        stream_of(vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"defg"))]),
      )
      .await
      .unwrap();

    assert_eq!(written, 7);
    let on_disk = std::fs::read(dir.path().join("results/r1.zip")).unwrap();
    assert_eq!(on_disk, b"abcdefg");
  }

  #[tokio::test]
  async fn test_save_result_stream_error_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());

    let err = store
      .save_result(
        "r1.zip",
        stream_of(vec![
          Ok(Bytes::from_static(b"abc")),
          Err(Error::Io(std::io::Error::new(
            ErrorKind::ConnectionAborted,
            "client went away",
          ))),
        ]),
      )
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Io(_)));
    let leftovers = std::fs::read_dir(dir.path().join("results")).unwrap().count();
    assert_eq!(leftovers, 0);
  }

  #[tokio::test]
  async fn test_rejects_path_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());

    let err = store
      .save_result("../escape.zip", stream_of(vec![]))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(store.read_report("..", None).await.is_err());
  }

  #[tokio::test]
  async fn test_invalid_config_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    std::fs::write(dir.path().join("config.json"), b"{ nope").unwrap();

    let err = store.read_config_file().await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    let saved = store
      .save_config_file(serde_json::json!({ "title": "QA" }))
      .await
      .unwrap();
    assert_eq!(saved.title.as_deref(), Some("QA"));
    assert_eq!(store.read_config_file().await.unwrap(), saved);
  }

  #[tokio::test]
  async fn test_missing_config_is_default() {
    let dir = tempfile::tempdir().unwrap();
    let config = store(dir.path()).read_config_file().await.unwrap();
    assert_eq!(config, SiteConfig::default());
  }
}
