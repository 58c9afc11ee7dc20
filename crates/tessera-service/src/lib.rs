//! Tessera Service
//!
//! The single entry point for every use case. A [`Service`] owns one
//! artifact store, one metadata cache and one upload pipeline, built once at
//! process start and passed around by reference.
//!
//! Every write goes to the store first. The cache hook only runs once the
//! store has confirmed, so the cache never knows about something the store
//! does not hold. Reads are served from the cache, which is hydrated on first
//! use.

mod backend;
mod error;

pub use backend::build_store;
pub use error::ServiceError;

use std::sync::Arc;

use serde_json::{Map, Value};
use tessera_artifact::{
  ArtifactStore, ByteStream, Report, ReportRequest, ResultDetails, ResultRecord, ServerDataInfo,
};
use tessera_cache::{
  HydrationSummary, ListQuery, MetadataCache, Page, Projects, TestKey, TestRun,
};
use tessera_config::{ServerConfig, SiteConfig, merge_json};
use tessera_upload::{UploadPipeline, UploadReceipt};
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, instrument, warn};

/// Report fields a caller may not overwrite.
const FROZEN_REPORT_FIELDS: [&str; 5] = ["reportID", "displayNumber", "createdAt", "reportUrl", "stats"];

/// A stored result and how its archive got there.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedResult {
  pub record: ResultRecord,
  pub receipt: UploadReceipt,
}

pub struct Service {
  store: Arc<dyn ArtifactStore>,
  cache: MetadataCache,
  uploads: UploadPipeline,
  /// Set once the cache has been checked (and filled if needed) by this
  /// process.
  hydrated: OnceCell<()>,
  /// Serializes display number reservations.
  numbering: Mutex<()>,
}

impl Service {
  pub fn new(store: Arc<dyn ArtifactStore>, cache: MetadataCache, uploads: UploadPipeline) -> Self {
    Self {
      store,
      cache,
      uploads,
      hydrated: OnceCell::new(),
      numbering: Mutex::new(()),
    }
  }

  /// Build the store, open the cache and wire up the upload pipeline.
  pub async fn from_config(config: &ServerConfig) -> Result<Self, ServiceError> {
    config.validate()?;
    let store = build_store(config)?;
    let cache = MetadataCache::open(config.cache_path()).await?;
    let uploads = UploadPipeline::new(store.clone(), &config.upload);
    Ok(Self::new(store, cache, uploads))
  }

  pub fn store(&self) -> &Arc<dyn ArtifactStore> {
    &self.store
  }

  pub fn cache(&self) -> &MetadataCache {
    &self.cache
  }

  /// Hydrate the cache if this is its first use. Concurrent first callers
  /// wait for a single hydration.
  pub async fn init(&self) -> Result<(), ServiceError> {
    self
      .hydrated
      .get_or_try_init(|| async {
        if let Some(summary) = self.cache.ensure_hydrated(self.store.as_ref()).await? {
          info!(
            results = summary.results,
            reports = summary.reports,
            "metadata cache initialized"
          );
        }
        Ok::<_, ServiceError>(())
      })
      .await?;
    Ok(())
  }

  // Results

  /// Store an uploaded archive and its sidecar, then cache the record.
  ///
  /// A fresh ID is minted when `result_id` is `None`.
  #[instrument(skip(self, data, details))]
  pub async fn upload_result(
    &self,
    result_id: Option<String>,
    data: ByteStream,
    declared_length: Option<u64>,
    details: ResultDetails,
  ) -> Result<UploadedResult, ServiceError> {
    self.init().await?;
    let result_id = result_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let receipt = self.uploads.upload(&result_id, data, declared_length).await?;

    let record = match self
      .store
      .save_result_details(&result_id, details, receipt.size_bytes)
      .await
    {
      Ok(record) => record,
      Err(e) => {
        // An archive without a sidecar is invisible; do not leave it behind.
        if let Err(cleanup) = self.store.delete_results(&[result_id.clone()]).await {
          warn!(result_id = %result_id, error = %cleanup, "failed to remove orphaned archive");
        }
        return Err(e.into());
      }
    };

    self.cache.on_result_created(&record).await?;
    Ok(UploadedResult { record, receipt })
  }

  pub async fn results(&self, query: &ListQuery) -> Result<Page<ResultRecord>, ServiceError> {
    self.init().await?;
    Ok(self.cache.results(query).await?)
  }

  pub async fn result(&self, result_id: &str) -> Result<ResultRecord, ServiceError> {
    self.init().await?;
    self
      .cache
      .result(result_id)
      .await?
      .ok_or_else(|| ServiceError::NotFound(format!("result {}", result_id)))
  }

  /// Delete results from the store, then from the cache.
  #[instrument(skip(self))]
  pub async fn delete_results(&self, result_ids: &[String]) -> Result<u64, ServiceError> {
    self.store.delete_results(result_ids).await?;
    Ok(self.cache.on_results_deleted(result_ids).await?)
  }

  // Reports

  /// Merge results into a new report with the next display number.
  #[instrument(skip(self, request), fields(results = result_ids.len()))]
  pub async fn generate_report(
    &self,
    result_ids: &[String],
    mut request: ReportRequest,
  ) -> Result<Report, ServiceError> {
    if result_ids.is_empty() {
      return Err(ServiceError::InvalidInput(
        "at least one result is required".to_string(),
      ));
    }
    self.init().await?;

    request.display_number = Some({
      let _numbering = self.numbering.lock().await;
      self.cache.reserve_display_number().await?
    });

    let generated = self.store.generate_report(result_ids, request).await?;
    self.cache.on_report_created(&generated.report).await?;

    let report = generated.report;
    if !generated.tests.is_empty()
      && let Err(e) = self
        .cache
        .record_test_runs(&report.report_id, &report.project, &generated.tests)
        .await
    {
      warn!(report_id = %report.report_id, error = %e, "failed to record test runs");
    }

    info!(
      report_id = %report.report_id,
      display_number = ?report.display_number,
      "report created"
    );
    Ok(report)
  }

  pub async fn reports(&self, query: &ListQuery) -> Result<Page<Report>, ServiceError> {
    self.init().await?;
    Ok(self.cache.reports(query).await?)
  }

  pub async fn report(&self, report_id: &str) -> Result<Report, ServiceError> {
    self.init().await?;
    self
      .cache
      .report(report_id)
      .await?
      .ok_or_else(|| ServiceError::NotFound(format!("report {}", report_id)))
  }

  /// Merge `patch` into a report's metadata and write it back.
  ///
  /// `null` values remove fields. Identity fields, the display number and the
  /// stats cannot be changed.
  #[instrument(skip(self, patch))]
  pub async fn update_report(&self, report_id: &str, patch: Value) -> Result<Report, ServiceError> {
    let Value::Object(mut patch) = patch else {
      return Err(ServiceError::InvalidInput(
        "report update must be a JSON object".to_string(),
      ));
    };
    for field in FROZEN_REPORT_FIELDS {
      patch.remove(field);
    }

    let current = self.store.read_report(report_id, None).await?;
    let mut merged = serde_json::to_value(&current)?;
    merge_json(&mut merged, Value::Object(patch));
    let updated: Report = serde_json::from_value(merged)?;

    self.store.update_report_metadata(&updated).await?;
    self.cache.on_report_updated(&updated).await?;
    Ok(updated)
  }

  /// Delete reports from the store, then from the cache.
  ///
  /// Reports already missing from the store still leave the cache.
  #[instrument(skip(self))]
  pub async fn delete_reports(&self, report_ids: &[String]) -> Result<u64, ServiceError> {
    self.store.delete_reports(report_ids).await?;
    Ok(self.cache.on_reports_deleted(report_ids).await?)
  }

  // Cache

  /// Rebuild cached results and reports from the store. Test history stays.
  pub async fn refresh_cache(&self) -> Result<HydrationSummary, ServiceError> {
    Ok(self.cache.refresh(self.store.as_ref()).await?)
  }

  /// Rebuild the cache and discard test history.
  pub async fn reset_cache(&self) -> Result<HydrationSummary, ServiceError> {
    Ok(self.cache.reset(self.store.as_ref()).await?)
  }

  /// Dashboard totals: from the cache when it is warm, otherwise by walking
  /// the store.
  pub async fn server_info(&self) -> Result<ServerDataInfo, ServiceError> {
    if self.cache.is_hydrated().await? {
      return Ok(self.cache.stats().await?.into());
    }
    Ok(self.store.server_data_info().await?)
  }

  pub async fn projects(&self) -> Result<Projects, ServiceError> {
    self.init().await?;
    Ok(self.cache.projects().await?)
  }

  // Site configuration

  /// The stored site configuration. A blob that no longer parses is logged
  /// and replaced by the defaults so the UI keeps working.
  pub async fn site_config(&self) -> Result<SiteConfig, ServiceError> {
    match self.store.read_config_file().await {
      Ok(config) => Ok(config),
      Err(tessera_artifact::Error::InvalidConfig(reason)) => {
        warn!(reason = %reason, "stored site config is invalid, using defaults");
        Ok(SiteConfig::default())
      }
      Err(e) => Err(e.into()),
    }
  }

  pub async fn update_site_config(&self, partial: Value) -> Result<SiteConfig, ServiceError> {
    if !partial.is_object() {
      return Err(ServiceError::InvalidInput(
        "config update must be a JSON object".to_string(),
      ));
    }
    Ok(self.store.save_config_file(partial).await?)
  }

  // Test history

  pub async fn quarantine_test(&self, key: &TestKey, reason: Option<&str>) -> Result<(), ServiceError> {
    Ok(self.cache.set_quarantine(key, reason).await?)
  }

  pub async fn unquarantine_test(&self, key: &TestKey) -> Result<(), ServiceError> {
    Ok(self.cache.clear_quarantine(key).await?)
  }

  pub async fn mark_test_fixed(&self, key: &TestKey) -> Result<(), ServiceError> {
    Ok(self.cache.mark_fixed(key).await?)
  }

  pub async fn test_history(&self, key: &TestKey, limit: Option<u32>) -> Result<Vec<TestRun>, ServiceError> {
    Ok(self.cache.test_runs(key, limit).await?)
  }

  pub async fn quarantined_tests(&self) -> Result<Vec<TestRun>, ServiceError> {
    Ok(self.cache.quarantined_tests().await?)
  }
}

/// Turn a JSON object into uploader details.
pub fn details_from_value(value: Value) -> Result<ResultDetails, ServiceError> {
  match value {
    Value::Object(map) => Ok(map),
    Value::Null => Ok(Map::new()),
    _ => Err(ServiceError::InvalidInput(
      "result details must be a JSON object".to_string(),
    )),
  }
}
