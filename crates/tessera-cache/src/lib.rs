//! Tessera Cache
//!
//! A SQLite mirror of the artifact store's metadata. Listings, searches and
//! pagination are answered from here so no request walks the backend.
//!
//! The cache is derived state:
//! - it is filled once from [`ArtifactStore`] listings ([`MetadataCache::ensure_hydrated`]),
//! - then kept current through the `on_*` hooks, which the service calls
//!   only after the store has confirmed the write,
//! - and it can be dropped and rebuilt at any time with [`MetadataCache::refresh`].
//!
//! Test history (the `tests` and `test_runs` tables) is the exception: it
//! only ever lives here. `refresh` keeps it; [`MetadataCache::reset`] does not.

mod history;
mod hydrate;
mod kv;
mod query;
mod reports;
mod results;
mod rows;

pub use history::{TestKey, TestRun};
pub use hydrate::HydrationSummary;
pub use query::{ListQuery, Page, Pagination};

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tessera_artifact::{ArtifactStore, ServerDataInfo};
use tracing::{info, instrument, warn};

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The row (or test) the caller asked about does not exist.
  #[error("not found: {0}")]
  NotFound(String),

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// The artifact store failed while hydrating.
  #[error("store error: {0}")]
  Store(#[from] tessera_artifact::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  pub fn is_not_found(&self) -> bool {
    match self {
      Self::NotFound(_) => true,
      Self::Database(sqlx::Error::RowNotFound) => true,
      Self::Store(err) => err.is_not_found(),
      _ => false,
    }
  }
}

/// Row counts and byte sums over the cached results and reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  pub results_count: u64,
  pub results_size_bytes: u64,
  pub reports_count: u64,
  pub reports_size_bytes: u64,
}

impl From<CacheStats> for ServerDataInfo {
  fn from(stats: CacheStats) -> Self {
    ServerDataInfo::new(
      stats.results_count,
      stats.results_size_bytes,
      stats.reports_count,
      stats.reports_size_bytes,
    )
  }
}

/// Distinct project names seen on results and reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Projects {
  pub results: Vec<String>,
  pub reports: Vec<String>,
}

/// The metadata cache. Open it once per process and share it.
#[derive(Debug, Clone)]
pub struct MetadataCache {
  pub(crate) pool: SqlitePool,
}

impl MetadataCache {
  /// Wrap an existing pool. Call [`MetadataCache::migrate`] before use.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (or create) the cache database at `path` and migrate it.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .foreign_keys(true)
      .auto_vacuum(SqliteAutoVacuum::Incremental)
      .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;

    let cache = Self::new(pool);
    cache.migrate().await?;
    info!(path = %path.display(), "metadata cache opened");
    Ok(cache)
  }

  /// A private in-memory cache, mostly for tests.
  pub async fn in_memory() -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    // Every connection to :memory: is a separate database.
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect_with(options)
      .await?;

    let cache = Self::new(pool);
    cache.migrate().await?;
    Ok(cache)
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }

  pub async fn is_hydrated(&self) -> Result<bool, Error> {
    Ok(self.kv_get(kv::HYDRATED_AT).await?.is_some())
  }

  /// Hydrate from `store` unless that already happened.
  pub async fn ensure_hydrated(
    &self,
    store: &dyn ArtifactStore,
  ) -> Result<Option<HydrationSummary>, Error> {
    if self.is_hydrated().await? {
      return Ok(None);
    }
    self.hydrate(store).await.map(Some)
  }

  /// Drop cached results and reports and load them again from `store`.
  /// Test history is kept.
  #[instrument(skip_all)]
  pub async fn refresh(&self, store: &dyn ArtifactStore) -> Result<HydrationSummary, Error> {
    info!("refreshing metadata cache");
    self.hydrate(store).await
  }

  /// Like [`MetadataCache::refresh`], but also wipes test history, which
  /// cannot be recovered from the store.
  #[instrument(skip_all)]
  pub async fn reset(&self, store: &dyn ArtifactStore) -> Result<HydrationSummary, Error> {
    let mut tx = self.pool.begin().await?;
    let runs = sqlx::query("DELETE FROM test_runs")
      .execute(&mut *tx)
      .await?
      .rows_affected();
    sqlx::query("DELETE FROM tests").execute(&mut *tx).await?;
    kv::delete(&mut tx, kv::HYDRATED_AT).await?;
    tx.commit().await?;
    warn!(discarded_runs = runs, "test history discarded by cache reset");

    self.hydrate(store).await
  }

  pub async fn stats(&self) -> Result<CacheStats, Error> {
    let (results_count, results_size): (i64, i64) =
      sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(sizeBytes), 0) FROM results")
        .fetch_one(&self.pool)
        .await?;
    let (reports_count, reports_size): (i64, i64) =
      sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(sizeBytes), 0) FROM reports")
        .fetch_one(&self.pool)
        .await?;

    Ok(CacheStats {
      results_count: unsigned(results_count),
      results_size_bytes: unsigned(results_size),
      reports_count: unsigned(reports_count),
      reports_size_bytes: unsigned(reports_size),
    })
  }

  pub async fn projects(&self) -> Result<Projects, Error> {
    let results = sqlx::query_scalar(
      "SELECT DISTINCT project FROM results WHERE project <> '' ORDER BY project",
    )
    .fetch_all(&self.pool)
    .await?;
    let reports = sqlx::query_scalar(
      "SELECT DISTINCT project FROM reports WHERE project <> '' ORDER BY project",
    )
    .fetch_all(&self.pool)
    .await?;
    Ok(Projects { results, reports })
  }
}

fn unsigned(value: i64) -> u64 {
  u64::try_from(value).unwrap_or_default()
}
