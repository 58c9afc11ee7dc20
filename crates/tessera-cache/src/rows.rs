//! Row shapes of the cache tables and their conversion to domain types.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use tessera_artifact::{Report, ReportStats, ResultRecord};

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ResultRow {
  #[sqlx(rename = "resultID")]
  pub result_id: String,
  pub project: String,
  pub title: Option<String>,
  #[sqlx(rename = "createdAt")]
  pub created_at: DateTime<Utc>,
  pub size: String,
  #[sqlx(rename = "sizeBytes")]
  pub size_bytes: i64,
  pub metadata_json: Json<Map<String, Value>>,
}

impl From<ResultRow> for ResultRecord {
  fn from(row: ResultRow) -> Self {
    ResultRecord {
      result_id: row.result_id,
      project: row.project,
      title: row.title,
      created_at: row.created_at,
      size: row.size,
      size_bytes: u64::try_from(row.size_bytes).unwrap_or_default(),
      metadata: row.metadata_json.0,
    }
  }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ReportRow {
  #[sqlx(rename = "reportID")]
  pub report_id: String,
  pub project: String,
  pub title: Option<String>,
  #[sqlx(rename = "displayNumber")]
  pub display_number: Option<i64>,
  #[sqlx(rename = "createdAt")]
  pub created_at: DateTime<Utc>,
  #[sqlx(rename = "reportUrl")]
  pub report_url: String,
  pub size: String,
  #[sqlx(rename = "sizeBytes")]
  pub size_bytes: i64,
  pub stats_json: Json<ReportStats>,
  pub metadata_json: Json<Map<String, Value>>,
}

impl From<ReportRow> for Report {
  fn from(row: ReportRow) -> Self {
    Report {
      report_id: row.report_id,
      project: row.project,
      title: row.title,
      display_number: row.display_number,
      created_at: row.created_at,
      report_url: row.report_url,
      size: row.size,
      size_bytes: u64::try_from(row.size_bytes).unwrap_or_default(),
      stats: row.stats_json.0,
      metadata: row.metadata_json.0,
    }
  }
}

/// Clamp a byte count into SQLite's signed integer range.
pub(crate) fn db_size(size_bytes: u64) -> i64 {
  i64::try_from(size_bytes).unwrap_or(i64::MAX)
}
