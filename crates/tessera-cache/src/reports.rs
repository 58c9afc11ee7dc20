use chrono::Utc;
use sqlx::SqliteConnection;
use sqlx::types::Json;
use tessera_artifact::Report;
use tracing::debug;

use crate::kv::{self, DISPLAY_NUMBER_HIGH_WATER};
use crate::query::{self, ListQuery, Page, REPORTS};
use crate::rows::{ReportRow, db_size};
use crate::{Error, MetadataCache};

impl MetadataCache {
  /// Record a report the store just created.
  pub async fn on_report_created(&self, report: &Report) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;
    upsert_report(&mut tx, report).await?;
    tx.commit().await?;
    debug!(report_id = %report.report_id, "cached new report");
    Ok(())
  }

  /// Record a report the store just rewrote.
  pub async fn on_report_updated(&self, report: &Report) -> Result<(), Error> {
    self.on_report_created(report).await
  }

  /// Forget reports the store just deleted.
  pub async fn on_reports_deleted(&self, report_ids: &[String]) -> Result<u64, Error> {
    let mut tx = self.pool.begin().await?;
    let mut removed = 0;
    for report_id in report_ids {
      removed += sqlx::query("DELETE FROM reports WHERE reportID = ?")
        .bind(report_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    tx.commit().await?;
    Ok(removed)
  }

  pub async fn report(&self, report_id: &str) -> Result<Option<Report>, Error> {
    let query = ListQuery::default().ids(vec![report_id.to_string()]);
    let row: Option<ReportRow> = query::select(&REPORTS, &query)
      .build_query_as()
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(Report::from))
  }

  /// List reports matching `query`. `total` ignores pagination.
  pub async fn reports(&self, query: &ListQuery) -> Result<Page<Report>, Error> {
    let total: i64 = query::count(&REPORTS, query)
      .build_query_scalar()
      .fetch_one(&self.pool)
      .await?;
    let rows: Vec<ReportRow> = query::select(&REPORTS, query)
      .build_query_as()
      .fetch_all(&self.pool)
      .await?;

    Ok(Page {
      items: rows.into_iter().map(Report::from).collect(),
      total: total.max(0) as u64,
    })
  }

  /// The number a report created now should get: one past the highest number
  /// ever handed out, so numbers of deleted reports are not reused.
  pub async fn next_display_number(&self) -> Result<i64, Error> {
    let mut conn = self.pool.acquire().await?;
    next_display_number(&mut conn).await
  }

  /// Take the next display number and mark it used at once, so it is never
  /// handed out twice even while its report is still being generated. A
  /// report that then fails to generate leaves a gap.
  pub async fn reserve_display_number(&self) -> Result<i64, Error> {
    let mut tx = self.pool.begin().await?;
    let number = next_display_number(&mut tx).await?;
    kv::raise_i64(&mut tx, DISPLAY_NUMBER_HIGH_WATER, number).await?;
    tx.commit().await?;
    Ok(number)
  }
}

pub(crate) async fn next_display_number(conn: &mut SqliteConnection) -> Result<i64, Error> {
  let current: Option<i64> = sqlx::query_scalar("SELECT MAX(displayNumber) FROM reports")
    .fetch_one(&mut *conn)
    .await?;
  let high_water = kv::get_i64(conn, DISPLAY_NUMBER_HIGH_WATER)
    .await?
    .unwrap_or_default();
  Ok(current.unwrap_or_default().max(high_water) + 1)
}

/// Insert or refresh a report row. An already assigned display number wins
/// over whatever the incoming copy says.
pub(crate) async fn upsert_report(conn: &mut SqliteConnection, report: &Report) -> Result<(), Error> {
  sqlx::query(
    r#"
    INSERT INTO reports (reportID, project, title, displayNumber, createdAt, reportUrl, size, sizeBytes, stats_json, metadata_json, updatedAt)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(reportID) DO UPDATE SET
      project = excluded.project,
      title = excluded.title,
      displayNumber = COALESCE(reports.displayNumber, excluded.displayNumber),
      createdAt = excluded.createdAt,
      reportUrl = excluded.reportUrl,
      size = excluded.size,
      sizeBytes = excluded.sizeBytes,
      stats_json = excluded.stats_json,
      metadata_json = excluded.metadata_json,
      updatedAt = excluded.updatedAt
    "#,
  )
  .bind(&report.report_id)
  .bind(&report.project)
  .bind(&report.title)
  .bind(report.display_number)
  .bind(report.created_at)
  .bind(&report.report_url)
  .bind(&report.size)
  .bind(db_size(report.size_bytes))
  .bind(Json(&report.stats))
  .bind(Json(&report.metadata))
  .bind(Utc::now())
  .execute(&mut *conn)
  .await?;

  if let Some(number) = report.display_number {
    kv::raise_i64(conn, DISPLAY_NUMBER_HIGH_WATER, number).await?;
  }
  Ok(())
}
