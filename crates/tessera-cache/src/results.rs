use chrono::Utc;
use sqlx::SqliteConnection;
use sqlx::types::Json;
use tessera_artifact::ResultRecord;
use tracing::debug;

use crate::query::{self, ListQuery, Page, RESULTS};
use crate::rows::{ResultRow, db_size};
use crate::{Error, MetadataCache};

impl MetadataCache {
  /// Record a result the store just saved.
  pub async fn on_result_created(&self, result: &ResultRecord) -> Result<(), Error> {
    let mut conn = self.pool.acquire().await?;
    upsert_result(&mut conn, result).await?;
    debug!(result_id = %result.result_id, "cached new result");
    Ok(())
  }

  pub async fn on_result_updated(&self, result: &ResultRecord) -> Result<(), Error> {
    self.on_result_created(result).await
  }

  /// Forget results the store just deleted.
  pub async fn on_results_deleted(&self, result_ids: &[String]) -> Result<u64, Error> {
    let mut tx = self.pool.begin().await?;
    let mut removed = 0;
    for result_id in result_ids {
      removed += sqlx::query("DELETE FROM results WHERE resultID = ?")
        .bind(result_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    }
    tx.commit().await?;
    Ok(removed)
  }

  pub async fn result(&self, result_id: &str) -> Result<Option<ResultRecord>, Error> {
    let query = ListQuery::default().ids(vec![result_id.to_string()]);
    let row: Option<ResultRow> = query::select(&RESULTS, &query)
      .build_query_as()
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.map(ResultRecord::from))
  }

  /// List results matching `query`. `total` ignores pagination.
  pub async fn results(&self, query: &ListQuery) -> Result<Page<ResultRecord>, Error> {
    let total: i64 = query::count(&RESULTS, query)
      .build_query_scalar()
      .fetch_one(&self.pool)
      .await?;
    let rows: Vec<ResultRow> = query::select(&RESULTS, query)
      .build_query_as()
      .fetch_all(&self.pool)
      .await?;

    Ok(Page {
      items: rows.into_iter().map(ResultRecord::from).collect(),
      total: total.max(0) as u64,
    })
  }
}

pub(crate) async fn upsert_result(
  conn: &mut SqliteConnection,
  result: &ResultRecord,
) -> Result<(), Error> {
  sqlx::query(
    r#"
    INSERT INTO results (resultID, project, title, createdAt, size, sizeBytes, metadata_json, updatedAt)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(resultID) DO UPDATE SET
      project = excluded.project,
      title = excluded.title,
      createdAt = excluded.createdAt,
      size = excluded.size,
      sizeBytes = excluded.sizeBytes,
      metadata_json = excluded.metadata_json,
      updatedAt = excluded.updatedAt
    "#,
  )
  .bind(&result.result_id)
  .bind(&result.project)
  .bind(&result.title)
  .bind(result.created_at)
  .bind(&result.size)
  .bind(db_size(result.size_bytes))
  .bind(Json(&result.metadata))
  .bind(Utc::now())
  .execute(&mut *conn)
  .await?;
  Ok(())
}
