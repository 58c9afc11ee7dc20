//! Test and test-run history.
//!
//! This is the one part of the cache with no copy in the artifact store:
//! runs are appended as reports are generated and only the newest run of a
//! test ever has its quarantine flags changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_artifact::ParsedTest;
use tracing::info;

use crate::{Error, MetadataCache};

/// Identity of a logical test case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestKey {
  pub test_id: String,
  pub file_id: String,
  pub project: String,
}

impl TestKey {
  pub fn new(
    test_id: impl Into<String>,
    file_id: impl Into<String>,
    project: impl Into<String>,
  ) -> Self {
    Self {
      test_id: test_id.into(),
      file_id: file_id.into(),
      project: project.into(),
    }
  }
}

/// One execution of a test, as recorded from one report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
  #[sqlx(rename = "runId")]
  pub run_id: String,
  #[sqlx(rename = "testId")]
  pub test_id: String,
  #[sqlx(rename = "fileId")]
  pub file_id: String,
  pub project: String,
  #[sqlx(rename = "reportId")]
  pub report_id: String,
  pub outcome: String,
  /// Milliseconds.
  pub duration: i64,
  #[sqlx(rename = "createdAt")]
  pub created_at: DateTime<Utc>,
  #[sqlx(rename = "flakinessScore")]
  pub flakiness_score: Option<f64>,
  pub quarantined: bool,
  #[sqlx(rename = "quarantineReason")]
  pub quarantine_reason: Option<String>,
  #[sqlx(rename = "fixedAt")]
  pub fixed_at: Option<DateTime<Utc>>,
}

const RUN_COLUMNS: &str = "runId, testId, fileId, project, reportId, outcome, duration, createdAt, flakinessScore, quarantined, quarantineReason, fixedAt";

/// Selects the newest run of a test; binds testId, fileId, project.
const LATEST_RUN: &str = "SELECT runId FROM test_runs WHERE testId = ? AND fileId = ? AND project = ? ORDER BY createdAt DESC, rowid DESC LIMIT 1";

impl MetadataCache {
  /// Append one run per parsed test of a freshly generated report.
  ///
  /// Tests are keyed under `project`; unknown tests are created on the way.
  pub async fn record_test_runs(
    &self,
    report_id: &str,
    project: &str,
    tests: &[ParsedTest],
  ) -> Result<usize, Error> {
    let now = Utc::now();
    let mut tx = self.pool.begin().await?;

    for test in tests {
      sqlx::query(
        r#"
        INSERT INTO tests (testId, fileId, project, filePath, title, createdAt)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(testId, fileId, project) DO UPDATE SET
          filePath = excluded.filePath,
          title = excluded.title
        "#,
      )
      .bind(&test.test_id)
      .bind(&test.file_id)
      .bind(project)
      .bind(&test.file_path)
      .bind(&test.title)
      .bind(now)
      .execute(&mut *tx)
      .await?;

      sqlx::query(
        r#"
        INSERT INTO test_runs (runId, testId, fileId, project, reportId, outcome, duration, createdAt)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
      )
      .bind(uuid::Uuid::new_v4().to_string())
      .bind(&test.test_id)
      .bind(&test.file_id)
      .bind(project)
      .bind(report_id)
      .bind(&test.outcome)
      .bind(test.duration_ms)
      .bind(now)
      .execute(&mut *tx)
      .await?;
    }

    tx.commit().await?;
    Ok(tests.len())
  }

  /// Quarantine the newest run of a test.
  pub async fn set_quarantine(&self, key: &TestKey, reason: Option<&str>) -> Result<(), Error> {
    let sql = format!(
      "UPDATE test_runs SET quarantined = 1, quarantineReason = ? WHERE runId = ({})",
      LATEST_RUN
    );
    let affected = sqlx::query(&sql)
      .bind(reason)
      .bind(&key.test_id)
      .bind(&key.file_id)
      .bind(&key.project)
      .execute(&self.pool)
      .await?
      .rows_affected();
    require_run(affected, key)?;
    info!(test_id = %key.test_id, project = %key.project, "test quarantined");
    Ok(())
  }

  /// Lift the quarantine from the newest run of a test.
  pub async fn clear_quarantine(&self, key: &TestKey) -> Result<(), Error> {
    let sql = format!(
      "UPDATE test_runs SET quarantined = 0, quarantineReason = NULL WHERE runId = ({})",
      LATEST_RUN
    );
    let affected = sqlx::query(&sql)
      .bind(&key.test_id)
      .bind(&key.file_id)
      .bind(&key.project)
      .execute(&self.pool)
      .await?
      .rows_affected();
    require_run(affected, key)
  }

  /// Mark the newest run of a test as fixed. A fixed run is no longer
  /// quarantined.
  pub async fn mark_fixed(&self, key: &TestKey) -> Result<(), Error> {
    let sql = format!(
      "UPDATE test_runs SET fixedAt = ?, quarantined = 0 WHERE runId = ({})",
      LATEST_RUN
    );
    let affected = sqlx::query(&sql)
      .bind(Utc::now())
      .bind(&key.test_id)
      .bind(&key.file_id)
      .bind(&key.project)
      .execute(&self.pool)
      .await?
      .rows_affected();
    require_run(affected, key)
  }

  /// Runs of a test, newest first.
  pub async fn test_runs(&self, key: &TestKey, limit: Option<u32>) -> Result<Vec<TestRun>, Error> {
    let sql = format!(
      "SELECT {} FROM test_runs WHERE testId = ? AND fileId = ? AND project = ? ORDER BY createdAt DESC, rowid DESC LIMIT ?",
      RUN_COLUMNS
    );
    let runs = sqlx::query_as(&sql)
      .bind(&key.test_id)
      .bind(&key.file_id)
      .bind(&key.project)
      .bind(limit.map(i64::from).unwrap_or(-1))
      .fetch_all(&self.pool)
      .await?;
    Ok(runs)
  }

  /// Tests whose newest run is quarantined.
  pub async fn quarantined_tests(&self) -> Result<Vec<TestRun>, Error> {
    let sql = format!(
      r#"
      SELECT {} FROM test_runs AS r
      WHERE r.quarantined = 1
        AND r.rowid = (
          SELECT l.rowid FROM test_runs AS l
          WHERE l.testId = r.testId AND l.fileId = r.fileId AND l.project = r.project
          ORDER BY l.createdAt DESC, l.rowid DESC LIMIT 1
        )
      ORDER BY r.project, r.testId
      "#,
      RUN_COLUMNS
    );
    let runs = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
    Ok(runs)
  }
}

fn require_run(affected: u64, key: &TestKey) -> Result<(), Error> {
  if affected == 0 {
    return Err(Error::NotFound(format!(
      "no runs for test {} in {} ({})",
      key.test_id, key.file_id, key.project
    )));
  }
  Ok(())
}
