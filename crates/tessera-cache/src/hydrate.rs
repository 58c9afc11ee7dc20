//! Filling the cache from the artifact store.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::Serialize;
use tessera_artifact::{ArtifactStore, Report};
use tracing::{info, instrument, warn};

use crate::kv::{self, DISPLAY_NUMBER_HIGH_WATER, HYDRATED_AT};
use crate::reports::upsert_report;
use crate::results::upsert_result;
use crate::{Error, MetadataCache};

/// What a hydration pass loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HydrationSummary {
  pub results: usize,
  pub reports: usize,
  /// Reports that were given a display number during this pass.
  pub numbered: Vec<String>,
}

impl MetadataCache {
  /// Replace cached results and reports with the store's current listing.
  ///
  /// Everything lands in one transaction, so readers see either the old or
  /// the new inventory. Reports without a display number get one and the
  /// number is written back to the store.
  #[instrument(skip_all)]
  pub async fn hydrate(&self, store: &dyn ArtifactStore) -> Result<HydrationSummary, Error> {
    let results = store.read_results().await?.items;
    let mut reports = store.read_reports().await?.items;
    let handed_out = {
      let mut conn = self.pool.acquire().await?;
      kv::get_i64(&mut conn, DISPLAY_NUMBER_HIGH_WATER)
        .await?
        .unwrap_or_default()
    };
    let numbered = assign_display_numbers(&mut reports, handed_out);

    let mut tx = self.pool.begin().await?;
    sqlx::query("DELETE FROM results").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM reports").execute(&mut *tx).await?;
    for result in &results {
      upsert_result(&mut tx, result).await?;
    }
    for report in &reports {
      upsert_report(&mut tx, report).await?;
    }
    kv::set(&mut tx, HYDRATED_AT, &Utc::now().to_rfc3339()).await?;
    tx.commit().await?;

    let mut summary = HydrationSummary {
      results: results.len(),
      reports: reports.len(),
      numbered: Vec::with_capacity(numbered.len()),
    };

    for index in numbered {
      let report = &reports[index];
      // The cache already holds the number; a failed write-back is retried
      // on the next hydration.
      if let Err(err) = store.update_report_metadata(report).await {
        warn!(report_id = %report.report_id, error = %err, "failed to persist display number");
        continue;
      }
      summary.numbered.push(report.report_id.clone());
    }

    info!(
      results = summary.results,
      reports = summary.reports,
      numbered = summary.numbered.len(),
      "metadata cache hydrated"
    );
    Ok(summary)
  }
}

/// Give every report without a usable display number the lowest unused one,
/// oldest report first.
///
/// Numbers must be positive and unique; when two reports claim the same
/// number the older one keeps it. Gaps below the highest number present are
/// filled; past it, numbering resumes above `handed_out` so numbers reserved
/// by a report still being generated are not given away. Returns the indices
/// of reports whose number changed.
pub(crate) fn assign_display_numbers(reports: &mut [Report], handed_out: i64) -> Vec<usize> {
  let mut order: Vec<usize> = (0..reports.len()).collect();
  order.sort_by(|&a, &b| {
    reports[a]
      .created_at
      .cmp(&reports[b].created_at)
      .then_with(|| reports[a].report_id.cmp(&reports[b].report_id))
  });

  let mut taken = BTreeSet::new();
  let mut pending = Vec::new();
  for &index in &order {
    match reports[index].display_number {
      Some(number) if number > 0 && taken.insert(number) => {}
      _ => pending.push(index),
    }
  }

  let ceiling = taken.last().copied().unwrap_or_default();
  let mut next = 1;
  for &index in &pending {
    while taken.contains(&next) {
      next += 1;
    }
    if next > ceiling {
      next = next.max(handed_out + 1);
    }
    taken.insert(next);
    reports[index].display_number = Some(next);
  }
  pending
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, TimeZone};
  use tessera_artifact::ReportStats;

  fn report(id: &str, minute: i64, number: Option<i64>) -> Report {
    let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute);
    let mut report = Report::synthesized(id, "web".into(), ReportStats::default(), created, String::new());
    report.display_number = number;
    report
  }

  fn numbers(reports: &[Report]) -> Vec<(String, Option<i64>)> {
    reports
      .iter()
      .map(|r| (r.report_id.clone(), r.display_number))
      .collect()
  }

  #[test]
  fn test_numbers_follow_creation_order() {
    let mut reports = vec![
      report("c", 3, None),
      report("a", 1, None),
      report("b", 2, None),
    ];
    let changed = assign_display_numbers(&mut reports, 0);
    assert_eq!(changed.len(), 3);
    assert_eq!(
      numbers(&reports),
      vec![
        ("c".into(), Some(3)),
        ("a".into(), Some(1)),
        ("b".into(), Some(2)),
      ]
    );
  }

  #[test]
  fn test_gaps_are_filled_before_extending() {
    let mut reports = vec![
      report("a", 1, Some(2)),
      report("b", 2, Some(5)),
      report("c", 3, None),
      report("d", 4, None),
      report("e", 5, None),
      report("f", 6, None),
    ];
    assign_display_numbers(&mut reports, 0);
    let assigned: Vec<_> = reports.iter().map(|r| r.display_number).collect();
    assert_eq!(
      assigned,
      vec![Some(2), Some(5), Some(1), Some(3), Some(4), Some(6)]
    );
  }

  #[test]
  fn test_duplicate_numbers_are_reassigned() {
    let mut reports = vec![
      report("late", 9, Some(1)),
      report("early", 1, Some(1)),
      report("bogus", 5, Some(0)),
    ];
    let changed = assign_display_numbers(&mut reports, 0);
    assert_eq!(changed, vec![2, 0]);
    assert_eq!(reports[1].display_number, Some(1));
    assert_eq!(reports[2].display_number, Some(2));
    assert_eq!(reports[0].display_number, Some(3));
  }

  #[test]
  fn test_numbered_reports_are_untouched() {
    let mut reports = vec![report("a", 1, Some(1)), report("b", 2, Some(2))];
    assert!(assign_display_numbers(&mut reports, 0).is_empty());
  }

  #[test]
  fn test_numbers_already_handed_out_are_skipped() {
    let mut reports = vec![
      report("a", 1, Some(1)),
      report("b", 2, Some(3)),
      report("c", 3, None),
      report("d", 4, None),
    ];
    // 4 and 5 were reserved for reports that are not listed yet.
    assign_display_numbers(&mut reports, 5);
    assert_eq!(reports[2].display_number, Some(2));
    assert_eq!(reports[3].display_number, Some(6));
  }
}
