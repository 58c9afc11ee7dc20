use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::size::format_bytes;

/// Free-form fields supplied by the uploader (`project`, `title`, tags).
pub type ResultDetails = Map<String, Value>;

/// One uploaded test-run artifact, as recorded in its JSON sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
  #[serde(rename = "resultID")]
  pub result_id: String,
  #[serde(default)]
  pub project: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub size: String,
  #[serde(default)]
  pub size_bytes: u64,
  /// Uploader tags, flattened into the sidecar.
  #[serde(flatten)]
  pub metadata: Map<String, Value>,
}

impl ResultRecord {
  /// Build a record from uploader-supplied details. `project` and `title`
  /// are lifted out of the map; everything else stays as tags.
  pub fn from_details(result_id: &str, mut details: ResultDetails, size_bytes: u64) -> Self {
    let project = take_string(&mut details, "project").unwrap_or_default();
    let title = take_string(&mut details, "title");
    for reserved in ["resultID", "createdAt", "size", "sizeBytes"] {
      details.remove(reserved);
    }

    Self {
      result_id: result_id.to_string(),
      project,
      title,
      created_at: Utc::now(),
      size: format_bytes(size_bytes),
      size_bytes,
      metadata: details,
    }
  }
}

/// Summary counts for a generated report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportStats {
  pub total: u64,
  pub expected: u64,
  pub unexpected: u64,
  pub flaky: u64,
  pub skipped: u64,
}

/// Sidecar keys owned by [`Report`]; caller metadata may not shadow them.
const REPORT_FIELDS: [&str; 9] = [
  "reportID",
  "project",
  "title",
  "displayNumber",
  "createdAt",
  "reportUrl",
  "size",
  "sizeBytes",
  "stats",
];

/// A generated, browsable report built from one or more results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
  #[serde(rename = "reportID")]
  pub report_id: String,
  #[serde(default)]
  pub project: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  /// Stable sequential number; assigned once and never changed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub display_number: Option<i64>,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub report_url: String,
  #[serde(default)]
  pub size: String,
  #[serde(default)]
  pub size_bytes: u64,
  #[serde(default)]
  pub stats: ReportStats,
  #[serde(flatten)]
  pub metadata: Map<String, Value>,
}

impl Report {
  /// A fresh report for a generation request.
  pub fn generated(
    report_id: &str,
    request: ReportRequest,
    stats: ReportStats,
    report_url: String,
  ) -> Self {
    let mut metadata = request.metadata;
    for field in REPORT_FIELDS {
      metadata.remove(field);
    }

    Self {
      report_id: report_id.to_string(),
      project: request.project,
      title: request.title,
      display_number: request.display_number,
      created_at: Utc::now(),
      report_url,
      size: String::new(),
      size_bytes: 0,
      stats,
      metadata,
    }
  }

  /// A report reconstructed from its generated files alone.
  pub fn synthesized(
    report_id: &str,
    project: String,
    stats: ReportStats,
    created_at: DateTime<Utc>,
    report_url: String,
  ) -> Self {
    Self {
      report_id: report_id.to_string(),
      project,
      title: None,
      display_number: None,
      created_at,
      report_url,
      size: String::new(),
      size_bytes: 0,
      stats,
      metadata: Map::new(),
    }
  }

  pub(crate) fn set_size(&mut self, size_bytes: u64) {
    self.size_bytes = size_bytes;
    self.size = format_bytes(size_bytes);
  }
}

/// What the caller wants recorded on a new report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
  #[serde(default)]
  pub project: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub display_number: Option<i64>,
  #[serde(flatten)]
  pub metadata: Map<String, Value>,
}

/// A single test case as found in a generated report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTest {
  pub test_id: String,
  pub file_id: String,
  pub file_path: String,
  pub title: String,
  /// Project name configured in the test runner (e.g. "chromium").
  #[serde(default)]
  pub project_name: String,
  pub outcome: String,
  pub duration_ms: i64,
}

/// Outcome of [`ArtifactStore::generate_report`](crate::ArtifactStore::generate_report).
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedReport {
  pub report_id: String,
  /// Directory (filesystem) or key prefix (bucket) holding the report.
  pub report_path: String,
  pub report: Report,
  pub tests: Vec<ParsedTest>,
}

/// A full listing and its size.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<T> {
  pub items: Vec<T>,
  pub total: usize,
}

impl<T> Listing<T> {
  pub fn new(items: Vec<T>) -> Self {
    let total = items.len();
    Self { items, total }
  }
}

/// Aggregate sizes and counts shown on the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDataInfo {
  pub results_count: u64,
  pub results_size_bytes: u64,
  pub reports_count: u64,
  pub reports_size_bytes: u64,
  pub total_size_bytes: u64,
  pub total_size: String,
}

impl ServerDataInfo {
  pub fn new(
    results_count: u64,
    results_size_bytes: u64,
    reports_count: u64,
    reports_size_bytes: u64,
  ) -> Self {
    let total_size_bytes = results_size_bytes + reports_size_bytes;
    Self {
      results_count,
      results_size_bytes,
      reports_count,
      reports_size_bytes,
      total_size_bytes,
      total_size: format_bytes(total_size_bytes),
    }
  }
}

fn take_string(details: &mut ResultDetails, key: &str) -> Option<String> {
  match details.remove(key)? {
    Value::String(s) => Some(s),
    Value::Null => None,
    other => Some(other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_result_sidecar_keeps_tags() {
    let details = json!({
      "project": "web",
      "title": "nightly",
      "branch": "main",
      "shard": 3
    });
    let Value::Object(details) = details else {
      unreachable!()
    };

    let record = ResultRecord::from_details("r-1", details, 2048);
    let encoded = serde_json::to_value(&record).unwrap();

    assert_eq!(encoded["resultID"], "r-1");
    assert_eq!(encoded["project"], "web");
    assert_eq!(encoded["branch"], "main");
    assert_eq!(encoded["shard"], 3);
    assert_eq!(encoded["sizeBytes"], 2048);
    assert_eq!(encoded["size"], "2.00 KB");

    let decoded: ResultRecord = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, record);
  }

  #[test]
  fn test_reserved_keys_are_not_tags() {
    let Value::Object(details) = json!({ "sizeBytes": 1, "resultID": "spoofed" }) else {
      unreachable!()
    };
    let record = ResultRecord::from_details("r-2", details, 10);
    assert!(record.metadata.is_empty());
    assert_eq!(record.result_id, "r-2");
    assert_eq!(record.size_bytes, 10);
  }

  #[test]
  fn test_generated_report_drops_shadowing_metadata() {
    let Value::Object(metadata) = json!({
      "reportUrl": "x",
      "displayNumber": 99,
      "stats": {},
      "ci": "github"
    }) else {
      unreachable!()
    };
    let request = ReportRequest {
      project: "web".to_string(),
      display_number: Some(3),
      metadata,
      ..Default::default()
    };

    let report = Report::generated("abc", request, ReportStats::default(), "/r/abc".to_string());
    let encoded = serde_json::to_vec(&report).unwrap();
    let decoded: Report = serde_json::from_slice(&encoded).unwrap();

    assert_eq!(decoded.report_url, "/r/abc");
    assert_eq!(decoded.display_number, Some(3));
    assert_eq!(decoded.metadata.len(), 1);
    assert_eq!(decoded.metadata.get("ci"), Some(&json!("github")));
  }

  #[test]
  fn test_report_sidecar_shape() {
    let raw = json!({
      "reportID": "abc",
      "project": "web",
      "displayNumber": 7,
      "createdAt": "2024-05-01T10:00:00Z",
      "reportUrl": "/api/serve/abc/index.html",
      "stats": { "total": 3, "expected": 2, "unexpected": 1 },
      "ci": "github"
    });

    let report: Report = serde_json::from_value(raw).unwrap();
    assert_eq!(report.display_number, Some(7));
    assert_eq!(report.stats.unexpected, 1);
    assert_eq!(report.stats.flaky, 0);
    assert_eq!(report.metadata.get("ci"), Some(&json!("github")));
    assert_eq!(report.size_bytes, 0);
  }
}
