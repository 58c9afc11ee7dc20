//! Summary extraction from a generated HTML report.
//!
//! The generator inlines its data model into `index.html` as a base64 data
//! URL holding a zip archive. `report.json` inside that archive carries the
//! overall stats and every test case.

use std::io::{Cursor, Read};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::Error;
use crate::types::{ParsedTest, ReportStats};

const DATA_MARKER: &str = "window.playwrightReportBase64 = \"";
const DATA_URL_PREFIX: &str = "data:application/zip;base64,";
const REPORT_ENTRY: &str = "report.json";

/// What a generated report says about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HtmlReportSummary {
  pub stats: ReportStats,
  pub tests: Vec<ParsedTest>,
  pub project_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HtmlReportModel {
  #[serde(default)]
  stats: ReportStats,
  #[serde(default)]
  files: Vec<FileSummary>,
  #[serde(default)]
  project_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileSummary {
  file_id: String,
  file_name: String,
  #[serde(default)]
  tests: Vec<TestSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestSummary {
  test_id: String,
  title: String,
  #[serde(default)]
  project_name: String,
  #[serde(default)]
  path: Vec<String>,
  outcome: String,
  #[serde(default)]
  duration: f64,
}

/// Parse a report's `index.html`.
///
/// Returns `Ok(None)` when the page carries no embedded data model (e.g. a
/// report produced by some other tool); malformed embedded data is an error.
pub fn parse_html_report(html: &str) -> Result<Option<HtmlReportSummary>, Error> {
  let Some(start) = html.find(DATA_MARKER) else {
    return Ok(None);
  };
  let rest = &html[start + DATA_MARKER.len()..];
  let end = rest
    .find('"')
    .ok_or_else(|| Error::Generation("unterminated embedded report data".to_string()))?;
  let encoded = rest[..end].trim_start_matches(DATA_URL_PREFIX);

  let archive = STANDARD
    .decode(encoded)
    .map_err(|e| Error::Generation(format!("embedded report data is not base64: {}", e)))?;
  let mut zip = zip::ZipArchive::new(Cursor::new(archive))
    .map_err(|e| Error::Generation(format!("embedded report data is not a zip: {}", e)))?;

  let mut raw = String::new();
  zip
    .by_name(REPORT_ENTRY)
    .map_err(|e| Error::Generation(format!("embedded report has no {}: {}", REPORT_ENTRY, e)))?
    .read_to_string(&mut raw)?;

  let model: HtmlReportModel = serde_json::from_str(&raw)?;
  Ok(Some(summarize(model)))
}

fn summarize(model: HtmlReportModel) -> HtmlReportSummary {
  let tests = model
    .files
    .into_iter()
    .flat_map(|file| {
      let file_id = file.file_id;
      let file_name = file.file_name;
      file.tests.into_iter().map(move |test| {
        let mut title_path: Vec<String> = test.path.into_iter().filter(|p| !p.is_empty()).collect();
        title_path.push(test.title);
        ParsedTest {
          test_id: test.test_id,
          file_id: file_id.clone(),
          file_path: file_name.clone(),
          title: title_path.join(" > "),
          project_name: test.project_name,
          outcome: test.outcome,
          duration_ms: test.duration.round() as i64,
        }
      })
    })
    .collect();

  HtmlReportSummary {
    stats: model.stats,
    tests,
    project_names: model.project_names,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::io::Write;

  fn render(report: &serde_json::Value) -> String {
    let mut buffer = Cursor::new(Vec::new());
    {
      let mut writer = zip::ZipWriter::new(&mut buffer);
      writer
        .start_file(REPORT_ENTRY, zip::write::SimpleFileOptions::default())
        .unwrap();
      writer.write_all(report.to_string().as_bytes()).unwrap();
      writer.finish().unwrap();
    }
    format!(
      "<html><body><script>\n{}{}{}\";</script></body></html>",
      DATA_MARKER,
      DATA_URL_PREFIX,
      STANDARD.encode(buffer.into_inner())
    )
  }

  #[test]
  fn test_parse_stats_and_tests() {
    let html = render(&json!({
      "stats": { "total": 3, "expected": 1, "unexpected": 1, "flaky": 1, "skipped": 0, "ok": false },
      "projectNames": ["chromium"],
      "files": [{
        "fileId": "f1",
        "fileName": "auth/login.spec.ts",
        "tests": [
          { "testId": "t1", "title": "logs in", "projectName": "chromium", "path": ["login"], "outcome": "expected", "duration": 1200.4 },
          { "testId": "t2", "title": "rejects bad password", "projectName": "chromium", "path": [], "outcome": "unexpected", "duration": 80 },
          { "testId": "t3", "title": "remembers me", "projectName": "chromium", "outcome": "flaky", "duration": 300 }
        ]
      }]
    }));

    let summary = parse_html_report(&html).unwrap().unwrap();
    assert_eq!(summary.stats.total, 3);
    assert_eq!(summary.stats.unexpected, 1);
    assert_eq!(summary.stats.flaky, 1);
    assert_eq!(summary.project_names, vec!["chromium"]);
    assert_eq!(summary.tests.len(), 3);
    assert_eq!(summary.tests[0].title, "login > logs in");
    assert_eq!(summary.tests[0].file_path, "auth/login.spec.ts");
    assert_eq!(summary.tests[0].duration_ms, 1200);
    assert_eq!(summary.tests[1].outcome, "unexpected");
  }

  #[test]
  fn test_plain_html_has_no_summary() {
    let summary = parse_html_report("<html><body>hello</body></html>").unwrap();
    assert!(summary.is_none());
  }

  #[test]
  fn test_garbage_payload_is_an_error() {
    let html = format!("{}{}!!!not-base64\";", DATA_MARKER, DATA_URL_PREFIX);
    assert!(parse_html_report(&html).is_err());
  }
}
