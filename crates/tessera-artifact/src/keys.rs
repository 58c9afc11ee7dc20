//! Key layout shared by both backends.

pub(crate) const RESULTS_DIR: &str = "results";
pub(crate) const REPORTS_DIR: &str = "reports";
pub(crate) const CONFIG_FILE: &str = "config.json";
/// Where the filesystem store assembles a report before publishing it.
pub(crate) const STAGING_DIR: &str = ".staging";
pub(crate) const REPORT_INDEX: &str = "index.html";
pub(crate) const REPORT_METADATA: &str = "metadata.json";

pub(crate) fn result_sidecar(result_id: &str) -> String {
  format!("{}/{}.json", RESULTS_DIR, result_id)
}

pub(crate) fn result_archive(result_id: &str) -> String {
  format!("{}/{}.zip", RESULTS_DIR, result_id)
}

pub(crate) fn result_file(filename: &str) -> String {
  format!("{}/{}", RESULTS_DIR, filename)
}

pub(crate) fn report_prefix(location: &str) -> String {
  format!("{}/{}", REPORTS_DIR, location)
}

pub(crate) fn report_file(location: &str, relative: &str) -> String {
  format!("{}/{}/{}", REPORTS_DIR, location, relative)
}

/// Public URL of a report's entry page.
pub(crate) fn report_url(prefix: &str, location: &str) -> String {
  format!("{}/{}/{}", prefix.trim_end_matches('/'), location, REPORT_INDEX)
}

/// Reject identifiers that could escape their directory.
pub(crate) fn validate_id(id: &str) -> Result<(), crate::Error> {
  let valid = !id.is_empty()
    && id != "."
    && id != ".."
    && !id.contains('/')
    && !id.contains('\\')
    && !id.contains('\0');
  if valid {
    Ok(())
  } else {
    Err(crate::Error::InvalidInput(format!("invalid identifier: {:?}", id)))
  }
}

/// Like [`validate_id`] but allows nested relative locations such as
/// `project/report-id`.
pub(crate) fn validate_location(location: &str) -> Result<(), crate::Error> {
  if location.starts_with('/') {
    return Err(crate::Error::InvalidInput(format!(
      "invalid location: {:?}",
      location
    )));
  }
  location.split('/').try_for_each(validate_id)
}

/// Split a results key into `(resultID, extension)`.
pub(crate) fn parse_result_key(key: &str) -> Option<(&str, &str)> {
  let name = key.strip_prefix(RESULTS_DIR)?.strip_prefix('/')?;
  if name.contains('/') {
    return None;
  }
  name.rsplit_once('.')
}

/// Split a reports key into `(reportID, path inside the report)`.
pub(crate) fn parse_report_key(key: &str) -> Option<(&str, &str)> {
  let rest = key.strip_prefix(REPORTS_DIR)?.strip_prefix('/')?;
  rest.split_once('/')
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_result_key() {
    assert_eq!(parse_result_key("results/abc.json"), Some(("abc", "json")));
    assert_eq!(parse_result_key("results/abc.zip"), Some(("abc", "zip")));
    assert_eq!(parse_result_key("results/nested/abc.zip"), None);
    assert_eq!(parse_result_key("reports/abc/index.html"), None);
  }

  #[test]
  fn test_parse_report_key() {
    assert_eq!(
      parse_report_key("reports/abc/index.html"),
      Some(("abc", "index.html"))
    );
    assert_eq!(
      parse_report_key("reports/abc/data/trace.zip"),
      Some(("abc", "data/trace.zip"))
    );
    assert_eq!(parse_report_key("reports/abc"), None);
  }

  #[test]
  fn test_report_url() {
    assert_eq!(report_url("/api/serve/", "abc"), "/api/serve/abc/index.html");
    assert_eq!(report_url("", "abc"), "/abc/index.html");
  }

  #[test]
  fn test_validate_id() {
    assert!(validate_id("3f2a-11").is_ok());
    assert!(validate_id("").is_err());
    assert!(validate_id("..").is_err());
    assert!(validate_id("a/b").is_err());
    assert!(validate_location("web/3f2a").is_ok());
    assert!(validate_location("web/../etc").is_err());
    assert!(validate_location("/etc").is_err());
  }
}
