use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// White-label settings stored next to the artifacts as `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SiteConfig {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub logo_path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub favicon_path: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub header_links: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub reporter_paths: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub jira: Option<JiraSettings>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cron: Option<CronSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JiraSettings {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project_key: Option<String>,
}

/// Retention settings consumed by the expiry jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CronSettings {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result_expire_days: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub report_expire_days: Option<u32>,
}

impl SiteConfig {
  /// Parse and schema-check a raw blob.
  pub fn from_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(raw)
  }

  /// Apply a partial update on top of `self` and re-validate the result.
  ///
  /// Objects are merged key by key, everything else is replaced. A `null`
  /// value in `partial` removes the key.
  pub fn merged(&self, partial: Value) -> Result<Self, serde_json::Error> {
    let mut base = serde_json::to_value(self)?;
    merge_json(&mut base, partial);
    serde_json::from_value(base)
  }
}

/// Recursively merge `patch` into `target`.
pub fn merge_json(target: &mut Value, patch: Value) {
  match (target, patch) {
    (Value::Object(target), Value::Object(patch)) => {
      for (key, value) in patch {
        if value.is_null() {
          target.remove(&key);
          continue;
        }
        match target.get_mut(&key) {
          Some(existing) if existing.is_object() && value.is_object() => {
            merge_json(existing, value);
          }
          _ => {
            target.insert(key, value);
          }
        }
      }
    }
    (target, patch) => *target = patch,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_merge_keeps_untouched_keys() {
    let existing = SiteConfig {
      title: Some("Nightly".to_string()),
      logo_path: Some("/logo.svg".to_string()),
      ..Default::default()
    };

    let merged = existing
      .merged(json!({ "title": "Release", "cron": { "reportExpireDays": 30 } }))
      .unwrap();

    assert_eq!(merged.title.as_deref(), Some("Release"));
    assert_eq!(merged.logo_path.as_deref(), Some("/logo.svg"));
    assert_eq!(merged.cron.unwrap().report_expire_days, Some(30));
  }

  #[test]
  fn test_merge_nested_objects() {
    let existing = SiteConfig {
      jira: Some(JiraSettings {
        base_url: Some("https://jira.example.com".to_string()),
        project_key: Some("QA".to_string()),
      }),
      ..Default::default()
    };

    let merged = existing.merged(json!({ "jira": { "projectKey": "OPS" } })).unwrap();
    let jira = merged.jira.unwrap();
    assert_eq!(jira.base_url.as_deref(), Some("https://jira.example.com"));
    assert_eq!(jira.project_key.as_deref(), Some("OPS"));
  }

  #[test]
  fn test_null_removes_key() {
    let existing = SiteConfig {
      title: Some("Nightly".to_string()),
      ..Default::default()
    };
    let merged = existing.merged(json!({ "title": null })).unwrap();
    assert_eq!(merged.title, None);
  }

  #[test]
  fn test_schema_violations_rejected() {
    assert!(SiteConfig::from_slice(br#"{ "title": 42 }"#).is_err());
    assert!(SiteConfig::from_slice(br#"{ "unknownKey": true }"#).is_err());
    assert!(SiteConfig::from_slice(b"{ broken").is_err());
    assert!(SiteConfig::default().merged(json!({ "reporterPaths": "x" })).is_err());
  }
}
