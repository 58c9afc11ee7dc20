//! Single-pass bucket inventory.

use std::collections::{BTreeMap, BTreeSet};

use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::path::Path;

use crate::Error;
use crate::keys::{self, REPORT_INDEX, REPORT_METADATA};

/// Everything one listing of the bucket tells us, accumulated while the
/// listing streams past instead of collecting the keys first.
#[derive(Debug, Default)]
pub(crate) struct Inventory {
  /// Result IDs that have a JSON sidecar.
  pub result_sidecars: BTreeSet<String>,
  /// Archive size per result ID.
  pub archive_sizes: BTreeMap<String, u64>,
  pub results_bytes: u64,
  /// Report IDs that have an entry page.
  pub report_indexes: BTreeSet<String>,
  /// Report IDs whose `metadata.json` was in the listing.
  pub report_sidecars: BTreeSet<String>,
  /// Total bytes under each report prefix.
  pub report_sizes: BTreeMap<String, u64>,
  pub reports_bytes: u64,
}

impl Inventory {
  /// List `prefix` (or the whole bucket) and fold every key into the totals.
  ///
  /// Continuation tokens are followed by the client; we only see a stream of
  /// entries.
  pub async fn scan(store: &dyn ObjectStore, prefix: Option<&str>) -> Result<Self, Error> {
    let prefix = prefix.map(Path::from);
    let mut listing = store.list(prefix.as_ref());
    let mut inventory = Self::default();

    while let Some(meta) = listing.try_next().await? {
      inventory.record(meta.location.as_ref(), meta.size as u64);
    }

    Ok(inventory)
  }

  fn record(&mut self, key: &str, size: u64) {
    if let Some((id, ext)) = keys::parse_result_key(key) {
      self.results_bytes += size;
      match ext {
        "json" => {
          self.result_sidecars.insert(id.to_string());
        }
        "zip" => {
          self.archive_sizes.insert(id.to_string(), size);
        }
        _ => {}
      }
    } else if let Some((id, rest)) = keys::parse_report_key(key) {
      self.reports_bytes += size;
      *self.report_sizes.entry(id.to_string()).or_default() += size;
      if rest == REPORT_INDEX {
        self.report_indexes.insert(id.to_string());
      } else if rest == REPORT_METADATA {
        self.report_sidecars.insert(id.to_string());
      }
    }
  }

  pub fn results_count(&self) -> u64 {
    self.result_sidecars.len() as u64
  }

  pub fn reports_count(&self) -> u64 {
    self.report_indexes.len() as u64
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_record_accumulates_totals() {
    let mut inv = Inventory::default();
    inv.record("results/a.json", 100);
    inv.record("results/a.zip", 4000);
    inv.record("results/b.zip", 10);
    inv.record("reports/r1/index.html", 500);
    inv.record("reports/r1/metadata.json", 50);
    inv.record("reports/r1/data/trace.zip", 1000);
    inv.record("reports/r2/data/orphan.png", 7);
    inv.record("config.json", 30);

    assert_eq!(inv.results_count(), 1);
    assert_eq!(inv.results_bytes, 4110);
    assert_eq!(inv.archive_sizes.get("a"), Some(&4000));
    assert_eq!(inv.reports_count(), 1);
    assert_eq!(inv.report_sizes.get("r1"), Some(&1550));
    assert_eq!(inv.reports_bytes, 1557);
    assert!(inv.report_sidecars.contains("r1"));
  }
}
