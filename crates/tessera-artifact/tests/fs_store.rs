use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Value, json};
use tessera_artifact::{ArtifactStore, ByteStream, Error, FsStore, ReportGenerator, ReportRequest};
use tessera_config::GeneratorConfig;

fn bytes_stream(data: &'static [u8]) -> ByteStream {
  Box::pin(futures::stream::iter(vec![Ok::<_, Error>(Bytes::from_static(data))]))
}

fn details(value: Value) -> serde_json::Map<String, Value> {
  match value {
    Value::Object(map) => map,
    _ => panic!("details must be an object"),
  }
}

/// A generator that lists its inputs next to a plain index page.
fn listing_generator() -> ReportGenerator {
  ReportGenerator::new(GeneratorConfig {
    program: "sh".to_string(),
    args: vec![
      "-c".to_string(),
      "mkdir -p {output} && ls {input} > {output}/inputs.txt && echo '<html></html>' > {output}/index.html"
        .to_string(),
    ],
    env: BTreeMap::new(),
  })
}

async fn seed_result(store: &FsStore, id: &str, project: &str) {
  let written = store
    .save_result(&format!("{}.zip", id), bytes_stream(b"PK-archive"))
    .await
    .unwrap();
  store
    .save_result_details(id, details(json!({ "project": project, "branch": "main" })), written)
    .await
    .unwrap();
}

#[tokio::test]
async fn test_result_round_trip_keeps_tags() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path(), listing_generator());
  seed_result(&store, "r1", "web").await;

  let listing = store.read_results().await.unwrap();
  assert_eq!(listing.total, 1);
  let record = &listing.items[0];
  assert_eq!(record.result_id, "r1");
  assert_eq!(record.project, "web");
  assert_eq!(record.size_bytes, 10);
  assert_eq!(record.metadata.get("branch"), Some(&json!("main")));
}

#[cfg(unix)]
#[tokio::test]
async fn test_generate_report_from_results() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path(), listing_generator());
  seed_result(&store, "r1", "web").await;
  seed_result(&store, "r2", "web").await;

  let generated = store
    .generate_report(
      &["r1".to_string(), "r2".to_string()],
      ReportRequest {
        project: "web".to_string(),
        title: Some("nightly".to_string()),
        ..Default::default()
      },
    )
    .await
    .unwrap();

  let report_dir = dir.path().join("reports").join(&generated.report_id);
  let inputs = std::fs::read_to_string(report_dir.join("inputs.txt")).unwrap();
  assert_eq!(inputs.lines().collect::<Vec<_>>(), vec!["r1.zip", "r2.zip"]);
  assert!(report_dir.join("metadata.json").exists());
  assert_eq!(
    generated.report.report_url,
    format!("/api/serve/{}/index.html", generated.report_id)
  );
  assert!(generated.report.size_bytes > 0);

  let read_back = store.read_report(&generated.report_id, None).await.unwrap();
  assert_eq!(read_back.title.as_deref(), Some("nightly"));
  assert_eq!(read_back.project, "web");
}

#[cfg(unix)]
#[tokio::test]
async fn test_generate_report_with_missing_result_leaves_nothing() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path(), listing_generator());
  seed_result(&store, "r1", "web").await;

  let err = store
    .generate_report(
      &["r1".to_string(), "ghost".to_string()],
      ReportRequest::default(),
    )
    .await
    .unwrap_err();

  assert!(err.is_not_found());
  let reports = std::fs::read_dir(dir.path().join("reports")).unwrap().count();
  assert_eq!(reports, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_report_is_invisible_until_generation_finishes() {
  let dir = tempfile::tempdir().unwrap();
  let slow = ReportGenerator::new(GeneratorConfig {
    program: "sh".to_string(),
    args: vec![
      "-c".to_string(),
      "echo '<html></html>' > {output}/index.html && sleep 1".to_string(),
    ],
    env: BTreeMap::new(),
  });
  let store = FsStore::new(dir.path(), slow);
  seed_result(&store, "r1", "web").await;

  let request = ReportRequest {
    project: "web".to_string(),
    title: Some("nightly".to_string()),
    display_number: Some(1),
    ..Default::default()
  };
  let result_ids = ["r1".to_string()];
  let (generated, during) = tokio::join!(
    store.generate_report(&result_ids, request),
    async {
      tokio::time::sleep(std::time::Duration::from_millis(400)).await;
      store.read_reports().await.unwrap()
    }
  );
  let generated = generated.unwrap();
  assert_eq!(during.total, 0);

  let stored = store.read_report(&generated.report_id, None).await.unwrap();
  assert_eq!(stored.display_number, Some(1));
  assert_eq!(stored.title.as_deref(), Some("nightly"));
  assert_eq!(stored.project, "web");

  let staging = std::fs::read_dir(dir.path().join(".staging")).unwrap().count();
  assert_eq!(staging, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_report_metadata_cannot_shadow_sidecar_fields() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path(), listing_generator());
  seed_result(&store, "r1", "web").await;

  let generated = store
    .generate_report(
      &["r1".to_string()],
      ReportRequest {
        metadata: details(json!({ "reportUrl": "x", "ci": "github" })),
        ..Default::default()
      },
    )
    .await
    .unwrap();

  let stored = store.read_report(&generated.report_id, None).await.unwrap();
  assert_ne!(stored.report_url, "x");
  assert_eq!(stored.metadata.get("ci"), Some(&json!("github")));
  assert_eq!(store.read_reports().await.unwrap().total, 1);
}

#[tokio::test]
async fn test_generate_report_requires_results() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path(), listing_generator());
  let err = store
    .generate_report(&[], ReportRequest::default())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_missing_sidecar_is_repaired_once() {
  let dir = tempfile::tempdir().unwrap();
  let report_dir = dir.path().join("reports/legacy");
  std::fs::create_dir_all(&report_dir).unwrap();
  std::fs::write(report_dir.join("index.html"), "<html>old</html>").unwrap();
  let store = Arc::new(FsStore::new(dir.path(), listing_generator()));

  let mut handles = Vec::new();
  for _ in 0..8 {
    let store = store.clone();
    handles.push(tokio::spawn(async move {
      store.read_report("legacy", None).await.unwrap()
    }));
  }
  let mut reports = Vec::new();
  for handle in handles {
    reports.push(handle.await.unwrap());
  }

  assert!(report_dir.join("metadata.json").exists());
  assert!(reports.iter().all(|r| r.created_at == reports[0].created_at));
  assert_eq!(reports[0].report_url, "/api/serve/legacy/index.html");

  // No stray temp files from concurrent writers.
  let entries = std::fs::read_dir(&report_dir).unwrap().count();
  assert_eq!(entries, 2);
}

#[tokio::test]
async fn test_listing_skips_directories_without_index() {
  let dir = tempfile::tempdir().unwrap();
  std::fs::create_dir_all(dir.path().join("reports/empty")).unwrap();
  let good = dir.path().join("reports/good");
  std::fs::create_dir_all(&good).unwrap();
  std::fs::write(good.join("index.html"), "<html></html>").unwrap();

  let store = FsStore::new(dir.path(), listing_generator());
  let listing = store.read_reports().await.unwrap();

  assert_eq!(listing.total, 1);
  assert_eq!(listing.items[0].report_id, "good");
}

#[tokio::test]
async fn test_delete_is_best_effort() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path(), listing_generator());
  seed_result(&store, "r1", "web").await;
  // Archive already gone: the sidecar must still be removed.
  std::fs::remove_file(dir.path().join("results/r1.zip")).unwrap();

  store
    .delete_results(&["r1".to_string(), "never-existed".to_string()])
    .await
    .unwrap();
  store
    .delete_reports(&["never-existed".to_string()])
    .await
    .unwrap();

  assert_eq!(store.read_results().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_server_data_info_walks_disk() {
  let dir = tempfile::tempdir().unwrap();
  let store = FsStore::new(dir.path(), listing_generator());
  seed_result(&store, "r1", "web").await;
  let report_dir = dir.path().join("reports/a");
  std::fs::create_dir_all(&report_dir).unwrap();
  std::fs::write(report_dir.join("index.html"), vec![b'x'; 100]).unwrap();

  let info = store.server_data_info().await.unwrap();
  assert_eq!(info.results_count, 1);
  assert_eq!(info.reports_count, 1);
  assert_eq!(info.reports_size_bytes, 100);
  assert!(info.results_size_bytes > 10);
  assert_eq!(
    info.total_size_bytes,
    info.results_size_bytes + info.reports_size_bytes
  );
}
