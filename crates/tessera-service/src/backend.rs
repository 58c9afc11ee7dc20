//! Builds the artifact store selected by [`ServerConfig`].

use std::sync::Arc;

use tessera_artifact::{
  ArtifactStore, BatchExecutor, BucketSettings, BucketStore, FsStore, ReportGenerator,
};
use tessera_config::{ServerConfig, StorageConfig};
use tracing::info;

use crate::ServiceError;

pub fn build_store(config: &ServerConfig) -> Result<Arc<dyn ArtifactStore>, ServiceError> {
  let generator = ReportGenerator::new(config.generator.clone());
  let batch = BatchExecutor::new(config.batch_concurrency);

  match &config.storage {
    StorageConfig::Fs { .. } => {
      let root = config.storage_root();
      info!(root = %root.display(), "using filesystem artifact store");
      let store = FsStore::new(root, generator)
        .with_batch(batch)
        .with_report_url_prefix(config.report_url_prefix.clone());
      Ok(Arc::new(store))
    }
    StorageConfig::S3(s3) => {
      let settings = BucketSettings {
        chunk_size: config.upload.chunk_size_bytes,
        batch,
        file_upload_attempts: config.file_upload_attempts,
        report_url_prefix: config.report_url_prefix.clone(),
        staging_dir: Some(config.staging_dir()),
      };
      Ok(Arc::new(BucketStore::s3(s3, settings, generator)?))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_default_config_uses_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
      data_dir: dir.path().to_path_buf(),
      ..Default::default()
    };
    let store = build_store(&config).unwrap();
    let info = store.server_data_info().await.unwrap();
    assert_eq!(info.results_count, 0);
    assert_eq!(info.reports_count, 0);
  }
}
