use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default multipart chunk size (25 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 25 * 1024 * 1024;

/// Errors raised while loading the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid configuration: {0}")]
  Invalid(String),
}

/// Top level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Root for everything tessera keeps locally (filesystem artifacts,
  /// staging area, cache database).
  pub data_dir: PathBuf,
  pub storage: StorageConfig,
  pub upload: UploadConfig,
  pub cache: CacheConfig,
  pub generator: GeneratorConfig,
  /// Maximum number of in-flight items for bulk storage operations.
  pub batch_concurrency: usize,
  /// Attempts per file when pushing a generated report to object storage.
  pub file_upload_attempts: u32,
  /// Prefix used to build `reportUrl` for generated reports.
  pub report_url_prefix: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      data_dir: PathBuf::from(".tessera"),
      storage: StorageConfig::default(),
      upload: UploadConfig::default(),
      cache: CacheConfig::default(),
      generator: GeneratorConfig::default(),
      batch_concurrency: 10,
      file_upload_attempts: 3,
      report_url_prefix: "/api/serve".to_string(),
    }
  }
}

impl ServerConfig {
  /// Load the configuration from a JSON file, or use defaults when no file is
  /// given. `data_dir` overrides whatever the file says.
  pub fn load(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
    let mut config = match path {
      Some(path) => {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
          path: path.to_path_buf(),
          source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
          path: path.to_path_buf(),
          source,
        })?
      }
      None => Self::default(),
    };

    if let Some(data_dir) = data_dir {
      config.data_dir = data_dir;
    }

    config.validate()?;
    Ok(config)
  }

  /// Check the values that would otherwise fail deep inside the store.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.batch_concurrency == 0 {
      return Err(ConfigError::Invalid(
        "batch_concurrency must be at least 1".to_string(),
      ));
    }
    if self.upload.chunk_size_bytes == 0 {
      return Err(ConfigError::Invalid(
        "upload.chunk_size_bytes must be at least 1".to_string(),
      ));
    }
    if self.file_upload_attempts == 0 {
      return Err(ConfigError::Invalid(
        "file_upload_attempts must be at least 1".to_string(),
      ));
    }
    if let StorageConfig::S3(s3) = &self.storage
      && s3.bucket.trim().is_empty()
    {
      return Err(ConfigError::Invalid("s3 bucket must not be empty".to_string()));
    }
    Ok(())
  }

  /// Directory holding results and reports for the filesystem backend.
  pub fn storage_root(&self) -> PathBuf {
    match &self.storage {
      StorageConfig::Fs { root: Some(root) } => root.clone(),
      _ => self.data_dir.join("data"),
    }
  }

  /// Local directory where result archives may be pre-staged before report
  /// generation against object storage.
  pub fn staging_dir(&self) -> PathBuf {
    match &self.storage {
      StorageConfig::S3(S3Config {
        staging_dir: Some(dir),
        ..
      }) => dir.clone(),
      _ => self.data_dir.join("staging"),
    }
  }

  /// Path of the SQLite metadata cache.
  pub fn cache_path(&self) -> PathBuf {
    self
      .cache
      .path
      .clone()
      .unwrap_or_else(|| self.data_dir.join("metadata.db"))
  }
}

/// Which backend holds results and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
  Fs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root: Option<PathBuf>,
  },
  S3(S3Config),
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self::Fs { root: None }
  }
}

/// S3-compatible bucket settings. Credentials are taken from the usual
/// `AWS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
  pub bucket: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  /// Custom endpoint for MinIO, R2 and friends.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub endpoint: Option<String>,
  #[serde(default)]
  pub allow_http: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub staging_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
  /// Size of every multipart part except the last one.
  pub chunk_size_bytes: usize,
  /// Let clients upload straight to the bucket when the length is known.
  pub presign: bool,
  pub presign_expiry_secs: u64,
}

impl Default for UploadConfig {
  fn default() -> Self {
    Self {
      chunk_size_bytes: DEFAULT_CHUNK_SIZE,
      presign: true,
      presign_expiry_secs: 30 * 60,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub path: Option<PathBuf>,
}

/// The external tool that turns a directory of result archives into a static
/// report. `{input}` and `{output}` in `args` and `env` values are replaced
/// with the scratch input directory and the report output directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
  pub program: String,
  pub args: Vec<String>,
  pub env: BTreeMap<String, String>,
}

impl Default for GeneratorConfig {
  fn default() -> Self {
    Self {
      program: "npx".to_string(),
      args: vec![
        "playwright".to_string(),
        "merge-reports".to_string(),
        "--reporter".to_string(),
        "html".to_string(),
        "{input}".to_string(),
      ],
      env: BTreeMap::from([(
        "PLAYWRIGHT_HTML_OUTPUT_DIR".to_string(),
        "{output}".to_string(),
      )]),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_without_file() {
    let config = ServerConfig::load(None, Some(PathBuf::from("/srv/tessera"))).unwrap();
    assert_eq!(config.data_dir, PathBuf::from("/srv/tessera"));
    assert_eq!(config.storage, StorageConfig::Fs { root: None });
    assert_eq!(config.storage_root(), PathBuf::from("/srv/tessera/data"));
    assert_eq!(config.cache_path(), PathBuf::from("/srv/tessera/metadata.db"));
    assert_eq!(config.upload.chunk_size_bytes, DEFAULT_CHUNK_SIZE);
  }

  #[test]
  fn test_load_s3_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
      &path,
      r#"{
        "storage": { "backend": "s3", "bucket": "reports", "endpoint": "http://localhost:9000", "allow_http": true },
        "upload": { "chunk_size_bytes": 5242880 },
        "batch_concurrency": 4
      }"#,
    )
    .unwrap();

    let config = ServerConfig::load(Some(&path), None).unwrap();
    match &config.storage {
      StorageConfig::S3(s3) => {
        assert_eq!(s3.bucket, "reports");
        assert_eq!(s3.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(s3.allow_http);
      }
      other => panic!("expected s3 storage, got {:?}", other),
    }
    assert_eq!(config.upload.chunk_size_bytes, 5 * 1024 * 1024);
    assert!(config.upload.presign);
    assert_eq!(config.batch_concurrency, 4);
  }

  #[test]
  fn test_rejects_zero_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{ "batch_concurrency": 0 }"#).unwrap();

    let err = ServerConfig::load(Some(&path), None).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
  }

  #[test]
  fn test_parse_error_names_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = ServerConfig::load(Some(&path), None).unwrap_err();
    assert!(err.to_string().contains("broken.json"));
  }
}
