use tessera_upload::UploadError;

/// Error type for service operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("invalid request: {0}")]
  InvalidInput(String),

  #[error("configuration error: {0}")]
  Config(#[from] tessera_config::ConfigError),

  #[error(transparent)]
  Store(#[from] tessera_artifact::Error),

  #[error(transparent)]
  Cache(#[from] tessera_cache::Error),

  #[error(transparent)]
  Upload(#[from] UploadError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl ServiceError {
  pub fn is_not_found(&self) -> bool {
    match self {
      Self::NotFound(_) => true,
      Self::Store(err) => err.is_not_found(),
      Self::Cache(err) => err.is_not_found(),
      Self::Upload(UploadError::Store(err)) => err.is_not_found(),
      _ => false,
    }
  }

  /// True when the caller sent something unusable rather than the backend
  /// failing.
  pub fn is_client_error(&self) -> bool {
    matches!(
      self,
      Self::InvalidInput(_)
        | Self::Upload(UploadError::SizeMismatch { .. })
        | Self::Store(tessera_artifact::Error::InvalidConfig(_))
        | Self::Store(tessera_artifact::Error::InvalidInput(_))
    ) || self.is_not_found()
  }
}
