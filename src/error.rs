//! Error types for the tinytpu datapath model.

use std::io;
use thiserror::Error;

/// Errors raised while configuring or driving the datapath.
#[derive(Debug, Error)]
pub enum TpuError {
  /// A unit was configured with parameters it cannot run with.
  #[error("configuration error: {0}")]
  Config(String),

  /// A stored value or packed record is outside its legal range.
  #[error("validation failed: {0}")]
  Validation(String),

  /// A storage access fell outside the table it addresses.
  #[error("storage error: {0}")]
  Storage(String),

  /// A table file could not be parsed.
  #[error("{file}:{line}: {msg}")]
  Parse { file: String, line: usize, msg: String },

  #[error(transparent)]
  Io(#[from] io::Error),
}

impl TpuError {
  pub fn config(msg: impl Into<String>) -> Self {
    TpuError::Config(msg.into())
  }

  pub fn validation(msg: impl Into<String>) -> Self {
    TpuError::Validation(msg.into())
  }

  pub fn storage(msg: impl Into<String>) -> Self {
    TpuError::Storage(msg.into())
  }
}

impl From<TpuError> for io::Error {
  fn from(err: TpuError) -> Self {
    match err {
      TpuError::Io(e) => e,
      TpuError::Parse { .. } | TpuError::Validation(_) => io::Error::new(io::ErrorKind::InvalidData, err.to_string()),
      TpuError::Config(_) | TpuError::Storage(_) => io::Error::new(io::ErrorKind::InvalidInput, err.to_string()),
    }
  }
}

pub type Result<T> = std::result::Result<T, TpuError>;
