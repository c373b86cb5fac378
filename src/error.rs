use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the core can surface, classified by kind.
///
/// Compilation failures (Syntax/Parameter/Schema/Validation) are raised
/// before any engine contact; the rest originate from execution.
#[derive(Debug, Error)]
pub enum Error {
  #[error("syntax error: {0}")]
  Syntax(String),

  #[error("parameter error: {0}")]
  Parameter(String),

  #[error("schema error: {0}")]
  Schema(String),

  #[error("validation error: {0}")]
  Validation(String),

  #[error("constraint violation: {0}")]
  Constraint(String),

  #[error("no matching document")]
  NotFound,

  #[error("unsupported operation: {0}")]
  Unsupported(String),

  #[error("connectivity error: {0}")]
  Connectivity(anyhow::Error),

  #[error("operation cancelled")]
  Cancelled,

  #[error("operation timed out")]
  Timeout,

  #[error("internal error: {0}")]
  Internal(String),
}

impl Error {
  pub fn syntax(msg: impl Into<String>) -> Self {
    Self::Syntax(msg.into())
  }

  pub fn parameter(msg: impl Into<String>) -> Self {
    Self::Parameter(msg.into())
  }

  pub fn schema(msg: impl Into<String>) -> Self {
    Self::Schema(msg.into())
  }

  pub fn validation(msg: impl Into<String>) -> Self {
    Self::Validation(msg.into())
  }

  pub fn unsupported(msg: impl Into<String>) -> Self {
    Self::Unsupported(msg.into())
  }

  pub fn internal(msg: impl Into<String>) -> Self {
    Self::Internal(msg.into())
  }

  /// Classify an engine-reported failure.
  ///
  /// Engines speak `anyhow::Error`; uniqueness and validator failures
  /// become `Constraint`, transport failures become `Connectivity`,
  /// anything else is an invariant breach.
  pub fn engine(err: anyhow::Error) -> Self {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("duplicate key") || lower.contains("unique") || lower.contains("validator") {
      Self::Constraint(msg)
    } else if lower.contains("connection") || lower.contains("unreachable") {
      Self::Connectivity(err)
    } else {
      Self::Internal(msg)
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn engine_error_classification() {
    let e = Error::engine(anyhow::anyhow!("E11000 duplicate key on users"));
    assert!(matches!(e, Error::Constraint(_)));

    let e = Error::engine(anyhow::anyhow!("connection refused"));
    assert!(matches!(e, Error::Connectivity(_)));

    let e = Error::engine(anyhow::anyhow!("bad stage"));
    assert!(matches!(e, Error::Internal(_)));
  }
}
