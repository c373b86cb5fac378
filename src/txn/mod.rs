use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::engine::{DocumentEngine, EngineSession};
use crate::error::{Error, Result};
use crate::mapper::FieldMapper;
use crate::query::{ModelQuery, QueryCore, WriteResult};
use crate::raw::{RawExecutor, StatementCache};

struct TxInner {
  mapper: FieldMapper,
  engine: Arc<dyn DocumentEngine>,
  session: Box<dyn EngineSession>,
  cache: StatementCache,
  finalized: AtomicBool,
}

/// A transaction owning one engine session.
///
/// Every query built from the transaction routes its engine calls
/// through the session; none spawn sessions of their own. The session
/// is released exactly once, by commit or rollback.
#[derive(Clone)]
pub struct Transaction {
  inner: Arc<TxInner>,
}

impl Transaction {
  pub(crate) async fn begin(
    mapper: FieldMapper,
    engine: Arc<dyn DocumentEngine>,
    cache: StatementCache,
  ) -> Result<Self> {
    let session = engine.begin_session().await.map_err(|e| Error::Connectivity(e))?;
    tracing::debug!(session = %session.id(), "transaction started");
    Ok(Self {
      inner: Arc::new(TxInner {
        mapper,
        engine,
        session,
        cache,
        finalized: AtomicBool::new(false),
      }),
    })
  }

  fn core(&self) -> QueryCore {
    QueryCore::new(
      self.inner.mapper.clone(),
      self.inner.engine.clone(),
      Some(self.inner.session.id()),
    )
  }

  /// Fluent queries scoped to this transaction's session.
  pub fn model(&self, name: impl Into<String>) -> ModelQuery {
    ModelQuery::new(self.core(), name)
  }

  /// Raw reads inside the transaction.
  pub async fn query_raw<T: serde::de::DeserializeOwned>(
    &self,
    input: &str,
    args: &[Value],
  ) -> Result<Vec<T>> {
    self.executor().find(input, args).await
  }

  /// Raw writes inside the transaction.
  pub async fn execute_raw(&self, input: &str, args: &[Value]) -> Result<WriteResult> {
    self.executor().exec(input, args).await
  }

  fn executor(&self) -> RawExecutor<'_> {
    RawExecutor::new(
      &self.inner.mapper,
      self.inner.engine.clone(),
      Some(self.inner.session.id()),
      self.inner.cache.clone(),
    )
  }

  pub async fn commit(&self) -> Result<()> {
    self.finalize()?;
    self.inner.session.commit().await.map_err(Error::engine)?;
    tracing::debug!(session = %self.inner.session.id(), "transaction committed");
    Ok(())
  }

  pub async fn rollback(&self) -> Result<()> {
    self.finalize()?;
    self.inner.session.abort().await.map_err(Error::engine)?;
    tracing::debug!(session = %self.inner.session.id(), "transaction rolled back");
    Ok(())
  }

  /// Save-points are not part of the engine contract.
  pub fn savepoint(&self, _name: &str) -> Result<()> {
    Err(Error::unsupported("save-points"))
  }

  fn finalize(&self) -> Result<()> {
    if self.inner.finalized.swap(true, Ordering::SeqCst) {
      return Err(Error::internal("transaction already finalized"));
    }
    Ok(())
  }

  pub(crate) fn is_finalized(&self) -> bool {
    self.inner.finalized.load(Ordering::SeqCst)
  }
}
