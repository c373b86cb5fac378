use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::engine::{DocumentEngine, MemoryEngine};
use crate::error::{Error, Result};
use crate::mapper::FieldMapper;
use crate::query::{ModelQuery, QueryCore, WriteResult};
use crate::raw::{new_statement_cache, RawExecutor, StatementCache};
use crate::schema::{Schema, SchemaRegistry};
use crate::txn::Transaction;

/// Connection scheme the handle accepts.
pub const URI_SCHEME: &str = "doc";

/// Parsed connection options. The query component is carried through
/// to the engine driver untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
  pub host: String,
  pub database: Option<String>,
  pub params: String,
}

impl ConnectOptions {
  /// Parse a `doc://host[/database][?params]` URI.
  pub fn parse(uri: &str) -> Result<Self> {
    let rest = uri
      .strip_prefix("doc://")
      .ok_or_else(|| Error::validation(format!("unsupported connection scheme in {uri}")))?;

    let (body, params) = match rest.split_once('?') {
      Some((body, params)) => (body, params.to_string()),
      None => (rest, String::new()),
    };
    let (host, database) = match body.split_once('/') {
      Some((host, db)) if !db.is_empty() => (host.to_string(), Some(db.to_string())),
      Some((host, _)) => (host.to_string(), None),
      None => (body.to_string(), None),
    };
    if host.is_empty() {
      return Err(Error::validation(format!("connection URI has no host: {uri}")));
    }
    Ok(Self { host, database, params })
  }
}

struct DatabaseInner {
  engine: Arc<dyn DocumentEngine>,
  registry: Arc<SchemaRegistry>,
  mapper: FieldMapper,
  options: ConnectOptions,
  cache: StatementCache,
  closed: AtomicBool,
}

/// The database handle: schema registration, fluent model queries,
/// raw statements and transactions, all over one engine client.
#[derive(Clone)]
pub struct Database {
  inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Database").finish_non_exhaustive()
  }
}

impl Database {
  /// Connect through a `doc://` URI. `doc://memory` yields the
  /// in-process engine; other hosts need an embedder-provided driver
  /// via [`Database::with_engine`].
  pub async fn connect(uri: &str) -> Result<Self> {
    let options = ConnectOptions::parse(uri)?;
    let engine: Arc<dyn DocumentEngine> = match options.host.as_str() {
      "memory" => Arc::new(MemoryEngine::new()),
      other => {
        return Err(Error::Connectivity(anyhow::anyhow!(
          "no engine driver registered for host {other}"
        )))
      }
    };
    Ok(Self::with_engine(engine, options))
  }

  /// Wrap an already-constructed engine client.
  pub fn with_engine(engine: Arc<dyn DocumentEngine>, options: ConnectOptions) -> Self {
    let registry = Arc::new(SchemaRegistry::new());
    let mapper = FieldMapper::new(registry.clone(), engine.clone());
    Self {
      inner: Arc::new(DatabaseInner {
        engine,
        registry,
        mapper,
        options,
        cache: new_statement_cache(),
        closed: AtomicBool::new(false),
      }),
    }
  }

  pub fn options(&self) -> &ConnectOptions {
    &self.inner.options
  }

  pub fn register_schema(&self, schema: Schema) -> Result<()> {
    self.inner.registry.register(schema)
  }

  pub fn mapper(&self) -> &FieldMapper {
    &self.inner.mapper
  }

  /// Fluent queries for one model.
  pub fn model(&self, name: impl Into<String>) -> ModelQuery {
    ModelQuery::new(
      QueryCore::new(self.inner.mapper.clone(), self.inner.engine.clone(), None),
      name,
    )
  }

  /// Raw read: SQL or a JSON command document.
  pub async fn query_raw<T: DeserializeOwned>(&self, input: &str, args: &[Value]) -> Result<Vec<T>> {
    self.executor().find(input, args).await
  }

  /// Raw read returning a single row; `NotFound` when empty.
  pub async fn query_raw_one<T: DeserializeOwned>(&self, input: &str, args: &[Value]) -> Result<T> {
    self.executor().find_one(input, args).await
  }

  /// Raw write: SQL or a JSON command document.
  pub async fn execute_raw(&self, input: &str, args: &[Value]) -> Result<WriteResult> {
    self.executor().exec(input, args).await
  }

  fn executor(&self) -> RawExecutor<'_> {
    RawExecutor::new(
      &self.inner.mapper,
      self.inner.engine.clone(),
      None,
      self.inner.cache.clone(),
    )
  }

  /// Start a transaction owning a fresh engine session.
  pub async fn begin(&self) -> Result<Transaction> {
    Transaction::begin(
      self.inner.mapper.clone(),
      self.inner.engine.clone(),
      self.inner.cache.clone(),
    )
    .await
  }

  /// Run `f` inside a transaction: commit when it returns Ok, roll
  /// back when it returns Err.
  pub async fn transaction<T, Fut>(&self, f: impl FnOnce(Transaction) -> Fut) -> Result<T>
  where
    Fut: Future<Output = Result<T>>,
  {
    let tx = self.begin().await?;
    match f(tx.clone()).await {
      Ok(value) => {
        tx.commit().await?;
        Ok(value)
      }
      Err(err) => {
        if !tx.is_finalized() {
          if let Err(abort_err) = tx.rollback().await {
            tracing::warn!(error = %abort_err, "rollback after failed transaction body");
          }
        }
        Err(err)
      }
    }
  }

  /// Ensure collections and indexes exist for every registered model.
  pub async fn sync_schemas(&self) -> Result<()> {
    crate::sync::sync_schemas(&self.inner.mapper, &self.inner.engine).await
  }

  /// User-visible collections, system namespaces filtered out.
  pub async fn list_tables(&self) -> Result<Vec<String>> {
    crate::sync::list_tables(&self.inner.engine).await
  }

  /// Disconnect the engine client. Subsequent calls are no-ops.
  pub async fn close(&self) -> Result<()> {
    if self.inner.closed.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    self.inner.engine.disconnect().await.map_err(Error::engine)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn uri_parsing() {
    let options = ConnectOptions::parse("doc://memory").unwrap();
    assert_eq!(options.host, "memory");
    assert_eq!(options.database, None);
    assert_eq!(options.params, "");

    let options = ConnectOptions::parse("doc://localhost:4321/appdb?readPreference=primary").unwrap();
    assert_eq!(options.host, "localhost:4321");
    assert_eq!(options.database.as_deref(), Some("appdb"));
    assert_eq!(options.params, "readPreference=primary");
  }

  #[test]
  fn uri_rejects_other_schemes() {
    assert!(matches!(
      ConnectOptions::parse("postgres://localhost"),
      Err(Error::Validation(_))
    ));
  }

  #[tokio::test]
  async fn connect_memory_and_close_twice() {
    let db = Database::connect("doc://memory").await.unwrap();
    db.close().await.unwrap();
    db.close().await.unwrap();
  }

  #[tokio::test]
  async fn connect_unknown_host_is_connectivity_error() {
    let err = Database::connect("doc://db.internal:4711").await.unwrap_err();
    assert!(matches!(err, Error::Connectivity(_)));
  }
}
