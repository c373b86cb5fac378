use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

mod memory;

pub use memory::MemoryEngine;

/// Engine calls speak `anyhow::Error`; the crate surface classifies
/// them via [`crate::error::Error::engine`].
pub type EngineResult<T> = Result<T, anyhow::Error>;

/// Index name every engine reserves for the primary-key index.
pub const PRIMARY_KEY_INDEX: &str = "_id_";

/// Cursor options accompanying a find call.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
  /// Ordered `{column: 1|-1}` document.
  pub sort: Option<Value>,
  pub skip: Option<i64>,
  pub limit: Option<i64>,
  /// Columns to project; empty means all.
  pub projection: Vec<String>,
}

/// Index definition handed to `create_index`.
#[derive(Debug, Clone)]
pub struct IndexSpec {
  pub name: String,
  /// Column and direction pairs, in declaration order.
  pub columns: Vec<(String, i64)>,
  pub unique: bool,
}

/// Abstract document engine.
///
/// The core treats the engine as an opaque collaborator; every method
/// is a suspension point and cancellation propagates by dropping the
/// returned future. `session` identifies an open [`EngineSession`]
/// when the call runs inside a transaction.
#[async_trait]
pub trait DocumentEngine: Send + Sync {
  async fn find_many(
    &self,
    session: Option<Uuid>,
    collection: &str,
    filter: &Value,
    options: &FindOptions,
  ) -> EngineResult<Vec<Value>>;

  async fn find_one(
    &self,
    session: Option<Uuid>,
    collection: &str,
    filter: &Value,
    options: &FindOptions,
  ) -> EngineResult<Option<Value>>;

  async fn insert_many(
    &self,
    session: Option<Uuid>,
    collection: &str,
    documents: &[Value],
  ) -> EngineResult<u64>;

  async fn update_many(
    &self,
    session: Option<Uuid>,
    collection: &str,
    filter: &Value,
    update: &Value,
  ) -> EngineResult<u64>;

  async fn delete_many(
    &self,
    session: Option<Uuid>,
    collection: &str,
    filter: &Value,
  ) -> EngineResult<u64>;

  async fn aggregate(
    &self,
    session: Option<Uuid>,
    collection: &str,
    pipeline: &[Value],
  ) -> EngineResult<Vec<Value>>;

  /// Atomic read-modify-write returning the post-image. Runs outside
  /// any session; sequence allocation depends on this being a single
  /// engine-side step.
  async fn find_one_and_update(
    &self,
    collection: &str,
    filter: &Value,
    update: &Value,
    upsert: bool,
  ) -> EngineResult<Option<Value>>;

  async fn create_collection(&self, name: &str) -> EngineResult<()>;

  async fn create_index(&self, collection: &str, index: &IndexSpec) -> EngineResult<()>;

  async fn list_indexes(&self, collection: &str) -> EngineResult<Vec<String>>;

  async fn list_collections(&self) -> EngineResult<Vec<String>>;

  async fn drop_collection(&self, name: &str) -> EngineResult<()>;

  async fn begin_session(&self) -> EngineResult<Box<dyn EngineSession>>;

  async fn disconnect(&self) -> EngineResult<()>;
}

/// An engine-side transaction context. Finalized exactly once by the
/// owning transaction.
#[async_trait]
pub trait EngineSession: Send + Sync {
  fn id(&self) -> Uuid;

  async fn commit(&self) -> EngineResult<()>;

  async fn abort(&self) -> EngineResult<()>;
}
