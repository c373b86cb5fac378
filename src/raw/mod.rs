use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::engine::{DocumentEngine, FindOptions};
use crate::error::{Error, Result};
use crate::mapper::FieldMapper;
use crate::query::WriteResult;
use crate::sql::{parse, Statement};
use crate::translate::{SqlTranslator, SUBQUERY_MARKER};
use crate::types::{Command, Operation};

/// Shared cache of parsed statements, keyed by SQL text.
pub type StatementCache = Arc<Mutex<LruCache<String, Statement>>>;

pub fn new_statement_cache() -> StatementCache {
  Arc::new(Mutex::new(LruCache::new(NonZeroUsize::new(1024).unwrap())))
}

/// Executes raw command strings: SQL or a JSON command document.
///
/// Results keep their storage column names; callers asking for raw
/// access see exactly what their statement requested.
pub struct RawExecutor<'a> {
  mapper: &'a FieldMapper,
  engine: Arc<dyn DocumentEngine>,
  session: Option<Uuid>,
  cache: StatementCache,
}

impl<'a> RawExecutor<'a> {
  pub fn new(
    mapper: &'a FieldMapper,
    engine: Arc<dyn DocumentEngine>,
    session: Option<Uuid>,
    cache: StatementCache,
  ) -> Self {
    Self { mapper, engine, session, cache }
  }

  /// A trimmed input wrapped in braces is a JSON command; anything
  /// else is SQL.
  pub fn is_json_command(input: &str) -> bool {
    let trimmed = input.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
  }

  /// Run a write statement.
  pub async fn exec(&self, input: &str, args: &[Value]) -> Result<WriteResult> {
    let command = self.compile(input, args).await?;
    match command.operation {
      Operation::Insert => {
        let documents = command.documents.clone().unwrap_or_default();
        let inserted = self
          .engine
          .insert_many(self.session, &command.collection, &documents)
          .await
          .map_err(Error::engine)?;
        Ok(WriteResult { rows_affected: inserted, last_insert_id: command.last_insert_id })
      }
      Operation::Update => {
        let filter = command.filter.clone().unwrap_or_else(|| json!({}));
        let update = command
          .update
          .clone()
          .ok_or_else(|| Error::validation("update command requires an update document"))?;
        let modified = self
          .engine
          .update_many(self.session, &command.collection, &filter, &update)
          .await
          .map_err(Error::engine)?;
        Ok(WriteResult { rows_affected: modified, last_insert_id: None })
      }
      Operation::Delete => {
        let filter = command.filter.clone().unwrap_or_else(|| json!({}));
        let deleted = self
          .engine
          .delete_many(self.session, &command.collection, &filter)
          .await
          .map_err(Error::engine)?;
        Ok(WriteResult { rows_affected: deleted, last_insert_id: None })
      }
      Operation::Find | Operation::Aggregate => {
        Err(Error::validation("exec expects a write statement; use find for reads"))
      }
    }
  }

  /// Run a read statement and decode every document.
  pub async fn find<T: DeserializeOwned>(&self, input: &str, args: &[Value]) -> Result<Vec<T>> {
    let command = self.compile(input, args).await?;
    let rows = self.run_read(&command).await?;
    rows
      .into_iter()
      .map(|row| {
        serde_json::from_value(normalize(row))
          .map_err(|e| Error::validation(format!("result decode: {e}")))
      })
      .collect()
  }

  /// Run a read statement and decode the first document. Scalar
  /// destinations take the first value of the first document.
  pub async fn find_one<T: DeserializeOwned>(&self, input: &str, args: &[Value]) -> Result<T> {
    let command = self.compile(input, args).await?;
    let rows = self.run_read(&command).await?;
    let row = normalize(rows.into_iter().next().ok_or(Error::NotFound)?);

    match serde_json::from_value::<T>(row.clone()) {
      Ok(decoded) => Ok(decoded),
      Err(whole_err) => {
        let scalar = row
          .as_object()
          .and_then(|o| o.values().next())
          .cloned()
          .ok_or_else(|| Error::validation(format!("result decode: {whole_err}")))?;
        serde_json::from_value(scalar).map_err(|e| Error::validation(format!("result decode: {e}")))
      }
    }
  }

  /// Parse (or hit the cache), translate, and resolve subquery
  /// markers into concrete IN/NIN filters.
  async fn compile(&self, input: &str, args: &[Value]) -> Result<Command> {
    let mut command = if Self::is_json_command(input) {
      if !args.is_empty() {
        return Err(Error::parameter("JSON commands take no positional arguments"));
      }
      Command::from_json(input)?
    } else {
      let statement = self.parse_cached(input)?;
      let translator = SqlTranslator::new(self.mapper);
      translator.translate(&statement, args).await?
    };
    self.resolve_subqueries(&mut command).await?;
    command.validate()?;
    Ok(command)
  }

  fn parse_cached(&self, input: &str) -> Result<Statement> {
    if let Some(statement) = self.cache.lock().get(input) {
      return Ok(statement.clone());
    }
    let statement = parse(input)?;
    self.cache.lock().put(input.to_string(), statement.clone());
    Ok(statement)
  }

  async fn run_read(&self, command: &Command) -> Result<Vec<Value>> {
    match command.operation {
      Operation::Find => {
        let filter = command.filter.clone().unwrap_or_else(|| json!({}));
        let options = FindOptions {
          sort: command.options.as_ref().and_then(|o| o.sort.clone()),
          skip: command.options.as_ref().and_then(|o| o.skip),
          limit: command.options.as_ref().and_then(|o| o.limit),
          projection: command.fields.clone().unwrap_or_default(),
        };
        self
          .engine
          .find_many(self.session, &command.collection, &filter, &options)
          .await
          .map_err(Error::engine)
      }
      Operation::Aggregate => {
        let pipeline = command.pipeline.clone().unwrap_or_default();
        self
          .engine
          .aggregate(self.session, &command.collection, &pipeline)
          .await
          .map_err(Error::engine)
      }
      _ => Err(Error::validation("find expects a read statement")),
    }
  }

  /// Second pass: each subquery marker runs its embedded command and
  /// collapses to `{in|nin: [distinct values]}`.
  async fn resolve_subqueries(&self, command: &mut Command) -> Result<()> {
    if let Some(filter) = command.filter.as_mut() {
      self.resolve_markers(filter).await?;
    }
    if let Some(pipeline) = command.pipeline.as_mut() {
      for stage in pipeline.iter_mut() {
        self.resolve_markers(stage).await?;
      }
    }
    Ok(())
  }

  fn resolve_markers<'b>(
    &'b self,
    value: &'b mut Value,
  ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'b>> {
    Box::pin(async move {
      match value {
        Value::Object(map) => {
          for (_, entry) in map.iter_mut() {
            if let Some(marker) = entry.get(SUBQUERY_MARKER).cloned() {
              *entry = self.execute_marker(&marker).await?;
            } else {
              self.resolve_markers(entry).await?;
            }
          }
          Ok(())
        }
        Value::Array(items) => {
          for item in items.iter_mut() {
            self.resolve_markers(item).await?;
          }
          Ok(())
        }
        _ => Ok(()),
      }
    })
  }

  async fn execute_marker(&self, marker: &Value) -> Result<Value> {
    let inner: Command = serde_json::from_value(
      marker
        .get("command")
        .cloned()
        .ok_or_else(|| Error::internal("subquery marker without command"))?,
    )
    .map_err(|e| Error::internal(format!("subquery marker decode: {e}")))?;
    let column = marker
      .get("column")
      .and_then(Value::as_str)
      .ok_or_else(|| Error::internal("subquery marker without column"))?;
    let negated = marker.get("negated").and_then(Value::as_bool).unwrap_or(false);

    let rows = self.run_read(&inner).await?;
    let mut values: Vec<Value> = Vec::new();
    for row in rows {
      if let Some(v) = row.get(column) {
        if !values.contains(v) {
          values.push(v.clone());
        }
      }
    }
    let op = if negated { "nin" } else { "in" };
    Ok(json!({ op: values }))
  }
}

/// Flatten engine-specific value encodings into portable JSON: wire
/// dates collapse to RFC 3339 strings, containers normalize
/// recursively.
pub fn normalize(value: Value) -> Value {
  match value {
    Value::Object(map) => {
      if map.len() == 1 {
        if let Some(ms) = map.get("$date").and_then(Value::as_i64) {
          if let Some(ts) = chrono::DateTime::from_timestamp_millis(ms) {
            return Value::String(ts.to_rfc3339());
          }
        }
      }
      let mut out = Map::new();
      for (k, v) in map {
        out.insert(k, normalize(v));
      }
      Value::Object(out)
    }
    Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn json_detection() {
    assert!(RawExecutor::is_json_command(r#"{"operation": "find", "collection": "users"}"#));
    assert!(RawExecutor::is_json_command("  { }  "));
    assert!(!RawExecutor::is_json_command("SELECT * FROM users"));
  }

  #[test]
  fn date_normalization() {
    let value = json!({"created_at": {"$date": 0}, "tags": [{"$date": 86400000}]});
    let normalized = normalize(value);
    assert_eq!(
      normalized["created_at"].as_str().unwrap(),
      "1970-01-01T00:00:00+00:00"
    );
    assert!(normalized["tags"][0].as_str().unwrap().starts_with("1970-01-02"));
  }
}
