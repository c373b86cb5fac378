use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{
  DocumentEngine, EngineResult, EngineSession, FindOptions, IndexSpec, PRIMARY_KEY_INDEX,
};

type Dataset = HashMap<String, Vec<Value>>;

struct SessionState {
  snapshot: Dataset,
  /// Collections this session has written; only these publish on
  /// commit, so state written outside the session (sequences) is not
  /// clobbered.
  touched: HashSet<String>,
}

#[derive(Default)]
struct Shared {
  data: RwLock<Dataset>,
  sessions: RwLock<HashMap<Uuid, SessionState>>,
  indexes: RwLock<HashMap<String, Vec<IndexSpec>>>,
}

/// In-process reference engine.
///
/// Executes commands against collections held in memory. Sessions take
/// a snapshot on begin; commit publishes the snapshot, abort discards
/// it. Concurrent committers are serialized by the data lock, last
/// commit wins.
#[derive(Clone, Default)]
pub struct MemoryEngine {
  shared: Arc<Shared>,
}

impl MemoryEngine {
  pub fn new() -> Self {
    Self::default()
  }

  /// Dataset the call should see: a session snapshot when one is in
  /// scope, the shared data otherwise.
  fn view(&self, session: Option<Uuid>) -> EngineResult<Dataset> {
    match session {
      Some(id) => self
        .shared
        .sessions
        .read()
        .get(&id)
        .map(|s| s.snapshot.clone())
        .ok_or_else(|| anyhow!("unknown session: {id}")),
      None => Ok(self.shared.data.read().clone()),
    }
  }

  fn write_back(&self, session: Option<Uuid>, dataset: Dataset, collection: &str) -> EngineResult<()> {
    match session {
      Some(id) => {
        let mut sessions = self.shared.sessions.write();
        match sessions.get_mut(&id) {
          Some(state) => {
            state.snapshot = dataset;
            state.touched.insert(collection.to_string());
            Ok(())
          }
          None => Err(anyhow!("unknown session: {id}")),
        }
      }
      None => {
        *self.shared.data.write() = dataset;
        Ok(())
      }
    }
  }

  fn check_unique(&self, collection: &str, existing: &[Value], incoming: &Value) -> EngineResult<()> {
    if let Some(id) = incoming.get("_id") {
      if !id.is_null() && existing.iter().any(|d| d.get("_id").is_some_and(|v| values_eq(v, id))) {
        bail!("duplicate key: _id in {collection}");
      }
    }
    let indexes = self.shared.indexes.read();
    if let Some(specs) = indexes.get(collection) {
      for spec in specs.iter().filter(|s| s.unique && s.columns.len() == 1) {
        let column = &spec.columns[0].0;
        let Some(value) = incoming.get(column) else { continue };
        if value.is_null() {
          continue;
        }
        if existing.iter().any(|d| d.get(column).is_some_and(|v| values_eq(v, value))) {
          bail!("unique constraint violated: {}", spec.name);
        }
      }
    }
    Ok(())
  }
}

#[async_trait]
impl DocumentEngine for MemoryEngine {
  async fn find_many(
    &self,
    session: Option<Uuid>,
    collection: &str,
    filter: &Value,
    options: &FindOptions,
  ) -> EngineResult<Vec<Value>> {
    let dataset = self.view(session)?;
    let docs = dataset.get(collection).cloned().unwrap_or_default();
    let mut out: Vec<Value> = docs.into_iter().filter(|d| matches_filter(d, filter, &NO_VARS)).collect();
    if let Some(sort) = &options.sort {
      sort_docs(&mut out, sort);
    }
    if let Some(skip) = options.skip {
      out = out.into_iter().skip(skip.max(0) as usize).collect();
    }
    if let Some(limit) = options.limit {
      out.truncate(limit.max(0) as usize);
    }
    if !options.projection.is_empty() {
      out = out
        .into_iter()
        .map(|d| project_columns(&d, &options.projection))
        .collect();
    }
    Ok(out)
  }

  async fn find_one(
    &self,
    session: Option<Uuid>,
    collection: &str,
    filter: &Value,
    options: &FindOptions,
  ) -> EngineResult<Option<Value>> {
    let mut opts = options.clone();
    opts.limit = Some(1);
    Ok(self.find_many(session, collection, filter, &opts).await?.into_iter().next())
  }

  async fn insert_many(
    &self,
    session: Option<Uuid>,
    collection: &str,
    documents: &[Value],
  ) -> EngineResult<u64> {
    let mut dataset = self.view(session)?;
    let existing = dataset.entry(collection.to_string()).or_default();
    for doc in documents {
      self.check_unique(collection, existing, doc)?;
      existing.push(doc.clone());
    }
    let inserted = documents.len() as u64;
    self.write_back(session, dataset, collection)?;
    Ok(inserted)
  }

  async fn update_many(
    &self,
    session: Option<Uuid>,
    collection: &str,
    filter: &Value,
    update: &Value,
  ) -> EngineResult<u64> {
    let mut dataset = self.view(session)?;
    let mut modified = 0u64;
    if let Some(docs) = dataset.get_mut(collection) {
      for doc in docs.iter_mut() {
        if matches_filter(doc, filter, &NO_VARS) {
          apply_update(doc, update)?;
          modified += 1;
        }
      }
    }
    self.write_back(session, dataset, collection)?;
    Ok(modified)
  }

  async fn delete_many(
    &self,
    session: Option<Uuid>,
    collection: &str,
    filter: &Value,
  ) -> EngineResult<u64> {
    let mut dataset = self.view(session)?;
    let mut deleted = 0u64;
    if let Some(docs) = dataset.get_mut(collection) {
      let before = docs.len();
      docs.retain(|d| !matches_filter(d, filter, &NO_VARS));
      deleted = (before - docs.len()) as u64;
    }
    self.write_back(session, dataset, collection)?;
    Ok(deleted)
  }

  async fn aggregate(
    &self,
    session: Option<Uuid>,
    collection: &str,
    pipeline: &[Value],
  ) -> EngineResult<Vec<Value>> {
    let dataset = self.view(session)?;
    let docs = dataset.get(collection).cloned().unwrap_or_default();
    run_pipeline(&dataset, docs, pipeline, &NO_VARS)
  }

  async fn find_one_and_update(
    &self,
    collection: &str,
    filter: &Value,
    update: &Value,
    upsert: bool,
  ) -> EngineResult<Option<Value>> {
    // Single critical section; concurrent callers serialize here.
    let mut data = self.shared.data.write();
    let docs = data.entry(collection.to_string()).or_default();
    if let Some(doc) = docs.iter_mut().find(|d| matches_filter(d, filter, &NO_VARS)) {
      apply_update(doc, update)?;
      return Ok(Some(doc.clone()));
    }
    if !upsert {
      return Ok(None);
    }
    // Seed the new document from the filter's equality fields.
    let mut doc = Value::Object(Map::new());
    if let Some(obj) = filter.as_object() {
      for (k, v) in obj {
        if !v.is_object() && !is_logical_key(k) {
          doc[k.as_str()] = v.clone();
        }
      }
    }
    apply_update(&mut doc, update)?;
    docs.push(doc.clone());
    Ok(Some(doc))
  }

  async fn create_collection(&self, name: &str) -> EngineResult<()> {
    let mut data = self.shared.data.write();
    if data.contains_key(name) {
      bail!("collection already exists: {name}");
    }
    data.insert(name.to_string(), Vec::new());
    Ok(())
  }

  async fn create_index(&self, collection: &str, index: &IndexSpec) -> EngineResult<()> {
    let mut indexes = self.shared.indexes.write();
    let entry = indexes.entry(collection.to_string()).or_default();
    if entry.iter().any(|s| s.name == index.name) {
      bail!("index already exists: {}", index.name);
    }
    entry.push(index.clone());
    Ok(())
  }

  async fn list_indexes(&self, collection: &str) -> EngineResult<Vec<String>> {
    let mut names = vec![PRIMARY_KEY_INDEX.to_string()];
    if let Some(specs) = self.shared.indexes.read().get(collection) {
      names.extend(specs.iter().map(|s| s.name.clone()));
    }
    Ok(names)
  }

  async fn list_collections(&self) -> EngineResult<Vec<String>> {
    let mut names: Vec<String> = self.shared.data.read().keys().cloned().collect();
    names.sort();
    Ok(names)
  }

  async fn drop_collection(&self, name: &str) -> EngineResult<()> {
    self.shared.data.write().remove(name);
    self.shared.indexes.write().remove(name);
    Ok(())
  }

  async fn begin_session(&self) -> EngineResult<Box<dyn EngineSession>> {
    let id = Uuid::new_v4();
    let snapshot = self.shared.data.read().clone();
    self.shared.sessions.write().insert(
      id,
      SessionState { snapshot, touched: HashSet::new() },
    );
    Ok(Box::new(MemorySession {
      id,
      shared: self.shared.clone(),
    }))
  }

  async fn disconnect(&self) -> EngineResult<()> {
    self.shared.sessions.write().clear();
    Ok(())
  }
}

struct MemorySession {
  id: Uuid,
  shared: Arc<Shared>,
}

#[async_trait]
impl EngineSession for MemorySession {
  fn id(&self) -> Uuid {
    self.id
  }

  async fn commit(&self) -> EngineResult<()> {
    let state = self
      .shared
      .sessions
      .write()
      .remove(&self.id)
      .ok_or_else(|| anyhow!("session already finalized: {}", self.id))?;
    // Publish only collections this session wrote; everything else
    // keeps whatever happened outside the session in the meantime.
    let mut data = self.shared.data.write();
    for collection in state.touched {
      match state.snapshot.get(&collection) {
        Some(docs) => {
          data.insert(collection, docs.clone());
        }
        None => {
          data.remove(&collection);
        }
      }
    }
    Ok(())
  }

  async fn abort(&self) -> EngineResult<()> {
    self
      .shared
      .sessions
      .write()
      .remove(&self.id)
      .ok_or_else(|| anyhow!("session already finalized: {}", self.id))?;
    Ok(())
  }
}

type Vars = HashMap<String, Value>;

static NO_VARS: std::sync::LazyLock<Vars> = std::sync::LazyLock::new(HashMap::new);

const OPERATOR_KEYS: &[&str] = &["ne", "gt", "gte", "lt", "lte", "in", "nin", "regex", "options", "exists"];

fn is_logical_key(key: &str) -> bool {
  matches!(key, "and" | "or" | "nor" | "expr")
}

/// Fetch a possibly dotted path from a document.
fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
  let mut current = doc;
  for part in path.split('.') {
    current = current.as_object()?.get(part)?;
  }
  Some(current)
}

/// Numeric-aware equality: 1 and 1.0 compare equal.
fn values_eq(a: &Value, b: &Value) -> bool {
  match (a.as_f64(), b.as_f64()) {
    (Some(x), Some(y)) => x == y,
    _ => a == b,
  }
}

fn type_rank(v: &Value) -> u8 {
  match v {
    Value::Null => 0,
    Value::Number(_) => 1,
    Value::String(_) => 2,
    Value::Bool(_) => 3,
    Value::Array(_) => 4,
    Value::Object(_) => 5,
  }
}

fn json_cmp(a: &Value, b: &Value) -> Ordering {
  let (ra, rb) = (type_rank(a), type_rank(b));
  if ra != rb {
    return ra.cmp(&rb);
  }
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x
      .as_f64()
      .partial_cmp(&y.as_f64())
      .unwrap_or(Ordering::Equal),
    (Value::String(x), Value::String(y)) => x.cmp(y),
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    _ => Ordering::Equal,
  }
}

fn is_truthy(v: &Value) -> bool {
  match v {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64() != Some(0.0),
    _ => true,
  }
}

/// Evaluate a single field condition: a bare value is equality, an
/// object of operator keys applies each operator.
fn matches_field(doc: &Value, column: &str, condition: &Value) -> bool {
  let actual = get_path(doc, column);
  let op_obj = condition
    .as_object()
    .filter(|o| !o.is_empty() && o.keys().all(|k| OPERATOR_KEYS.contains(&k.as_str())));

  let Some(ops) = op_obj else {
    // Equality. Null matches both explicit null and a missing field.
    return match actual {
      Some(v) => values_eq(v, condition),
      None => condition.is_null(),
    };
  };

  for (op, operand) in ops {
    let ok = match op.as_str() {
      "ne" => match actual {
        Some(v) => !values_eq(v, operand),
        None => !operand.is_null(),
      },
      "gt" => actual.is_some_and(|v| comparable(v, operand) && json_cmp(v, operand) == Ordering::Greater),
      "gte" => actual.is_some_and(|v| comparable(v, operand) && json_cmp(v, operand) != Ordering::Less),
      "lt" => actual.is_some_and(|v| comparable(v, operand) && json_cmp(v, operand) == Ordering::Less),
      "lte" => actual.is_some_and(|v| comparable(v, operand) && json_cmp(v, operand) != Ordering::Greater),
      "in" => actual.is_some_and(|v| {
        operand.as_array().is_some_and(|arr| arr.iter().any(|x| values_eq(x, v)))
      }),
      "nin" => !actual.is_some_and(|v| {
        operand.as_array().is_some_and(|arr| arr.iter().any(|x| values_eq(x, v)))
      }),
      "regex" => {
        let case_insensitive = ops.get("options").and_then(Value::as_str).is_some_and(|o| o.contains('i'));
        match (actual.and_then(Value::as_str), operand.as_str()) {
          (Some(text), Some(pattern)) => {
            let pattern = if case_insensitive {
              format!("(?i){pattern}")
            } else {
              pattern.to_string()
            };
            regex::Regex::new(&pattern).map(|re| re.is_match(text)).unwrap_or(false)
          }
          _ => false,
        }
      }
      // Parsed together with regex above.
      "options" => true,
      "exists" => {
        let want = operand.as_bool().unwrap_or(true);
        actual.is_some() == want
      }
      _ => false,
    };
    if !ok {
      return false;
    }
  }
  true
}

fn comparable(a: &Value, b: &Value) -> bool {
  !a.is_null() && !b.is_null() && type_rank(a) == type_rank(b)
}

/// Top-level filter matcher with logical composition.
fn matches_filter(doc: &Value, filter: &Value, vars: &Vars) -> bool {
  let Some(obj) = filter.as_object() else {
    return true;
  };
  for (key, condition) in obj {
    let ok = match key.as_str() {
      "and" => condition
        .as_array()
        .is_some_and(|arr| arr.iter().all(|f| matches_filter(doc, f, vars))),
      "or" => condition
        .as_array()
        .is_some_and(|arr| arr.iter().any(|f| matches_filter(doc, f, vars))),
      "nor" => condition
        .as_array()
        .is_some_and(|arr| !arr.iter().any(|f| matches_filter(doc, f, vars))),
      "expr" => eval_expr(doc, condition, vars).map(|v| is_truthy(&v)).unwrap_or(false),
      _ => matches_field(doc, key, condition),
    };
    if !ok {
      return false;
    }
  }
  true
}

const EXPR_OPS: &[&str] = &["cond", "eq", "ne", "gt", "gte", "lt", "lte", "in", "ifNull"];

/// Evaluate an aggregation expression against one document.
///
/// `"$path"` reads the document, `"$$name"` reads a bound variable,
/// single-key objects from the operator set compute, everything else
/// is literal (objects map their values recursively).
fn eval_expr(doc: &Value, expr: &Value, vars: &Vars) -> EngineResult<Value> {
  match expr {
    Value::String(s) => {
      if let Some(name) = s.strip_prefix("$$") {
        Ok(vars.get(name).cloned().unwrap_or(Value::Null))
      } else if let Some(path) = s.strip_prefix('$') {
        Ok(get_path(doc, path).cloned().unwrap_or(Value::Null))
      } else {
        Ok(expr.clone())
      }
    }
    Value::Array(items) => {
      let evaluated: EngineResult<Vec<Value>> =
        items.iter().map(|e| eval_expr(doc, e, vars)).collect();
      Ok(Value::Array(evaluated?))
    }
    Value::Object(obj) if obj.len() == 1 => {
      let (op, operand) = obj.iter().next().unwrap();
      if EXPR_OPS.contains(&op.as_str()) {
        eval_operator(doc, op, operand, vars)
      } else {
        eval_object(doc, obj, vars)
      }
    }
    Value::Object(obj) => eval_object(doc, obj, vars),
    other => Ok(other.clone()),
  }
}

fn eval_object(doc: &Value, obj: &Map<String, Value>, vars: &Vars) -> EngineResult<Value> {
  let mut out = Map::new();
  for (k, v) in obj {
    out.insert(k.clone(), eval_expr(doc, v, vars)?);
  }
  Ok(Value::Object(out))
}

fn eval_operator(doc: &Value, op: &str, operand: &Value, vars: &Vars) -> EngineResult<Value> {
  let args = operand
    .as_array()
    .ok_or_else(|| anyhow!("expression operator {op} requires an argument array"))?;
  match op {
    "cond" => {
      if args.len() != 3 {
        bail!("cond requires [if, then, else]");
      }
      let test = eval_expr(doc, &args[0], vars)?;
      if is_truthy(&test) {
        eval_expr(doc, &args[1], vars)
      } else {
        eval_expr(doc, &args[2], vars)
      }
    }
    "ifNull" => {
      if args.len() != 2 {
        bail!("ifNull requires [value, fallback]");
      }
      let value = eval_expr(doc, &args[0], vars)?;
      if value.is_null() {
        eval_expr(doc, &args[1], vars)
      } else {
        Ok(value)
      }
    }
    "in" => {
      if args.len() != 2 {
        bail!("in requires [needle, haystack]");
      }
      let needle = eval_expr(doc, &args[0], vars)?;
      let haystack = eval_expr(doc, &args[1], vars)?;
      let found = haystack
        .as_array()
        .is_some_and(|arr| arr.iter().any(|x| values_eq(x, &needle)));
      Ok(Value::Bool(found))
    }
    cmp => {
      if args.len() != 2 {
        bail!("{cmp} requires two operands");
      }
      let lhs = eval_expr(doc, &args[0], vars)?;
      let rhs = eval_expr(doc, &args[1], vars)?;
      let result = match cmp {
        "eq" => values_eq(&lhs, &rhs),
        "ne" => !values_eq(&lhs, &rhs),
        "gt" => comparable(&lhs, &rhs) && json_cmp(&lhs, &rhs) == Ordering::Greater,
        "gte" => comparable(&lhs, &rhs) && json_cmp(&lhs, &rhs) != Ordering::Less,
        "lt" => comparable(&lhs, &rhs) && json_cmp(&lhs, &rhs) == Ordering::Less,
        "lte" => comparable(&lhs, &rhs) && json_cmp(&lhs, &rhs) != Ordering::Greater,
        other => bail!("unknown expression operator: {other}"),
      };
      Ok(Value::Bool(result))
    }
  }
}

/// Execute a pipeline over `docs`, with `dataset` in scope for lookup
/// stages and `vars` bound for nested pipelines.
fn run_pipeline(
  dataset: &Dataset,
  mut docs: Vec<Value>,
  pipeline: &[Value],
  vars: &Vars,
) -> EngineResult<Vec<Value>> {
  for stage in pipeline {
    let obj = stage
      .as_object()
      .filter(|o| o.len() == 1)
      .ok_or_else(|| anyhow!("malformed pipeline stage: {stage}"))?;
    let (name, spec) = obj.iter().next().unwrap();
    docs = match name.as_str() {
      "match" => docs
        .into_iter()
        .filter(|d| matches_filter(d, spec, vars))
        .collect(),
      "lookup" => exec_lookup(dataset, docs, spec, vars)?,
      "unwind" => exec_unwind(docs, spec)?,
      "group" => exec_group(docs, spec, vars)?,
      "sort" => {
        sort_docs(&mut docs, spec);
        docs
      }
      "skip" => {
        let n = spec.as_i64().unwrap_or(0).max(0) as usize;
        docs.into_iter().skip(n).collect()
      }
      "limit" => {
        let n = spec.as_i64().unwrap_or(0).max(0) as usize;
        docs.truncate(n);
        docs
      }
      "project" => {
        let result: EngineResult<Vec<Value>> =
          docs.iter().map(|d| exec_project(d, spec, vars)).collect();
        result?
      }
      "count" => {
        let field = spec.as_str().ok_or_else(|| anyhow!("count requires a field name"))?;
        vec![json!({ field: docs.len() })]
      }
      "replaceRoot" => {
        let new_root = spec
          .get("newRoot")
          .ok_or_else(|| anyhow!("replaceRoot requires newRoot"))?;
        let result: EngineResult<Vec<Value>> = docs
          .iter()
          .map(|d| eval_expr(d, new_root, vars))
          .collect();
        result?
      }
      other => bail!("unknown pipeline stage: {other}"),
    };
  }
  Ok(docs)
}

fn exec_lookup(
  dataset: &Dataset,
  docs: Vec<Value>,
  spec: &Value,
  vars: &Vars,
) -> EngineResult<Vec<Value>> {
  let from = spec
    .get("from")
    .and_then(Value::as_str)
    .ok_or_else(|| anyhow!("lookup requires from"))?;
  let as_field = spec
    .get("as")
    .and_then(Value::as_str)
    .ok_or_else(|| anyhow!("lookup requires as"))?;
  let foreign = dataset.get(from).cloned().unwrap_or_default();

  let mut out = Vec::with_capacity(docs.len());
  for mut doc in docs {
    let joined: Vec<Value> = if let Some(pipeline) = spec.get("pipeline").and_then(Value::as_array) {
      // Bind let-variables against the outer document, then run the
      // inner pipeline over the foreign collection.
      let mut bound = vars.clone();
      if let Some(lets) = spec.get("let").and_then(Value::as_object) {
        for (name, expr) in lets {
          bound.insert(name.clone(), eval_expr(&doc, expr, vars)?);
        }
      }
      run_pipeline(dataset, foreign.clone(), pipeline, &bound)?
    } else {
      let local_field = spec
        .get("localField")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("lookup requires localField or pipeline"))?;
      let foreign_field = spec
        .get("foreignField")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("lookup requires foreignField"))?;
      let local = get_path(&doc, local_field).cloned().unwrap_or(Value::Null);
      foreign
        .iter()
        .filter(|fd| {
          let fv = get_path(fd, foreign_field).cloned().unwrap_or(Value::Null);
          values_eq(&fv, &local)
        })
        .cloned()
        .collect()
    };
    if let Some(obj) = doc.as_object_mut() {
      obj.insert(as_field.to_string(), Value::Array(joined));
    }
    out.push(doc);
  }
  Ok(out)
}

fn exec_unwind(docs: Vec<Value>, spec: &Value) -> EngineResult<Vec<Value>> {
  let (path, preserve) = match spec {
    Value::String(s) => (s.clone(), false),
    Value::Object(o) => {
      let path = o
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("unwind requires path"))?
        .to_string();
      let preserve = o
        .get("preserveNullAndEmptyArrays")
        .and_then(Value::as_bool)
        .unwrap_or(false);
      (path, preserve)
    }
    _ => bail!("malformed unwind stage"),
  };
  let field = path.trim_start_matches('$').to_string();

  let mut out = Vec::with_capacity(docs.len());
  for mut doc in docs {
    match doc.get(&field).cloned() {
      Some(Value::Array(items)) if !items.is_empty() => {
        for item in items {
          let mut copy = doc.clone();
          copy[field.as_str()] = item;
          out.push(copy);
        }
      }
      Some(Value::Array(_)) | Some(Value::Null) | None => {
        if preserve {
          if let Some(obj) = doc.as_object_mut() {
            obj.remove(&field);
          }
          out.push(doc);
        }
      }
      Some(single) => {
        doc[field.as_str()] = single;
        out.push(doc);
      }
    }
  }
  Ok(out)
}

fn exec_group(docs: Vec<Value>, spec: &Value, vars: &Vars) -> EngineResult<Vec<Value>> {
  let spec_obj = spec.as_object().ok_or_else(|| anyhow!("malformed group stage"))?;
  let id_expr = spec_obj.get("_id").ok_or_else(|| anyhow!("group requires _id"))?;

  // Buckets keep first-seen order.
  let mut buckets: Vec<(Value, Vec<Value>)> = Vec::new();
  for doc in docs {
    let key = eval_expr(&doc, id_expr, vars)?;
    match buckets.iter_mut().find(|(k, _)| *k == key) {
      Some((_, members)) => members.push(doc),
      None => buckets.push((key, vec![doc])),
    }
  }

  let mut out = Vec::with_capacity(buckets.len());
  for (key, members) in buckets {
    let mut row = Map::new();
    row.insert("_id".to_string(), key);
    for (alias, acc) in spec_obj.iter().filter(|(k, _)| *k != "_id") {
      let acc_obj = acc
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| anyhow!("malformed accumulator for {alias}"))?;
      let (op, expr) = acc_obj.iter().next().unwrap();
      row.insert(alias.clone(), accumulate(op, expr, &members, vars)?);
    }
    out.push(Value::Object(row));
  }
  Ok(out)
}

fn accumulate(op: &str, expr: &Value, members: &[Value], vars: &Vars) -> EngineResult<Value> {
  match op {
    "sum" => {
      let mut total = 0f64;
      let mut all_int = true;
      for doc in members {
        let v = eval_expr(doc, expr, vars)?;
        if let Some(n) = v.as_f64() {
          all_int &= v.as_i64().is_some();
          total += n;
        }
      }
      Ok(number(total, all_int))
    }
    "avg" => {
      let mut total = 0f64;
      let mut count = 0usize;
      for doc in members {
        if let Some(n) = eval_expr(doc, expr, vars)?.as_f64() {
          total += n;
          count += 1;
        }
      }
      if count == 0 {
        Ok(Value::Null)
      } else {
        Ok(number(total / count as f64, false))
      }
    }
    "min" | "max" => {
      let mut extreme: Option<Value> = None;
      for doc in members {
        let v = eval_expr(doc, expr, vars)?;
        if v.is_null() {
          continue;
        }
        extreme = Some(match extreme {
          None => v,
          Some(cur) => {
            let keep_new = if op == "min" {
              json_cmp(&v, &cur) == Ordering::Less
            } else {
              json_cmp(&v, &cur) == Ordering::Greater
            };
            if keep_new {
              v
            } else {
              cur
            }
          }
        });
      }
      Ok(extreme.unwrap_or(Value::Null))
    }
    "first" => match members.first() {
      Some(doc) => eval_expr(doc, expr, vars),
      None => Ok(Value::Null),
    },
    "push" => {
      let collected: EngineResult<Vec<Value>> =
        members.iter().map(|d| eval_expr(d, expr, vars)).collect();
      Ok(Value::Array(collected?))
    }
    other => bail!("unknown accumulator: {other}"),
  }
}

fn number(value: f64, prefer_int: bool) -> Value {
  if prefer_int && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
    json!(value as i64)
  } else {
    json!(value)
  }
}

fn exec_project(doc: &Value, spec: &Value, vars: &Vars) -> EngineResult<Value> {
  let spec_obj = spec.as_object().ok_or_else(|| anyhow!("malformed project stage"))?;

  let has_inclusion = spec_obj
    .iter()
    .any(|(k, v)| k != "_id" && !matches!(v, Value::Number(n) if n.as_i64() == Some(0)));

  if has_inclusion {
    let mut out = Map::new();
    let id_excluded = spec_obj.get("_id").and_then(Value::as_i64) == Some(0);
    if !id_excluded {
      if let Some(id) = doc.get("_id") {
        out.insert("_id".to_string(), id.clone());
      }
    }
    for (key, v) in spec_obj {
      if key == "_id" {
        // Explicit `_id: "$expr"` renames below; `_id: 1` was handled.
        if v.is_string() || v.is_object() {
          out.insert(key.clone(), eval_expr(doc, v, vars)?);
        }
        continue;
      }
      match v {
        Value::Number(n) if n.as_i64() == Some(1) => {
          if let Some(found) = get_path(doc, key) {
            out.insert(key.clone(), found.clone());
          }
        }
        Value::Number(n) if n.as_i64() == Some(0) => {}
        Value::Bool(true) => {
          if let Some(found) = get_path(doc, key) {
            out.insert(key.clone(), found.clone());
          }
        }
        computed => {
          out.insert(key.clone(), eval_expr(doc, computed, vars)?);
        }
      }
    }
    Ok(Value::Object(out))
  } else {
    // Pure exclusion.
    let mut out = doc.as_object().cloned().unwrap_or_default();
    for (key, v) in spec_obj {
      if matches!(v, Value::Number(n) if n.as_i64() == Some(0)) {
        out.remove(key);
      }
    }
    Ok(Value::Object(out))
  }
}

/// Project a find result down to the requested columns. `_id` rides
/// along only when requested.
fn project_columns(doc: &Value, columns: &[String]) -> Value {
  let mut out = Map::new();
  if columns.iter().any(|c| c == "_id") {
    if let Some(id) = doc.get("_id") {
      out.insert("_id".to_string(), id.clone());
    }
  }
  for column in columns.iter().filter(|c| c.as_str() != "_id") {
    if let Some(v) = get_path(doc, column) {
      out.insert(column.clone(), v.clone());
    }
  }
  Value::Object(out)
}

fn sort_docs(docs: &mut [Value], sort: &Value) {
  let Some(keys) = sort.as_object() else {
    return;
  };
  let keys: Vec<(String, i64)> = keys
    .iter()
    .map(|(k, v)| (k.clone(), v.as_i64().unwrap_or(1)))
    .collect();
  docs.sort_by(|a, b| {
    for (key, direction) in &keys {
      let av = get_path(a, key).cloned().unwrap_or(Value::Null);
      let bv = get_path(b, key).cloned().unwrap_or(Value::Null);
      let ord = json_cmp(&av, &bv);
      if ord != Ordering::Equal {
        return if *direction < 0 { ord.reverse() } else { ord };
      }
    }
    Ordering::Equal
  });
}

fn apply_update(doc: &mut Value, update: &Value) -> EngineResult<()> {
  let Some(ops) = update.as_object() else {
    bail!("update document must be an object");
  };
  for (op, fields) in ops {
    let fields = fields
      .as_object()
      .ok_or_else(|| anyhow!("update operator {op} requires an object"))?;
    match op.as_str() {
      "set" => {
        for (k, v) in fields {
          doc[k.as_str()] = v.clone();
        }
      }
      "inc" | "dec" => {
        let sign = if op == "inc" { 1f64 } else { -1f64 };
        for (k, v) in fields {
          let delta = v.as_f64().ok_or_else(|| anyhow!("{op} on {k} requires a number"))?;
          let current = doc.get(k).and_then(Value::as_f64).unwrap_or(0.0);
          let next = current + sign * delta;
          let all_int = doc.get(k).map_or(true, |c| c.as_i64().is_some() || c.is_null())
            && v.as_i64().is_some();
          doc[k.as_str()] = number(next, all_int);
        }
      }
      "unset" => {
        if let Some(obj) = doc.as_object_mut() {
          for k in fields.keys() {
            obj.remove(k);
          }
        }
      }
      other => bail!("unknown update operator: {other}"),
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::stage;

  #[test]
  fn filter_matching() {
    let doc = json!({"name": "Alice", "age": 30, "email": null});
    assert!(matches_filter(&doc, &json!({"age": {"gt": 25}}), &NO_VARS));
    assert!(!matches_filter(&doc, &json!({"age": {"gt": 40}}), &NO_VARS));
    assert!(matches_filter(&doc, &json!({"email": null}), &NO_VARS));
    assert!(matches_filter(&doc, &json!({"missing": null}), &NO_VARS));
    assert!(matches_filter(
      &doc,
      &json!({"or": [{"age": {"lt": 10}}, {"name": "Alice"}]}),
      &NO_VARS
    ));
    assert!(matches_filter(&doc, &json!({"nor": [{"name": "Bob"}]}), &NO_VARS));
  }

  #[test]
  fn regex_matching() {
    let doc = json!({"name": "Alice"});
    assert!(matches_filter(
      &doc,
      &json!({"name": {"regex": "^al.*$", "options": "i"}}),
      &NO_VARS
    ));
    assert!(!matches_filter(&doc, &json!({"name": {"regex": "^al"}}), &NO_VARS));
  }

  #[test]
  fn numeric_equality_across_representations() {
    let doc = json!({"n": 1.0});
    assert!(matches_filter(&doc, &json!({"n": 1}), &NO_VARS));
  }

  #[test]
  fn group_with_cond() {
    let docs = vec![
      json!({"city": "a", "score": 1}),
      json!({"city": "a", "score": null}),
      json!({"city": "b", "score": 3}),
    ];
    let spec = json!({
      "_id": "$city",
      "n": {"sum": {"cond": [{"ne": ["$score", null]}, 1, 0]}},
      "total": {"sum": {"ifNull": ["$score", 0]}},
    });
    let out = exec_group(docs, &spec, &NO_VARS).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0], json!({"_id": "a", "n": 1, "total": 1}));
    assert_eq!(out[1], json!({"_id": "b", "n": 1, "total": 3}));
  }

  #[test]
  fn unwind_preserves_when_asked() {
    let docs = vec![json!({"a": 1, "items": []}), json!({"a": 2, "items": [10, 20]})];
    let kept = exec_unwind(
      docs.clone(),
      &json!({"path": "$items", "preserveNullAndEmptyArrays": true}),
    )
    .unwrap();
    assert_eq!(kept.len(), 3);
    assert_eq!(kept[0], json!({"a": 1}));

    let dropped = exec_unwind(
      docs,
      &json!({"path": "$items", "preserveNullAndEmptyArrays": false}),
    )
    .unwrap();
    assert_eq!(dropped.len(), 2);
  }

  #[tokio::test]
  async fn find_one_and_update_upserts() {
    let engine = MemoryEngine::new();
    let doc = engine
      .find_one_and_update(
        "__sequences",
        &json!({"_id": "users"}),
        &json!({"inc": {"value": 1}}),
        true,
      )
      .await
      .unwrap()
      .unwrap();
    assert_eq!(doc, json!({"_id": "users", "value": 1}));

    let doc = engine
      .find_one_and_update(
        "__sequences",
        &json!({"_id": "users"}),
        &json!({"inc": {"value": 1}}),
        true,
      )
      .await
      .unwrap()
      .unwrap();
    assert_eq!(doc["value"], json!(2));
  }

  #[tokio::test]
  async fn session_isolation() {
    let engine = MemoryEngine::new();
    engine
      .insert_many(None, "users", &[json!({"_id": 1})])
      .await
      .unwrap();

    let session = engine.begin_session().await.unwrap();
    engine
      .insert_many(Some(session.id()), "users", &[json!({"_id": 2})])
      .await
      .unwrap();

    // Not visible outside the session until commit.
    let outside = engine.find_many(None, "users", &json!({}), &FindOptions::default()).await.unwrap();
    assert_eq!(outside.len(), 1);

    session.commit().await.unwrap();
    let outside = engine.find_many(None, "users", &json!({}), &FindOptions::default()).await.unwrap();
    assert_eq!(outside.len(), 2);
  }

  #[tokio::test]
  async fn duplicate_id_rejected() {
    let engine = MemoryEngine::new();
    engine.insert_many(None, "users", &[json!({"_id": 1})]).await.unwrap();
    let err = engine
      .insert_many(None, "users", &[json!({"_id": 1})])
      .await
      .unwrap_err();
    assert!(err.to_string().contains("duplicate key"));
  }

  #[tokio::test]
  async fn drop_collection_removes_data_and_indexes() {
    let engine = MemoryEngine::new();
    engine
      .insert_many(None, "users", &[json!({"_id": 1, "email": "ada@example.com"})])
      .await
      .unwrap();
    engine
      .create_index(
        "users",
        &IndexSpec {
          name: "users_email_idx".into(),
          columns: vec![("email".into(), 1)],
          unique: true,
        },
      )
      .await
      .unwrap();

    engine.drop_collection("users").await.unwrap();

    assert!(engine.list_collections().await.unwrap().is_empty());
    assert_eq!(
      engine.list_indexes("users").await.unwrap(),
      vec![PRIMARY_KEY_INDEX.to_string()]
    );
    let docs = engine
      .find_many(None, "users", &json!({}), &FindOptions::default())
      .await
      .unwrap();
    assert!(docs.is_empty());

    // The unique constraint died with the index.
    engine
      .insert_many(None, "users", &[json!({"_id": 2, "email": "ada@example.com"})])
      .await
      .unwrap();
    engine
      .insert_many(None, "users", &[json!({"_id": 3, "email": "ada@example.com"})])
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn pipeline_built_from_stage_constructors() {
    let engine = MemoryEngine::new();
    engine
      .insert_many(None, "users", &[json!({"_id": 1, "name": "Ada"})])
      .await
      .unwrap();
    engine
      .insert_many(
        None,
        "orders",
        &[
          json!({"_id": 1, "user_id": 1, "total": 10}),
          json!({"_id": 2, "user_id": 1, "total": 20}),
        ],
      )
      .await
      .unwrap();

    let pipeline = vec![
      stage::match_stage(json!({"name": "Ada"})),
      stage::lookup("orders", "_id", "user_id", "orders"),
      stage::unwind("orders", false),
      stage::replace_root("orders"),
      stage::sort(json!({"total": -1})),
    ];
    let rows = engine.aggregate(None, "users", &pipeline).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["total"], json!(20));

    let counted = engine
      .aggregate(
        None,
        "orders",
        &[
          stage::match_stage(json!({"total": {"gte": 15}})),
          stage::count("n"),
        ],
      )
      .await
      .unwrap();
    assert_eq!(counted, vec![json!({"n": 1})]);
  }
}
