use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::mapper::FieldMapper;
use crate::sql::{
  ConditionExpr, DeleteStatement, InsertStatement, JoinKind, SelectField, SelectStatement,
  SqlCompareOp, SqlValue, Statement, UpdateStatement,
};
use crate::types::{like_to_regex, stage, Command, CommandOptions};

/// Filter key marking an IN-subquery the raw executor resolves in its
/// second pass. The marker value carries the already-translated inner
/// command, the projected column and the negation flag.
pub const SUBQUERY_MARKER: &str = "__subquery__";

const DEFAULT_AGG_ALIASES: &[&str] = &["count", "sum", "avg", "min", "max"];

/// Translates statement ASTs into engine commands.
///
/// Positional arguments are consumed left to right across the whole
/// statement, subqueries included; a surplus or shortage is a
/// parameter error.
pub struct SqlTranslator<'a> {
  mapper: &'a FieldMapper,
}

impl<'a> SqlTranslator<'a> {
  pub fn new(mapper: &'a FieldMapper) -> Self {
    Self { mapper }
  }

  pub async fn translate(&self, statement: &Statement, args: &[Value]) -> Result<Command> {
    let mut cursor = ArgCursor::new(args);
    let command = match statement {
      Statement::Select(select) => self.translate_select(select, &mut cursor)?,
      Statement::Insert(insert) => self.translate_insert(insert, &mut cursor).await?,
      Statement::Update(update) => self.translate_update(update, &mut cursor)?,
      Statement::Delete(delete) => self.translate_delete(delete, &mut cursor)?,
    };
    cursor.finish()?;
    command.validate()?;
    tracing::debug!(collection = %command.collection, operation = ?command.operation, "translated statement");
    Ok(command)
  }

  fn translate_select(&self, stmt: &SelectStatement, cursor: &mut ArgCursor) -> Result<Command> {
    let scope = SelectScope::new(self.mapper, stmt)?;

    if !stmt.needs_pipeline() {
      return self.translate_find(stmt, &scope, cursor);
    }
    self.translate_pipeline(stmt, &scope, cursor)
  }

  /// Simple SELECT with no joins, grouping, distinct or functions.
  fn translate_find(
    &self,
    stmt: &SelectStatement,
    scope: &SelectScope,
    cursor: &mut ArgCursor,
  ) -> Result<Command> {
    let filter = stmt
      .where_clause
      .as_ref()
      .map(|w| self.condition_filter(w, scope, cursor))
      .transpose()?;

    let mut sort = Map::new();
    for item in &stmt.order_by {
      let column = scope.resolve_column(&item.field)?;
      sort.insert(column, Value::from(if item.descending { -1 } else { 1 }));
    }

    let mut columns = Vec::new();
    for field in &stmt.fields {
      if field.expr == "*" {
        columns.clear();
        break;
      }
      columns.push(scope.resolve_column(&field.expr)?);
    }

    let mut command = Command::find(&scope.collection).with_options(CommandOptions {
      limit: stmt.limit,
      skip: stmt.offset,
      sort: if sort.is_empty() { None } else { Some(Value::Object(sort)) },
    });
    if let Some(filter) = filter {
      command = command.with_filter(filter);
    }
    Ok(command.with_fields(columns))
  }

  /// Aggregation pipeline in fixed stage order: match, joins, group,
  /// having, sort, skip, limit, project.
  fn translate_pipeline(
    &self,
    stmt: &SelectStatement,
    scope: &SelectScope,
    cursor: &mut ArgCursor,
  ) -> Result<Command> {
    let mut pipeline = Vec::new();

    if let Some(where_clause) = &stmt.where_clause {
      pipeline.push(stage::match_stage(self.condition_filter(where_clause, scope, cursor)?));
    }

    for join in &stmt.joins {
      if join.kind == JoinKind::Right {
        return Err(Error::unsupported("RIGHT JOIN has no pipeline equivalent"));
      }
      let as_field = join.table.alias.clone().unwrap_or_else(|| join.table.name.clone());

      // The ON side qualified by the joined table is the foreign half.
      let (foreign_raw, local_raw) = if scope.qualifier_of(&join.left).as_deref()
        == Some(as_field.as_str())
      {
        (&join.left, &join.right)
      } else {
        (&join.right, &join.left)
      };
      let foreign_column = strip_qualifier(foreign_raw).1;
      let foreign_column = rewrite_id(&foreign_column);
      let local_column = scope.resolve_column(local_raw)?;

      pipeline.push(stage::lookup(&join.table.name, &local_column, &foreign_column, &as_field));
      if join.kind == JoinKind::Inner {
        pipeline.push(stage::match_stage(json!({ as_field.clone(): { "ne": [] } })));
      }
      pipeline.push(stage::unwind(&as_field, join.kind == JoinKind::Left));
    }

    let aggregates = collect_aggregates(&stmt.fields)?;
    let grouped = !stmt.group_by.is_empty() || !aggregates.is_empty();
    let mut group_keys: Vec<(String, String)> = Vec::new(); // (output name, column)
    let mut alias_names: Vec<String> = Vec::new();

    if grouped {
      for raw in &stmt.group_by {
        let column = scope.resolve_column(raw)?;
        group_keys.push((output_name(raw, None), column));
      }

      let id_value = match group_keys.len() {
        0 => Value::Null,
        1 => Value::String(format!("${}", group_keys[0].1)),
        _ => {
          let mut id = Map::new();
          for (name, column) in &group_keys {
            id.insert(name.clone(), Value::String(format!("${column}")));
          }
          Value::Object(id)
        }
      };

      let mut group_spec = Map::new();
      group_spec.insert("_id".to_string(), id_value);
      for agg in &aggregates {
        group_spec.insert(agg.alias.clone(), agg.accumulator(scope)?);
        alias_names.push(agg.alias.clone());
      }
      pipeline.push(stage::group(Value::Object(group_spec)));
    }

    if let Some(having) = &stmt.having {
      let alias_map = having_alias_map(&stmt.fields, &alias_names)?;
      pipeline.push(stage::match_stage(self.having_filter(having, &alias_map, cursor)?));
    }

    if !stmt.order_by.is_empty() {
      let mut sort = Map::new();
      for item in &stmt.order_by {
        let key = if grouped {
          grouped_sort_key(&item.field, &group_keys, &alias_names, scope)?
        } else {
          scope.resolve_column(&item.field)?
        };
        sort.insert(key, Value::from(if item.descending { -1 } else { 1 }));
      }
      pipeline.push(stage::sort(Value::Object(sort)));
    }

    if let Some(offset) = stmt.offset {
      pipeline.push(stage::skip(offset));
    }
    if let Some(limit) = stmt.limit {
      pipeline.push(stage::limit(limit));
    }

    if stmt.distinct {
      self.push_distinct(stmt, scope, &mut pipeline)?;
    } else if let Some(project) = self.build_project(stmt, scope, &group_keys, &aggregates)? {
      pipeline.push(stage::project(project));
    }

    Ok(Command::aggregate(&scope.collection, pipeline))
  }

  /// DISTINCT re-groups on the selected columns, then restores the
  /// column names.
  fn push_distinct(
    &self,
    stmt: &SelectStatement,
    scope: &SelectScope,
    pipeline: &mut Vec<Value>,
  ) -> Result<()> {
    if stmt.fields.iter().any(|f| f.expr == "*") {
      return Err(Error::unsupported("SELECT DISTINCT * is not supported"));
    }
    let mut id = Map::new();
    let mut restore = Map::new();
    restore.insert("_id".to_string(), Value::from(0));
    for field in &stmt.fields {
      let column = scope.resolve_column(&field.expr)?;
      let name = output_name(&field.expr, field.alias.as_deref());
      id.insert(name.clone(), Value::String(format!("${column}")));
      restore.insert(name.clone(), Value::String(format!("$_id.{name}")));
    }
    pipeline.push(stage::group(json!({ "_id": id })));
    pipeline.push(stage::project(Value::Object(restore)));
    Ok(())
  }

  /// Final projection: suppress `_id`, alias grouped keys back to
  /// their SQL-visible names, keep aggregate aliases.
  fn build_project(
    &self,
    stmt: &SelectStatement,
    scope: &SelectScope,
    group_keys: &[(String, String)],
    aggregates: &[Aggregate],
  ) -> Result<Option<Value>> {
    let star = stmt.fields.iter().any(|f| f.expr == "*");
    if star && group_keys.is_empty() && aggregates.is_empty() {
      return Ok(None);
    }

    let mut project = Map::new();
    project.insert("_id".to_string(), Value::from(0));

    if !group_keys.is_empty() || !aggregates.is_empty() {
      match group_keys.len() {
        0 => {}
        1 => {
          project.insert(group_keys[0].0.clone(), Value::String("$_id".to_string()));
        }
        _ => {
          for (name, _) in group_keys {
            project.insert(name.clone(), Value::String(format!("$_id.{name}")));
          }
        }
      }
      for agg in aggregates {
        project.insert(agg.alias.clone(), Value::from(1));
      }
      return Ok(Some(Value::Object(project)));
    }

    // Join pipeline with named columns.
    for field in &stmt.fields {
      let column = scope.resolve_column(&field.expr)?;
      let name = output_name(&field.expr, field.alias.as_deref());
      if name == column {
        project.insert(name, Value::from(1));
      } else {
        project.insert(name, Value::String(format!("${column}")));
      }
    }
    Ok(Some(Value::Object(project)))
  }

  async fn translate_insert(&self, stmt: &InsertStatement, cursor: &mut ArgCursor<'_>) -> Result<Command> {
    let scope = TableScope::new(self.mapper, &stmt.table)?;
    let mut columns = Vec::with_capacity(stmt.columns.len());
    for column in &stmt.columns {
      columns.push(scope.resolve_column(column)?);
    }

    let auto_pk = scope
      .model
      .as_ref()
      .and_then(|m| self.mapper.registry().try_get(m))
      .and_then(|s| s.auto_increment_pk().map(|f| f.name.clone()));

    let mut documents = Vec::with_capacity(stmt.rows.len());
    let mut last_insert_id = None;
    for row in &stmt.rows {
      let mut doc = Map::new();
      for (column, value) in columns.iter().zip(row) {
        doc.insert(column.clone(), resolve_value(value, cursor)?);
      }
      if auto_pk.is_some() && !doc.contains_key("_id") {
        let next = self
          .mapper
          .generate_next_sequence(scope.model.as_deref().unwrap_or(&stmt.table))
          .await?;
        doc.insert("_id".to_string(), Value::from(next));
        last_insert_id = Some(next);
      }
      documents.push(Value::Object(doc));
    }

    let mut command = Command::insert(&scope.collection, documents);
    command.last_insert_id = last_insert_id;
    Ok(command)
  }

  fn translate_update(&self, stmt: &UpdateStatement, cursor: &mut ArgCursor) -> Result<Command> {
    let scope = TableScope::new(self.mapper, &stmt.table)?;
    let mut set = Map::new();
    for (column, value) in &stmt.assignments {
      set.insert(scope.resolve_column(column)?, resolve_value(value, cursor)?);
    }
    let filter = match &stmt.where_clause {
      Some(w) => self.table_condition_filter(w, &scope, cursor)?,
      // An empty filter updates every document.
      None => json!({}),
    };
    Ok(Command::update(&scope.collection, filter, json!({ "set": set })))
  }

  fn translate_delete(&self, stmt: &DeleteStatement, cursor: &mut ArgCursor) -> Result<Command> {
    let scope = TableScope::new(self.mapper, &stmt.table)?;
    let filter = match &stmt.where_clause {
      Some(w) => self.table_condition_filter(w, &scope, cursor)?,
      None => json!({}),
    };
    Ok(Command::delete(&scope.collection, filter))
  }

  fn condition_filter(
    &self,
    expr: &ConditionExpr,
    scope: &SelectScope,
    cursor: &mut ArgCursor,
  ) -> Result<Value> {
    self.emit_condition(expr, &|field| scope.resolve_column(field), cursor)
  }

  fn table_condition_filter(
    &self,
    expr: &ConditionExpr,
    scope: &TableScope,
    cursor: &mut ArgCursor,
  ) -> Result<Value> {
    self.emit_condition(expr, &|field| scope.resolve_column(field), cursor)
  }

  fn having_filter(
    &self,
    expr: &ConditionExpr,
    aliases: &HashMap<String, String>,
    cursor: &mut ArgCursor,
  ) -> Result<Value> {
    self.emit_condition(
      expr,
      &|field| {
        if let Some(alias) = aliases.get(field) {
          return Ok(alias.clone());
        }
        if !field.contains('(') && aliases.values().any(|a| a == field) {
          return Ok(field.to_string());
        }
        Err(Error::unsupported(format!(
          "HAVING references {field}, which matches no SELECT alias"
        )))
      },
      cursor,
    )
  }

  fn emit_condition(
    &self,
    expr: &ConditionExpr,
    resolve: &dyn Fn(&str) -> Result<String>,
    cursor: &mut ArgCursor,
  ) -> Result<Value> {
    let filter = match expr {
      ConditionExpr::Compare { left, op, right } => {
        let column = resolve(left)?;
        let value = resolve_value(right, cursor)?;
        match op {
          SqlCompareOp::Eq => json!({ column: value }),
          SqlCompareOp::Ne => json!({ column: { "ne": value } }),
          SqlCompareOp::Gt => json!({ column: { "gt": value } }),
          SqlCompareOp::Gte => json!({ column: { "gte": value } }),
          SqlCompareOp::Lt => json!({ column: { "lt": value } }),
          SqlCompareOp::Lte => json!({ column: { "lte": value } }),
        }
      }
      ConditionExpr::Between { field, low, high, negated } => {
        let column = resolve(field)?;
        let range = json!({ column.clone(): {
          "gte": resolve_value(low, cursor)?,
          "lte": resolve_value(high, cursor)?,
        }});
        if *negated {
          json!({ "nor": [range] })
        } else {
          range
        }
      }
      ConditionExpr::Like { field, pattern, negated } => {
        let column = resolve(field)?;
        let pattern = match resolve_value(pattern, cursor)? {
          Value::String(s) => s,
          other => {
            return Err(Error::validation(format!("LIKE pattern must be a string, got {other}")))
          }
        };
        let matcher = json!({ column.clone(): { "regex": like_to_regex(&pattern), "options": "i" } });
        if *negated {
          json!({ "nor": [matcher] })
        } else {
          matcher
        }
      }
      ConditionExpr::InList { field, values, negated } => {
        let column = resolve(field)?;
        let resolved: Result<Vec<Value>> = values.iter().map(|v| resolve_value(v, cursor)).collect();
        let op = if *negated { "nin" } else { "in" };
        json!({ column: { op: resolved? } })
      }
      ConditionExpr::InSubquery { field, subquery, negated } => {
        let column = resolve(field)?;
        // Translate the inner SELECT now so argument order is
        // preserved; execution happens in the executor's second pass.
        let inner = self.translate_select(subquery, cursor)?;
        let project = subquery_projection(subquery, &inner)?;
        json!({ column: { SUBQUERY_MARKER: {
          "command": serde_json::to_value(&inner)
            .map_err(|e| Error::internal(format!("subquery serialization: {e}")))?,
          "column": project,
          "negated": negated,
        }}})
      }
      ConditionExpr::IsNull { field, negated } => {
        let column = resolve(field)?;
        if *negated {
          json!({ column: { "ne": Value::Null } })
        } else {
          json!({ column: Value::Null })
        }
      }
      ConditionExpr::And(lhs, rhs) => json!({ "and": [
        self.emit_condition(lhs, resolve, cursor)?,
        self.emit_condition(rhs, resolve, cursor)?,
      ]}),
      ConditionExpr::Or(lhs, rhs) => json!({ "or": [
        self.emit_condition(lhs, resolve, cursor)?,
        self.emit_condition(rhs, resolve, cursor)?,
      ]}),
      ConditionExpr::Not(inner) => json!({ "nor": [self.emit_condition(inner, resolve, cursor)?] }),
    };
    Ok(filter)
  }
}

/// The single projected column of an IN-subquery, in storage shape.
fn subquery_projection(subquery: &SelectStatement, command: &Command) -> Result<String> {
  if let Some(fields) = &command.fields {
    if fields.len() == 1 {
      return Ok(fields[0].clone());
    }
  }
  if subquery.fields.len() == 1 && subquery.fields[0].expr != "*" {
    return Ok(rewrite_id(&strip_qualifier(&subquery.fields[0].expr).1));
  }
  Err(Error::unsupported(
    "IN subquery must project exactly one column",
  ))
}

/// Positional argument cursor shared across a statement.
struct ArgCursor<'a> {
  args: &'a [Value],
  index: usize,
}

impl<'a> ArgCursor<'a> {
  fn new(args: &'a [Value]) -> Self {
    Self { args, index: 0 }
  }

  fn take(&mut self) -> Result<Value> {
    let value = self
      .args
      .get(self.index)
      .cloned()
      .ok_or_else(|| Error::parameter(format!("placeholder {} has no argument", self.index + 1)))?;
    self.index += 1;
    Ok(value)
  }

  fn finish(&self) -> Result<()> {
    if self.index != self.args.len() {
      return Err(Error::parameter(format!(
        "statement consumed {} of {} arguments",
        self.index,
        self.args.len()
      )));
    }
    Ok(())
  }
}

fn resolve_value(value: &SqlValue, cursor: &mut ArgCursor) -> Result<Value> {
  Ok(match value {
    SqlValue::Int(n) => json!(n),
    SqlValue::Float(f) => json!(f),
    SqlValue::Str(s) => json!(s),
    SqlValue::Bool(b) => json!(b),
    SqlValue::Null => Value::Null,
    SqlValue::Placeholder => cursor.take()?,
  })
}

/// Split `alias.column` into its qualifier and column parts.
fn strip_qualifier(field: &str) -> (Option<String>, String) {
  match field.rsplit_once('.') {
    Some((qualifier, column)) => (Some(qualifier.to_string()), column.to_string()),
    None => (None, field.to_string()),
  }
}

/// `id` in SQL statements addresses the primary key column.
fn rewrite_id(column: &str) -> String {
  if column == "id" {
    "_id".to_string()
  } else {
    column.to_string()
  }
}

/// SQL-visible output name for a select field.
fn output_name(expr: &str, alias: Option<&str>) -> String {
  if let Some(alias) = alias {
    return alias.to_string();
  }
  strip_qualifier(expr).1
}

/// Name scope of a single-table statement.
struct TableScope {
  collection: String,
  model: Option<String>,
  /// Declared single primary key: field name and storage column.
  pk_names: Option<(String, String)>,
}

impl TableScope {
  fn new(mapper: &FieldMapper, table: &str) -> Result<Self> {
    let schema = mapper.registry().by_collection(table);
    if schema.is_none() && !mapper.registry().is_empty() {
      return Err(Error::schema(format!("unknown collection: {table}")));
    }
    let pk_names = schema.as_ref().and_then(|s| match s.primary_key() {
      crate::schema::PrimaryKey::Single(name) => {
        let column = s.get_field(&name).map(|f| f.column_name().to_string());
        Some((name.clone(), column.unwrap_or(name)))
      }
      _ => None,
    });
    Ok(Self {
      collection: table.to_string(),
      model: schema.map(|s| s.name.clone()),
      pk_names,
    })
  }

  fn resolve_column(&self, field: &str) -> Result<String> {
    let (_, column) = strip_qualifier(field);
    if let Some((pk_field, pk_column)) = &self.pk_names {
      if column == *pk_field || column == *pk_column {
        return Ok("_id".to_string());
      }
    }
    Ok(rewrite_id(&column))
  }
}

/// Name scope of a SELECT: the base table, its alias and join aliases.
struct SelectScope {
  collection: String,
  base_names: Vec<String>,
  join_names: Vec<String>,
}

impl SelectScope {
  fn new(mapper: &FieldMapper, stmt: &SelectStatement) -> Result<Self> {
    let registry = mapper.registry();
    if !registry.is_empty() {
      if registry.by_collection(&stmt.from.name).is_none() {
        return Err(Error::schema(format!("unknown collection: {}", stmt.from.name)));
      }
      for join in &stmt.joins {
        if registry.by_collection(&join.table.name).is_none() {
          return Err(Error::schema(format!("unknown collection: {}", join.table.name)));
        }
      }
    }

    let mut base_names = vec![stmt.from.name.clone()];
    if let Some(alias) = &stmt.from.alias {
      base_names.push(alias.clone());
    }
    let mut join_names = Vec::new();
    for join in &stmt.joins {
      join_names.push(join.table.alias.clone().unwrap_or_else(|| join.table.name.clone()));
    }

    Ok(Self {
      collection: stmt.from.name.clone(),
      base_names,
      join_names,
    })
  }

  fn qualifier_of(&self, field: &str) -> Option<String> {
    strip_qualifier(field).0
  }

  /// Resolve a possibly qualified SQL field to its storage column.
  /// Fields of joined tables keep their alias as a path prefix, since
  /// the joined document nests under that name after its lookup.
  fn resolve_column(&self, field: &str) -> Result<String> {
    let (qualifier, column) = strip_qualifier(field);
    let column = rewrite_id(&column);
    match qualifier {
      None => Ok(column),
      Some(q) if self.base_names.iter().any(|n| n == &q) => Ok(column),
      Some(q) if self.join_names.iter().any(|n| n == &q) => Ok(format!("{q}.{column}")),
      Some(q) => Err(Error::schema(format!("unknown table qualifier: {q}"))),
    }
  }
}

/// One aggregate function in the SELECT list.
struct Aggregate {
  func: String,
  arg: String,
  alias: String,
}

impl Aggregate {
  fn accumulator(&self, scope: &SelectScope) -> Result<Value> {
    let acc = match self.func.as_str() {
      "COUNT" => {
        if self.arg == "*" {
          json!({ "sum": 1 })
        } else {
          // COUNT(column) skips null and missing values.
          let column = scope.resolve_column(&self.arg)?;
          json!({ "sum": { "cond": [{ "ne": [format!("${column}"), Value::Null] }, 1, 0] } })
        }
      }
      "SUM" => json!({ "sum": format!("${}", scope.resolve_column(&self.arg)?) }),
      "AVG" => json!({ "avg": format!("${}", scope.resolve_column(&self.arg)?) }),
      "MIN" => json!({ "min": format!("${}", scope.resolve_column(&self.arg)?) }),
      "MAX" => json!({ "max": format!("${}", scope.resolve_column(&self.arg)?) }),
      other => return Err(Error::unsupported(format!("aggregate function {other}"))),
    };
    Ok(acc)
  }
}

fn collect_aggregates(fields: &[SelectField]) -> Result<Vec<Aggregate>> {
  let mut out = Vec::new();
  for field in fields {
    let Some((func, arg)) = parse_function(&field.expr) else {
      continue;
    };
    if arg.to_ascii_uppercase().starts_with("DISTINCT ") {
      return Err(Error::unsupported(format!("{func}(DISTINCT ...)")));
    }
    let alias = field
      .alias
      .clone()
      .unwrap_or_else(|| func.to_ascii_lowercase());
    out.push(Aggregate { func, arg, alias });
  }
  Ok(out)
}

fn parse_function(expr: &str) -> Option<(String, String)> {
  let open = expr.find('(')?;
  let close = expr.rfind(')')?;
  if close <= open {
    return None;
  }
  let func = expr[..open].trim().to_ascii_uppercase();
  let arg = expr[open + 1..close].trim().to_string();
  Some((func, arg))
}

/// Map HAVING operands to group-stage aliases: the exact SELECT
/// expression first, then the default alias set.
fn having_alias_map(fields: &[SelectField], produced: &[String]) -> Result<HashMap<String, String>> {
  let mut map = HashMap::new();
  for field in fields {
    if let Some((func, _)) = parse_function(&field.expr) {
      let alias = field
        .alias
        .clone()
        .unwrap_or_else(|| func.to_ascii_lowercase());
      map.insert(field.expr.clone(), alias);
    }
  }
  for default in DEFAULT_AGG_ALIASES {
    if produced.iter().any(|p| p == default) {
      map
        .entry(format!("{}(*)", default.to_ascii_uppercase()))
        .or_insert_with(|| default.to_string());
    }
  }
  Ok(map)
}

fn grouped_sort_key(
  field: &str,
  group_keys: &[(String, String)],
  aliases: &[String],
  _scope: &SelectScope,
) -> Result<String> {
  let (_, bare) = strip_qualifier(field);
  if aliases.iter().any(|a| a == &bare) {
    return Ok(bare);
  }
  if let Some(position) = group_keys.iter().position(|(name, _)| name == &bare) {
    return Ok(match group_keys.len() {
      1 => "_id".to_string(),
      _ => format!("_id.{}", group_keys[position].0),
    });
  }
  Err(Error::unsupported(format!(
    "ORDER BY {field} does not name a grouped key or aggregate alias"
  )))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::MemoryEngine;
  use crate::schema::{Field, FieldType, Schema, SchemaRegistry};
  use crate::sql::parse;
  use std::sync::Arc;

  fn mapper(schemas: Vec<Schema>) -> FieldMapper {
    let registry = Arc::new(SchemaRegistry::new());
    for schema in schemas {
      registry.register(schema).unwrap();
    }
    FieldMapper::new(registry, Arc::new(MemoryEngine::new()))
  }

  fn empty_mapper() -> FieldMapper {
    mapper(vec![])
  }

  async fn translate(sql: &str, args: &[Value]) -> Result<Command> {
    let mapper = empty_mapper();
    let translator = SqlTranslator::new(&mapper);
    let statement = parse(sql)?;
    translator.translate(&statement, args).await
  }

  #[tokio::test]
  async fn simple_where_becomes_find() {
    let cmd = translate("SELECT * FROM users WHERE age > 25", &[]).await.unwrap();
    assert_eq!(cmd.operation, crate::types::Operation::Find);
    assert_eq!(cmd.collection, "users");
    assert_eq!(cmd.filter, Some(json!({"age": {"gt": 25}})));
    assert!(cmd.pipeline.is_none());
  }

  #[tokio::test]
  async fn id_rewrites_to_underscore_id() {
    let cmd = translate("SELECT * FROM users WHERE id = 1", &[]).await.unwrap();
    assert_eq!(cmd.filter, Some(json!({"_id": 1})));

    let cmd = translate("SELECT * FROM users u WHERE u.id = 1", &[]).await.unwrap();
    assert_eq!(cmd.filter, Some(json!({"_id": 1})));
  }

  #[tokio::test]
  async fn parameters_substitute_in_order() {
    let cmd = translate(
      "SELECT * FROM users WHERE age > ? AND name = ?",
      &[json!(25), json!("Ada")],
    )
    .await
    .unwrap();
    assert_eq!(
      cmd.filter,
      Some(json!({"and": [{"age": {"gt": 25}}, {"name": "Ada"}]}))
    );
  }

  #[tokio::test]
  async fn parameter_count_mismatch_fails() {
    let err = translate("SELECT * FROM users WHERE age > ?", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Parameter(_)));

    let err = translate("SELECT * FROM users WHERE age > ?", &[json!(1), json!(2)])
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Parameter(_)));
  }

  #[tokio::test]
  async fn join_group_having_pipeline() {
    let cmd = translate(
      "SELECT u.name, COUNT(*) AS c FROM users u \
       LEFT JOIN orders o ON o.user_id = u.id \
       GROUP BY u.name HAVING c >= 3",
      &[],
    )
    .await
    .unwrap();

    let pipeline = cmd.pipeline.unwrap();
    assert_eq!(
      pipeline[0],
      json!({"lookup": {"from": "orders", "localField": "_id", "foreignField": "user_id", "as": "o"}})
    );
    assert_eq!(
      pipeline[1],
      json!({"unwind": {"path": "$o", "preserveNullAndEmptyArrays": true}})
    );
    assert_eq!(
      pipeline[2],
      json!({"group": {"_id": "$name", "c": {"sum": 1}}})
    );
    assert_eq!(pipeline[3], json!({"match": {"c": {"gte": 3}}}));
    assert_eq!(
      pipeline[4],
      json!({"project": {"_id": 0, "name": "$_id", "c": 1}})
    );
  }

  #[tokio::test]
  async fn inner_join_drops_unmatched() {
    let cmd = translate(
      "SELECT * FROM users u INNER JOIN orders o ON o.user_id = u.id",
      &[],
    )
    .await
    .unwrap();
    let pipeline = cmd.pipeline.unwrap();
    assert_eq!(pipeline[1], json!({"match": {"o": {"ne": []}}}));
    assert_eq!(
      pipeline[2],
      json!({"unwind": {"path": "$o", "preserveNullAndEmptyArrays": false}})
    );
  }

  #[tokio::test]
  async fn count_field_excludes_nulls() {
    let cmd = translate("SELECT COUNT(email) AS n FROM users", &[]).await.unwrap();
    let pipeline = cmd.pipeline.unwrap();
    assert_eq!(
      pipeline[0],
      json!({"group": {"_id": null, "n": {"sum": {"cond": [{"ne": ["$email", null]}, 1, 0]}}}})
    );
  }

  #[tokio::test]
  async fn having_without_matching_select_alias_is_unsupported() {
    let err = translate(
      "SELECT u.name FROM users u GROUP BY u.name HAVING AVG(age) > 3",
      &[],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
  }

  #[tokio::test]
  async fn subquery_becomes_marker() {
    let cmd = translate(
      "SELECT * FROM posts WHERE id IN (SELECT post_id FROM likes WHERE user_id = ?)",
      &[json!(42)],
    )
    .await
    .unwrap();

    let filter = cmd.filter.unwrap();
    let marker = &filter["_id"][SUBQUERY_MARKER];
    assert_eq!(marker["column"], json!("post_id"));
    assert_eq!(marker["negated"], json!(false));
    assert_eq!(marker["command"]["collection"], json!("likes"));
    assert_eq!(marker["command"]["filter"], json!({"user_id": 42}));
  }

  #[tokio::test]
  async fn unknown_collection_fails_when_schemas_registered() {
    let mapper = mapper(vec![
      Schema::new("User").field(Field::new("id", FieldType::Int).primary_key())
    ]);
    let translator = SqlTranslator::new(&mapper);
    let statement = parse("SELECT * FROM ghosts").unwrap();
    let err = translator.translate(&statement, &[]).await.unwrap_err();
    assert!(matches!(err, Error::Schema(_)));

    let ok = parse("SELECT * FROM users").unwrap();
    assert!(translator.translate(&ok, &[]).await.is_ok());
  }

  #[tokio::test]
  async fn insert_allocates_sequence() {
    let mapper = mapper(vec![Schema::new("User")
      .field(Field::new("id", FieldType::Int).primary_key().auto_increment())
      .field(Field::new("name", FieldType::String))]);
    let translator = SqlTranslator::new(&mapper);
    let statement = parse("INSERT INTO users (name) VALUES ('Ada')").unwrap();
    let cmd = translator.translate(&statement, &[]).await.unwrap();

    assert_eq!(cmd.last_insert_id, Some(1));
    assert_eq!(cmd.documents, Some(vec![json!({"name": "Ada", "_id": 1})]));
  }

  #[tokio::test]
  async fn update_emits_set() {
    let cmd = translate("UPDATE users SET age = 31 WHERE name = 'Ada'", &[]).await.unwrap();
    assert_eq!(cmd.update, Some(json!({"set": {"age": 31}})));
    assert_eq!(cmd.filter, Some(json!({"name": "Ada"})));
  }

  #[tokio::test]
  async fn delete_without_where_means_all() {
    let cmd = translate("DELETE FROM users", &[]).await.unwrap();
    assert_eq!(cmd.filter, Some(json!({})));
  }

  #[tokio::test]
  async fn like_translates_to_regex() {
    let cmd = translate("SELECT * FROM users WHERE name LIKE 'a%'", &[]).await.unwrap();
    assert_eq!(
      cmd.filter,
      Some(json!({"name": {"regex": "^a.*$", "options": "i"}}))
    );
  }

  #[tokio::test]
  async fn order_limit_offset_options() {
    let cmd = translate("SELECT * FROM users ORDER BY name DESC LIMIT 5 OFFSET 10", &[])
      .await
      .unwrap();
    let options = cmd.options.unwrap();
    assert_eq!(options.limit, Some(5));
    assert_eq!(options.skip, Some(10));
    assert_eq!(options.sort, Some(json!({"name": -1})));
  }

  #[tokio::test]
  async fn right_join_is_unsupported() {
    let err = translate(
      "SELECT * FROM a RIGHT JOIN b ON b.a_id = a.id",
      &[],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
  }

  #[tokio::test]
  async fn distinct_groups_on_selection() {
    let cmd = translate("SELECT DISTINCT city FROM users", &[]).await.unwrap();
    let pipeline = cmd.pipeline.unwrap();
    assert_eq!(pipeline[0], json!({"group": {"_id": {"city": "$city"}}}));
    assert_eq!(
      pipeline[1],
      json!({"project": {"_id": 0, "city": "$_id.city"}})
    );
  }
}
