use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::mapper::FieldMapper;
use crate::schema::{Relation, RelationKind};
use crate::types::{stage, Condition, SortSpec};

/// Options attached to one include path.
#[derive(Debug, Clone, Default)]
pub struct IncludeOptions {
  /// Condition evaluated against the target model.
  pub filter: Option<Condition>,
  pub order_by: Vec<SortSpec>,
  pub select: Vec<String>,
  pub limit: Option<i64>,
  pub offset: Option<i64>,
}

impl IncludeOptions {
  fn is_default(&self) -> bool {
    self.filter.is_none()
      && self.order_by.is_empty()
      && self.select.is_empty()
      && self.limit.is_none()
      && self.offset.is_none()
  }
}

/// One requested include path, dot-separated for nesting
/// (`comments.author`).
#[derive(Debug, Clone)]
pub struct IncludeSpec {
  pub path: String,
  pub options: IncludeOptions,
}

#[derive(Debug, Clone, Default)]
pub struct IncludeTree {
  /// Relation name to node, in request order.
  nodes: Vec<(String, IncludeNode)>,
}

#[derive(Debug, Clone, Default)]
pub struct IncludeNode {
  options: IncludeOptions,
  children: IncludeTree,
}

impl IncludeTree {
  /// Group include paths by their root relation. A plain `X` request
  /// is absorbed by a nested `X.Y`, keeping `X`'s options on the
  /// shared node.
  pub fn build(specs: &[IncludeSpec]) -> Self {
    let mut tree = IncludeTree::default();
    for spec in specs {
      let mut current = &mut tree;
      let segments: Vec<&str> = spec.path.split('.').collect();
      for (depth, segment) in segments.iter().enumerate() {
        let position = match current.nodes.iter().position(|(name, _)| name == segment) {
          Some(p) => p,
          None => {
            current.nodes.push((segment.to_string(), IncludeNode::default()));
            current.nodes.len() - 1
          }
        };
        let node = &mut current.nodes[position].1;
        if depth == segments.len() - 1 {
          node.options = spec.options.clone();
        }
        current = &mut node.children;
      }
    }
    tree
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &IncludeNode)> {
    self.nodes.iter().map(|(name, node)| (name.as_str(), node))
  }
}

impl IncludeNode {
  pub fn options(&self) -> &IncludeOptions {
    &self.options
  }

  pub fn children(&self) -> &IncludeTree {
    &self.children
  }
}

/// Emit the lookup (and unwind) stages expanding `tree` on `model`.
pub fn build_include_stages(
  mapper: &FieldMapper,
  model: &str,
  tree: &IncludeTree,
) -> Result<Vec<Value>> {
  let mut stages = Vec::new();
  for (name, node) in tree.iter() {
    let (lookup, unwind_after) = build_relation_lookup(mapper, model, name, node)?;
    stages.push(lookup);
    if unwind_after {
      stages.push(stage::unwind(name, true));
    }
  }
  Ok(stages)
}

/// Build one relation's lookup stage; the flag asks for an unwind when
/// the relation resolves to at most one document.
fn build_relation_lookup(
  mapper: &FieldMapper,
  model: &str,
  name: &str,
  node: &IncludeNode,
) -> Result<(Value, bool)> {
  let schema = mapper.registry().get(model)?;
  let relation = schema
    .get_relation(name)
    .ok_or_else(|| Error::schema(format!("unknown relation {name} on model {model}")))?
    .clone();

  let (local_column, foreign_column, single) = relation_columns(mapper, model, &relation)?;
  let collection = mapper.model_to_collection(&relation.target);

  let plain = node.options().is_default() && node.children().is_empty();
  if plain {
    return Ok((stage::lookup(&collection, &local_column, &foreign_column, name), single));
  }

  // Options or nesting force the pipeline form: the bound variable
  // carries the local key and the options become pipeline stages.
  let options = node.options();
  let mut pipeline = vec![stage::match_stage(json!({
    "expr": { "eq": [format!("${foreign_column}"), "$$local"] }
  }))];
  if let Some(condition) = &options.filter {
    pipeline.push(stage::match_stage(condition.to_filter(mapper)?));
  }
  if !options.order_by.is_empty() {
    let mut sort = Map::new();
    for spec in &options.order_by {
      let column = mapper.schema_to_column(&relation.target, &spec.field)?;
      sort.insert(column, Value::from(spec.direction.as_i64()));
    }
    pipeline.push(stage::sort(Value::Object(sort)));
  }
  if let Some(offset) = options.offset {
    pipeline.push(stage::skip(offset));
  }
  if let Some(limit) = options.limit {
    pipeline.push(stage::limit(limit));
  }

  // Nested includes run inside the parent's pipeline, child unwinds
  // included.
  for (child_name, child_node) in node.children().iter() {
    let (lookup, unwind_after) =
      build_relation_lookup(mapper, &relation.target, child_name, child_node)?;
    pipeline.push(lookup);
    if unwind_after {
      pipeline.push(stage::unwind(child_name, true));
    }
  }

  if !options.select.is_empty() {
    let mut project = Map::new();
    let mut id_requested = false;
    for field in &options.select {
      let column = mapper.schema_to_column(&relation.target, field)?;
      if column == "_id" {
        id_requested = true;
      }
      project.insert(column, Value::from(1));
    }
    if !id_requested {
      project.insert("_id".to_string(), Value::from(0));
    }
    pipeline.push(stage::project(Value::Object(project)));
  }

  let lookup = stage::lookup_pipeline(
    &collection,
    json!({ "local": format!("${local_column}") }),
    pipeline,
    name,
  );
  Ok((lookup, single))
}

/// Storage columns binding the two sides of a relation, plus whether
/// the result is a single document.
fn relation_columns(
  mapper: &FieldMapper,
  model: &str,
  relation: &Relation,
) -> Result<(String, String, bool)> {
  match relation.kind {
    // Local primary key to the foreign key on the target.
    RelationKind::OneToMany => Ok((
      mapper.schema_to_column(model, &relation.references)?,
      mapper.schema_to_column(&relation.target, &relation.foreign_key)?,
      false,
    )),
    // Local foreign key to the target's referenced key, one document.
    RelationKind::ManyToOne | RelationKind::OneToOne => Ok((
      mapper.schema_to_column(model, &relation.foreign_key)?,
      mapper.schema_to_column(&relation.target, &relation.references)?,
      true,
    )),
    RelationKind::ManyToMany => Err(Error::schema(format!(
      "many-to-many relation {} -> {} cannot be included",
      model, relation.target
    ))),
  }
}

/// Walk decoded documents and rename storage columns back to schema
/// fields, recursing along the include tree.
pub fn decode_included(
  mapper: &FieldMapper,
  model: &str,
  tree: &IncludeTree,
  doc: &Value,
) -> Result<Value> {
  let mut mapped = mapper.map_column_to_schema_data(model, doc)?;
  let schema = mapper.registry().get(model)?;

  for (name, node) in tree.iter() {
    let Some(relation) = schema.get_relation(name) else {
      continue;
    };
    let Some(nested) = mapped.get(name).cloned() else {
      continue;
    };
    let renamed = match nested {
      Value::Array(items) => {
        let mapped_items: Result<Vec<Value>> = items
          .iter()
          .map(|item| decode_included(mapper, &relation.target, node.children(), item))
          .collect();
        Value::Array(mapped_items?)
      }
      Value::Object(_) => decode_included(mapper, &relation.target, node.children(), &nested)?,
      other => other,
    };
    mapped[name] = renamed;
  }
  Ok(mapped)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn nested_path_absorbs_plain_request() {
    let specs = vec![
      IncludeSpec {
        path: "posts".into(),
        options: IncludeOptions { limit: Some(5), ..Default::default() },
      },
      IncludeSpec { path: "posts.author".into(), options: IncludeOptions::default() },
    ];
    let tree = IncludeTree::build(&specs);
    assert_eq!(tree.nodes.len(), 1);
    let (name, node) = tree.iter().next().unwrap();
    assert_eq!(name, "posts");
    // The shared node keeps the plain request's options.
    assert_eq!(node.options().limit, Some(5));
    assert_eq!(node.children().nodes.len(), 1);
  }

  #[test]
  fn order_of_roots_is_request_order() {
    let specs = vec![
      IncludeSpec { path: "comments".into(), options: IncludeOptions::default() },
      IncludeSpec { path: "posts".into(), options: IncludeOptions::default() },
    ];
    let tree = IncludeTree::build(&specs);
    let names: Vec<&str> = tree.iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["comments", "posts"]);
  }
}
