mod builder;
mod include;
mod model;

pub use builder::QueryBuilder;
pub use include::{IncludeOptions, IncludeSpec, IncludeTree};
pub use model::{
  DeleteQuery, FieldRef, InsertQuery, ModelQuery, QueryCore, SelectQuery, UpdateQuery, WriteResult,
};
