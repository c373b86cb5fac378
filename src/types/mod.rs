mod command;
mod condition;
mod sort;

pub use command::{stage, Command, CommandOptions, Operation};
pub use condition::{
  escape_regex, like_to_regex, CompareOp, Condition, FieldResolver, IdentityResolver,
};
pub use sort::{SortDirection, SortSpec};
