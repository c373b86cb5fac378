use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
  #[default]
  Asc,
  Desc,
}

impl SortDirection {
  /// Engine encoding: ascending 1, descending -1.
  pub fn as_i64(self) -> i64 {
    match self {
      Self::Asc => 1,
      Self::Desc => -1,
    }
  }
}

/// One ordering key; sequences of these preserve declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
  pub field: String,
  #[serde(default)]
  pub direction: SortDirection,
}

impl SortSpec {
  pub fn asc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: SortDirection::Asc,
    }
  }

  pub fn desc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      direction: SortDirection::Desc,
    }
  }
}
