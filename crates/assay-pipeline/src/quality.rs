use std::fmt;

use serde::{Deserialize, Serialize};

/// Judged quality of a step's outputs, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLabel {
  Unusable,
  Poor,
  Fair,
  Good,
  Excellent,
}

impl QualityLabel {
  pub fn as_str(&self) -> &'static str {
    match self {
      QualityLabel::Unusable => "unusable",
      QualityLabel::Poor => "poor",
      QualityLabel::Fair => "fair",
      QualityLabel::Good => "good",
      QualityLabel::Excellent => "excellent",
    }
  }
}

impl fmt::Display for QualityLabel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
