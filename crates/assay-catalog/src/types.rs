//! Port data types and connection compatibility.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Data carried by a tool port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
  Image,
  Mask,
  /// Raw pixel buffer.
  Array,
  Float,
  Int,
  String,
  Bool,
  List,
  Dict,
  Measurements,
  Parameters,
  Instructions,
}

impl DataType {
  pub fn as_str(&self) -> &'static str {
    match self {
      DataType::Image => "image",
      DataType::Mask => "mask",
      DataType::Array => "array",
      DataType::Float => "float",
      DataType::Int => "int",
      DataType::String => "string",
      DataType::Bool => "bool",
      DataType::List => "list",
      DataType::Dict => "dict",
      DataType::Measurements => "measurements",
      DataType::Parameters => "parameters",
      DataType::Instructions => "instructions",
    }
  }

  /// Whether values of this type are pixel data (images, masks, buffers).
  pub fn is_pixel_data(&self) -> bool {
    matches!(self, DataType::Image | DataType::Mask | DataType::Array)
  }

  pub fn is_numeric(&self) -> bool {
    matches!(self, DataType::Int | DataType::Float)
  }
}

impl fmt::Display for DataType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Decide whether an output port of type `output` may feed an input port of
/// type `input`.
///
/// Exact matches always connect. Pixel data (`image`, `mask`, `array`) and
/// numbers (`int`, `float`) form two equivalence classes. Inputs typed
/// `parameters` or `instructions` accept anything. Every other pair is
/// rejected.
pub fn compatible(output: DataType, input: DataType) -> bool {
  if output == input {
    return true;
  }

  if matches!(input, DataType::Parameters | DataType::Instructions) {
    return true;
  }

  (output.is_pixel_data() && input.is_pixel_data()) || (output.is_numeric() && input.is_numeric())
}

#[cfg(test)]
mod tests {
  use super::*;

  const ALL: [DataType; 12] = [
    DataType::Image,
    DataType::Mask,
    DataType::Array,
    DataType::Float,
    DataType::Int,
    DataType::String,
    DataType::Bool,
    DataType::List,
    DataType::Dict,
    DataType::Measurements,
    DataType::Parameters,
    DataType::Instructions,
  ];

  #[test]
  fn test_exact_match_is_compatible() {
    for ty in ALL {
      assert!(compatible(ty, ty), "{} should accept itself", ty);
    }
  }

  #[test]
  fn test_pixel_class() {
    assert!(compatible(DataType::Mask, DataType::Image));
    assert!(compatible(DataType::Image, DataType::Mask));
    assert!(compatible(DataType::Array, DataType::Image));
    assert!(compatible(DataType::Mask, DataType::Array));
  }

  #[test]
  fn test_numeric_class() {
    assert!(compatible(DataType::Int, DataType::Float));
    assert!(compatible(DataType::Float, DataType::Int));
  }

  #[test]
  fn test_catch_all_inputs() {
    for ty in ALL {
      assert!(compatible(ty, DataType::Parameters));
      assert!(compatible(ty, DataType::Instructions));
    }
  }

  #[test]
  fn test_incompatible_pairs() {
    assert!(!compatible(DataType::Float, DataType::Image));
    assert!(!compatible(DataType::Mask, DataType::Float));
    assert!(!compatible(DataType::String, DataType::Int));
    assert!(!compatible(DataType::Measurements, DataType::Dict));
    assert!(!compatible(DataType::Parameters, DataType::Dict));
    assert!(!compatible(DataType::Instructions, DataType::String));
  }

  #[test]
  fn test_serde_snake_case() {
    let json = serde_json::to_string(&DataType::Measurements).unwrap();
    assert_eq!(json, "\"measurements\"");
    let parsed: DataType = serde_json::from_str("\"mask\"").unwrap();
    assert_eq!(parsed, DataType::Mask);
  }
}
