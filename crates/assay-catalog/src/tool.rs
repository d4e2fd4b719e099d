use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::DataType;

/// Values keyed by port name: the resolved inputs or the produced outputs of a
/// single tool invocation.
pub type PortValues = serde_json::Map<String, Value>;

fn default_required() -> bool {
  true
}

fn default_category() -> String {
  "general".to_string()
}

/// A single typed input or output port of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
  pub name: String,
  #[serde(rename = "type")]
  pub data_type: DataType,
  #[serde(default)]
  pub description: String,
  #[serde(default = "default_required")]
  pub required: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<Value>,

  /// Lower bound for numeric values.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub min_value: Option<f64>,
  /// Upper bound for numeric values.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_value: Option<f64>,
  /// Allowed values for string ports.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub choices: Option<Vec<String>>,
}

impl PortSpec {
  pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
    Self {
      name: name.into(),
      data_type,
      description: String::new(),
      required: true,
      default: None,
      min_value: None,
      max_value: None,
      choices: None,
    }
  }

  /// A required port with no default.
  pub fn required(name: impl Into<String>, data_type: DataType) -> Self {
    Self::new(name, data_type)
  }

  /// An optional port that falls back to `default` when unbound.
  pub fn optional(name: impl Into<String>, data_type: DataType, default: Value) -> Self {
    Self {
      required: false,
      default: Some(default),
      ..Self::new(name, data_type)
    }
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn with_range(mut self, min: f64, max: f64) -> Self {
    self.min_value = Some(min);
    self.max_value = Some(max);
    self
  }

  pub fn with_choices<I, S>(mut self, choices: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.choices = Some(choices.into_iter().map(Into::into).collect());
    self
  }

  /// Convert a value across the numeric equivalence class so it matches this
  /// port's type. Integer ports round incoming floats, float ports widen
  /// incoming integers. Anything else passes through unchanged.
  pub fn coerce(&self, value: Value) -> Value {
    match (self.data_type, &value) {
      (DataType::Int, Value::Number(n)) if !n.is_i64() && !n.is_u64() => n
        .as_f64()
        .map(|f| Value::from(f.round() as i64))
        .unwrap_or(value),
      (DataType::Float, Value::Number(n)) if n.is_i64() || n.is_u64() => n
        .as_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(value),
      _ => value,
    }
  }

  /// Check a candidate value against this port's type and constraints,
  /// returning the coerced value when acceptable.
  pub fn check(&self, value: Value) -> Result<Value, String> {
    let value = self.coerce(value);

    if self.data_type.is_numeric() {
      let Some(number) = value.as_f64() else {
        return Err(format!(
          "port '{}' expects a {} value, got {}",
          self.name, self.data_type, value
        ));
      };
      if let Some(min) = self.min_value
        && number < min
      {
        return Err(format!("value {} below minimum {}", number, min));
      }
      if let Some(max) = self.max_value
        && number > max
      {
        return Err(format!("value {} above maximum {}", number, max));
      }
    }

    if self.data_type == DataType::Bool && !value.is_boolean() {
      return Err(format!("port '{}' expects a bool value, got {}", self.name, value));
    }

    if let Some(choices) = &self.choices {
      let candidate = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      if !choices.iter().any(|c| *c == candidate) {
        return Err(format!(
          "value {} not in allowed choices: {}",
          candidate,
          choices.join(", ")
        ));
      }
    }

    Ok(value)
  }
}

/// Static description of a step kind: identity plus ordered typed ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
  pub tool_id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default = "default_category")]
  pub category: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub inputs: Vec<PortSpec>,
  #[serde(default)]
  pub outputs: Vec<PortSpec>,
}

impl ToolDefinition {
  pub fn new(tool_id: impl Into<String>, category: impl Into<String>) -> Self {
    let tool_id = tool_id.into();
    Self {
      name: tool_id.clone(),
      tool_id,
      category: category.into(),
      description: String::new(),
      tags: Vec::new(),
      inputs: Vec::new(),
      outputs: Vec::new(),
    }
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn with_tags<I, S>(mut self, tags: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.tags = tags.into_iter().map(Into::into).collect();
    self
  }

  pub fn input(mut self, port: PortSpec) -> Self {
    self.inputs.push(port);
    self
  }

  pub fn output(mut self, name: impl Into<String>, data_type: DataType) -> Self {
    let mut port = PortSpec::new(name, data_type);
    port.required = false;
    self.outputs.push(port);
    self
  }

  pub fn get_input(&self, name: &str) -> Option<&PortSpec> {
    self.inputs.iter().find(|p| p.name == name)
  }

  pub fn get_output(&self, name: &str) -> Option<&PortSpec> {
    self.outputs.iter().find(|p| p.name == name)
  }

  /// Human-readable multi-line summary of the tool and its ports.
  pub fn describe(&self) -> String {
    let mut lines = vec![
      format!("{} ({})", self.name, self.tool_id),
      format!("  category: {}", self.category),
    ];
    if !self.description.is_empty() {
      lines.push(format!("  {}", self.description));
    }
    lines.push("  inputs:".to_string());
    for port in &self.inputs {
      let req = match (&port.default, port.required) {
        (_, true) => "required".to_string(),
        (Some(default), false) => format!("optional, default={}", default),
        (None, false) => "optional".to_string(),
      };
      lines.push(format!("    - {} ({}) [{}]", port.name, port.data_type, req));
    }
    lines.push("  outputs:".to_string());
    for port in &self.outputs {
      lines.push(format!("    - {} ({})", port.name, port.data_type));
    }
    lines.join("\n")
  }
}
