use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// JSON-level type a validated field must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// Validation rule applied to one field path.
///
/// Rules are evaluated in a fixed order: presence, type, bounds, pattern,
/// enum, recursion into `nested_schema`/`array_items`, then the named custom
/// validator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub required: bool,
    /// Expected type. `None` skips the type check.
    #[serde(default)]
    pub field_type: Option<FieldType>,
    /// Lower bound: string/array length or numeric value.
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper bound: string/array length or numeric value.
    #[serde(default)]
    pub max: Option<f64>,
    /// Full-match regex for strings.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Closed set of allowed values.
    #[serde(default, rename = "enum")]
    pub enum_values: Option<Vec<serde_json::Value>>,
    /// Sub-schema applied when the field is an object.
    #[serde(default)]
    pub nested_schema: Option<BTreeMap<String, ValidationRule>>,
    /// Rule applied to each element when the field is an array.
    #[serde(default)]
    pub array_items: Option<Box<ValidationRule>>,
    /// Name of a custom validator registered at startup.
    #[serde(default)]
    pub custom_validator: Option<String>,
}

/// Per-endpoint payload schema: a map of dotted field paths to rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointValidation {
    pub endpoint_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub schema: BTreeMap<String, ValidationRule>,
}
