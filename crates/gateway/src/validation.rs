use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use serde_json::Value;

use gatehouse_core::{FieldType, ValidationRule};

/// A custom validator registered by name at startup.
pub type CustomValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Validation failures, split into two families: schema defects (the API
/// owner's configuration is broken) and payload defects (the caller's
/// request is invalid). Both surface as 400, with distinct messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Invalid schema: bad field path, unknown custom validator, bad regex.
    Schema(String),
    /// Payload failed a rule: `VAL_MISSING`, `VAL_TYPE`, `VAL_BOUNDS`,
    /// `VAL_PATTERN`, `VAL_ENUM`, `VAL_CUSTOM`.
    Payload(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(msg) => write!(f, "invalid validation schema: {msg}"),
            Self::Payload(msg) => f.write_str(msg),
        }
    }
}

/// Schema-driven payload validation for JSON, SOAP, and GraphQL requests.
///
/// Rules are evaluated per dotted field path in a fixed order; object and
/// array recursion happens through `nested_schema` and `array_items`.
#[derive(Default)]
pub struct ValidationEngine {
    custom: HashMap<String, CustomValidator>,
}

impl ValidationEngine {
    /// Create an engine with no custom validators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named custom validator. Later registrations win.
    pub fn register_custom(
        &mut self,
        name: impl Into<String>,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.custom.insert(name.into(), Arc::new(validator));
    }

    /// Validate a JSON payload against a schema map.
    pub fn validate(
        &self,
        schema: &BTreeMap<String, ValidationRule>,
        payload: &Value,
    ) -> Result<(), ValidationError> {
        for (path, rule) in schema {
            let segments = Self::parse_path(path)?;
            let value = Self::lookup(payload, &segments);
            self.apply_rule(path, rule, value)?;
        }
        Ok(())
    }

    /// Validate a SOAP envelope: the body's first child element is the root
    /// document the schema applies to.
    pub fn validate_soap(
        &self,
        schema: &BTreeMap<String, ValidationRule>,
        xml: &[u8],
    ) -> Result<(), ValidationError> {
        let root = soap_body_document(xml)?;
        self.validate(schema, &root)
    }

    /// Validate a GraphQL request: schema paths walk
    /// `OperationName.argument.field...` over the operation's merged
    /// top-level field arguments.
    pub fn validate_graphql(
        &self,
        schema: &BTreeMap<String, ValidationRule>,
        query: &str,
    ) -> Result<(), ValidationError> {
        let document = graphql_operations(query)?;
        self.validate(schema, &document)
    }

    fn parse_path(path: &str) -> Result<Vec<&str>, ValidationError> {
        if path.is_empty() {
            return Err(ValidationError::Schema("empty field path".into()));
        }
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ValidationError::Schema(format!(
                "field path '{path}' contains an empty segment"
            )));
        }
        Ok(segments)
    }

    fn lookup<'a>(payload: &'a Value, segments: &[&str]) -> Option<&'a Value> {
        let mut current = payload;
        for segment in segments {
            current = current.as_object()?.get(*segment)?;
        }
        Some(current)
    }

    fn type_matches(expected: FieldType, value: &Value) -> bool {
        match expected {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    /// Numeric magnitude used for `min`/`max`: length for strings and
    /// arrays, the value itself for numbers.
    fn magnitude(value: &Value) -> Option<f64> {
        match value {
            #[allow(clippy::cast_precision_loss)]
            Value::String(s) => Some(s.chars().count() as f64),
            #[allow(clippy::cast_precision_loss)]
            Value::Array(items) => Some(items.len() as f64),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    fn apply_rule(
        &self,
        path: &str,
        rule: &ValidationRule,
        value: Option<&Value>,
    ) -> Result<(), ValidationError> {
        // 1. Presence.
        let Some(value) = value else {
            if rule.required {
                return Err(ValidationError::Payload(format!(
                    "VAL_MISSING: field '{path}' is required"
                )));
            }
            return Ok(());
        };

        // 2. Type.
        if let Some(expected) = rule.field_type
            && !Self::type_matches(expected, value)
        {
            return Err(ValidationError::Payload(format!(
                "VAL_TYPE: field '{path}' must be of type {expected}"
            )));
        }

        // 3. Bounds.
        if rule.min.is_some() || rule.max.is_some() {
            if let Some(magnitude) = Self::magnitude(value) {
                if let Some(min) = rule.min
                    && magnitude < min
                {
                    return Err(ValidationError::Payload(format!(
                        "VAL_BOUNDS: field '{path}' is below the minimum of {min}"
                    )));
                }
                if let Some(max) = rule.max
                    && magnitude > max
                {
                    return Err(ValidationError::Payload(format!(
                        "VAL_BOUNDS: field '{path}' exceeds the maximum of {max}"
                    )));
                }
            }
        }

        // 4. Pattern (full match on strings).
        if let Some(pattern) = &rule.pattern
            && let Some(text) = value.as_str()
        {
            let anchored = format!("^(?:{pattern})$");
            let regex = Regex::new(&anchored).map_err(|e| {
                ValidationError::Schema(format!("invalid pattern for '{path}': {e}"))
            })?;
            if !regex.is_match(text) {
                return Err(ValidationError::Payload(format!(
                    "VAL_PATTERN: field '{path}' does not match the required pattern"
                )));
            }
        }

        // 5. Enum.
        if let Some(allowed) = &rule.enum_values
            && !allowed.contains(value)
        {
            return Err(ValidationError::Payload(format!(
                "VAL_ENUM: field '{path}' is not one of the allowed values"
            )));
        }

        // 6. Recursion.
        if let Some(nested) = &rule.nested_schema
            && value.is_object()
        {
            for (sub_path, sub_rule) in nested {
                let segments = Self::parse_path(sub_path)?;
                let sub_value = Self::lookup(value, &segments);
                self.apply_rule(&format!("{path}.{sub_path}"), sub_rule, sub_value)?;
            }
        }
        if let Some(item_rule) = &rule.array_items
            && let Some(items) = value.as_array()
        {
            for (index, item) in items.iter().enumerate() {
                self.apply_rule(&format!("{path}[{index}]"), item_rule, Some(item))?;
            }
        }

        // 7. Custom validator, last.
        if let Some(name) = &rule.custom_validator {
            let validator = self.custom.get(name).ok_or_else(|| {
                ValidationError::Schema(format!("unknown custom validator '{name}'"))
            })?;
            validator(value).map_err(|msg| {
                ValidationError::Payload(format!("VAL_CUSTOM: field '{path}': {msg}"))
            })?;
        }

        Ok(())
    }
}

/// Coerce XML text content: numbers and booleans become typed JSON values,
/// everything else stays a string.
fn coerce_text(text: &str) -> Value {
    let trimmed = text.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(trimmed.to_owned())
}

fn local_name(qname: &[u8]) -> String {
    let name = qname.rsplit(|b| *b == b':').next().unwrap_or(qname);
    String::from_utf8_lossy(name).into_owned()
}

/// Parse a SOAP envelope and return the body's first child element as a
/// JSON document keyed by element names. External entities and DTDs are
/// rejected outright; the reader never resolves references.
fn soap_body_document(xml: &[u8]) -> Result<Value, ValidationError> {
    #[derive(Default)]
    struct Node {
        children: Vec<(String, Node)>,
        text: String,
    }

    fn into_value(node: Node) -> Value {
        if node.children.is_empty() {
            return coerce_text(&node.text);
        }
        let mut map = serde_json::Map::new();
        for (name, child) in node.children {
            let value = into_value(child);
            match map.get_mut(&name) {
                // Repeated sibling names collapse into an array.
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let prior = existing.take();
                    *existing = Value::Array(vec![prior, value]);
                }
                None => {
                    map.insert(name, value);
                }
            }
        }
        Value::Object(map)
    }

    let mut reader = Reader::from_reader(xml);

    let mut stack: Vec<(String, Node)> = Vec::new();
    let mut root: Option<Value> = None;
    let mut depth_in_body = 0usize;
    let mut in_body = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::DocType(_)) => {
                return Err(ValidationError::Payload(
                    "VAL_XML: DTD declarations are not allowed".into(),
                ));
            }
            Ok(Event::Start(start)) => {
                let name = local_name(start.name().as_ref());
                if in_body {
                    depth_in_body += 1;
                    stack.push((name, Node::default()));
                } else if name == "Body" {
                    in_body = true;
                }
            }
            Ok(Event::Empty(start)) => {
                if in_body {
                    let name = local_name(start.name().as_ref());
                    if let Some((_, parent)) = stack.last_mut() {
                        parent.children.push((name, Node::default()));
                    } else if root.is_none() {
                        let mut map = serde_json::Map::new();
                        map.insert(name, into_value(Node::default()));
                        root = Some(Value::Object(map));
                    }
                }
            }
            Ok(Event::Text(text)) => {
                if let Some((_, node)) = stack.last_mut() {
                    let decoded = text.unescape().map_err(|e| {
                        ValidationError::Payload(format!("VAL_XML: invalid text: {e}"))
                    })?;
                    node.text.push_str(&decoded);
                }
            }
            Ok(Event::End(end)) => {
                let name = local_name(end.name().as_ref());
                if in_body && depth_in_body > 0 {
                    depth_in_body -= 1;
                    let (child_name, child) = stack
                        .pop()
                        .ok_or_else(|| ValidationError::Payload("VAL_XML: malformed".into()))?;
                    if let Some((_, parent)) = stack.last_mut() {
                        parent.children.push((child_name, child));
                    } else if root.is_none() {
                        // First child of Body is the document root.
                        let mut map = serde_json::Map::new();
                        map.insert(child_name, into_value(child));
                        root = Some(Value::Object(map));
                    }
                } else if in_body && name == "Body" {
                    in_body = false;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ValidationError::Payload(format!(
                    "VAL_XML: invalid XML: {e}"
                )));
            }
        }
        buf.clear();
    }

    root.ok_or_else(|| ValidationError::Payload("VAL_XML: SOAP body is empty".into()))
}

/// Convert a GraphQL value into JSON. Variables resolve to null; enums
/// become strings.
fn graphql_value_to_json(value: &graphql_parser::query::Value<'_, String>) -> Value {
    use graphql_parser::query::Value as GqlValue;
    match value {
        GqlValue::Variable(_) | GqlValue::Null => Value::Null,
        GqlValue::Int(n) => n.as_i64().map_or(Value::Null, Value::from),
        GqlValue::Float(f) => Value::from(*f),
        GqlValue::String(s) => Value::String(s.clone()),
        GqlValue::Boolean(b) => Value::Bool(*b),
        GqlValue::Enum(e) => Value::String(e.clone()),
        GqlValue::List(items) => Value::Array(items.iter().map(graphql_value_to_json).collect()),
        GqlValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), graphql_value_to_json(v)))
                .collect(),
        ),
    }
}

/// Parse a GraphQL query and build `{operation_name: {arg: value, ...}}`
/// from the merged arguments of the operation's top-level fields.
fn graphql_operations(query: &str) -> Result<Value, ValidationError> {
    use graphql_parser::query::{Definition, OperationDefinition, Selection};

    let document = graphql_parser::parse_query::<String>(query)
        .map_err(|e| ValidationError::Payload(format!("VAL_GRAPHQL: invalid query: {e}")))?;

    let mut operations = serde_json::Map::new();
    for definition in &document.definitions {
        let Definition::Operation(operation) = definition else {
            continue;
        };
        let (name, selection_set) = match operation {
            OperationDefinition::Query(q) => (q.name.clone(), &q.selection_set),
            OperationDefinition::Mutation(m) => (m.name.clone(), &m.selection_set),
            OperationDefinition::Subscription(s) => (s.name.clone(), &s.selection_set),
            OperationDefinition::SelectionSet(set) => (None, set),
        };
        let Some(name) = name else { continue };

        let mut args = serde_json::Map::new();
        for selection in &selection_set.items {
            if let Selection::Field(field) = selection {
                for (arg_name, arg_value) in &field.arguments {
                    args.insert(arg_name.clone(), graphql_value_to_json(arg_value));
                }
            }
        }
        operations.insert(name, Value::Object(args));
    }

    Ok(Value::Object(operations))
}
