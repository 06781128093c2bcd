//! Tool-related types.

use super::ToolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// JSON type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

/// A single declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// A tool definition exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub params: Vec<Param>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    pub fn required(
        self,
        name: impl Into<String>,
        kind: ParamKind,
        description: impl Into<String>,
    ) -> Self {
        self.param(name, kind, true, description)
    }

    pub fn optional(
        self,
        name: impl Into<String>,
        kind: ParamKind,
        description: impl Into<String>,
    ) -> Self {
        self.param(name, kind, false, description)
    }

    fn param(
        mut self,
        name: impl Into<String>,
        kind: ParamKind,
        required: bool,
        description: impl Into<String>,
    ) -> Self {
        self.params.push(Param {
            name: name.into(),
            kind,
            required,
            description: description.into(),
        });
        self
    }

    /// JSON Schema for the tool's arguments object.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            let mut property = Map::new();
            if param.kind != ParamKind::Any {
                property.insert("type".into(), json!(param.kind.as_str()));
            }
            if !param.description.is_empty() {
                property.insert("description".into(), json!(param.description));
            }
            properties.insert(param.name.clone(), Value::Object(property));
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Check call arguments against the declared parameters.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<(), ToolError> {
        if let Some(unknown) = args
            .keys()
            .find(|k| !self.params.iter().any(|p| &p.name == *k))
        {
            return Err(ToolError::InvalidInput(format!("unknown argument '{unknown}'")));
        }
        for param in &self.params {
            match args.get(&param.name) {
                None if param.required => {
                    return Err(ToolError::InvalidInput(format!(
                        "missing required argument '{}'",
                        param.name
                    )));
                }
                Some(value) if !param.kind.matches(value) => {
                    return Err(ToolError::InvalidInput(format!(
                        "argument '{}' must be {}",
                        param.name,
                        param.kind.as_str()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
