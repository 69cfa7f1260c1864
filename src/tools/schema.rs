#[cfg(test)]
#[path = "schema_test.rs"]
mod tests;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt::Display};

use crate::models::InputSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    String,
    Integer,
    Number,
    Boolean,
    Array,
}

/// Parameter schema in the shape the host hands to models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
}

impl Schema {
    pub fn new(schema_type: SchemaType) -> Self {
        Self {
            schema_type,
            description: None,
            properties: BTreeMap::new(),
            required: Vec::new(),
            enum_values: Vec::new(),
            items: None,
        }
    }

    /// An object without properties, used for tools that take no arguments.
    pub fn empty_object() -> Self {
        Self::new(SchemaType::Object)
    }
}

impl SchemaType {
    fn parse(type_name: &str) -> Option<Self> {
        match type_name {
            "object" => Some(SchemaType::Object),
            "string" => Some(SchemaType::String),
            "integer" => Some(SchemaType::Integer),
            "number" => Some(SchemaType::Number),
            "boolean" => Some(SchemaType::Boolean),
            "array" => Some(SchemaType::Array),
            _ => None,
        }
    }

    /// Untyped schemas are guessed from their structure, falling back to
    /// string.
    fn infer(schema: &InputSchema) -> Self {
        if let Some(t) = schema.type_name.as_deref().and_then(SchemaType::parse) {
            return t;
        }
        if schema.properties.is_some() {
            SchemaType::Object
        } else if schema.items.is_some() {
            SchemaType::Array
        } else {
            SchemaType::String
        }
    }
}

impl Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SchemaType::Object => "object",
            SchemaType::String => "string",
            SchemaType::Integer => "integer",
            SchemaType::Number => "number",
            SchemaType::Boolean => "boolean",
            SchemaType::Array => "array",
        };
        write!(f, "{}", name)
    }
}

impl From<&InputSchema> for Schema {
    fn from(schema: &InputSchema) -> Self {
        Self {
            schema_type: SchemaType::infer(schema),
            description: schema.description.clone(),
            properties: schema
                .properties
                .iter()
                .flatten()
                .map(|(name, prop)| (name.clone(), Schema::from(prop)))
                .collect(),
            required: schema.required.clone(),
            enum_values: schema
                .enum_values
                .iter()
                .flatten()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            items: schema
                .items
                .as_deref()
                .map(|items| Box::new(Schema::from(items))),
        }
    }
}

impl From<&Schema> for InputSchema {
    fn from(schema: &Schema) -> Self {
        Self {
            type_name: Some(schema.schema_type.to_string()),
            description: schema.description.clone(),
            properties: (!schema.properties.is_empty()).then(|| {
                schema
                    .properties
                    .iter()
                    .map(|(name, prop)| (name.clone(), InputSchema::from(prop)))
                    .collect()
            }),
            required: schema.required.clone(),
            enum_values: (!schema.enum_values.is_empty()).then(|| {
                schema
                    .enum_values
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect()
            }),
            items: schema
                .items
                .as_deref()
                .map(|items| Box::new(InputSchema::from(items))),
        }
    }
}
