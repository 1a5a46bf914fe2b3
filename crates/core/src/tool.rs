//! Tool declaration types shared by `ContextAssembler` (which hands a
//! filtered tool list to a [`crate::formatter::ProviderFormatter`]) and the
//! registry that owns dispatch.

use std::collections::HashMap;
use std::fmt;

use schemars::schema::{InstanceType, Metadata, ObjectValidation, Schema, SchemaObject, SingleOrVec};
use schemars::{gen::SchemaGenerator, JsonSchema};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A parameter inside a [`ParametersSchema`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParameterProperty {
    #[serde(rename = "type")]
    pub property_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParameterProperty>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "enum")]
    pub enum_list: Option<Vec<String>>,
}

/// JSON-schema-shaped parameter declaration for a [`FunctionTool`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParametersSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: HashMap<String, ParameterProperty>,
    pub required: Vec<String>,
}

/// A function definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FunctionTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Structured-output request, following OpenAI's `response_format` shape.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct StructuredOutputFormat {
    pub name: String,
    pub description: Option<String>,
    pub schema: Option<Value>,
    pub strict: Option<bool>,
}

/// A tool the model may call, as declared to a provider.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionTool,
}

/// How a formatter should constrain the model's tool use for one request.
#[derive(Debug, Clone, Default)]
pub enum ToolChoice {
    /// Model must call at least one tool.
    Any,
    /// Model may call zero or more tools.
    #[default]
    Auto,
    /// Model must call exactly the named tool.
    Tool(String),
    /// Tool use is disabled for this request.
    None,
}

impl Serialize for ToolChoice {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ToolChoice::Any => serializer.serialize_str("required"),
            ToolChoice::Auto => serializer.serialize_str("auto"),
            ToolChoice::None => serializer.serialize_str("none"),
            ToolChoice::Tool(name) => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "function")?;
                let mut function_obj = HashMap::new();
                function_obj.insert("name", name.as_str());
                map.serialize_entry("function", &function_obj)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ToolChoice {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ToolChoiceVisitor;

        impl<'de> Visitor<'de> for ToolChoiceVisitor {
            type Value = ToolChoice;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(
                    "a string (`required`, `auto`, `none`) or an object `{ type: \"function\", function: { name: ... } }`",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match value {
                    "required" => Ok(ToolChoice::Any),
                    "auto" => Ok(ToolChoice::Auto),
                    "none" => Ok(ToolChoice::None),
                    other => Err(de::Error::unknown_variant(other, &["required", "auto", "none"])),
                }
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut seen_name: Option<String> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "type" => {
                            let t: String = map.next_value()?;
                            if t != "function" {
                                return Err(de::Error::invalid_value(de::Unexpected::Str(&t), &"function"));
                            }
                        }
                        "function" => {
                            let func_map: serde_json::Map<String, serde_json::Value> = map.next_value()?;
                            if let Some(serde_json::Value::String(name)) = func_map.get("name") {
                                seen_name = Some(name.clone());
                            } else {
                                return Err(de::Error::missing_field("name"));
                            }
                        }
                        _ => {
                            let _ignored: serde_json::Value = map.next_value()?;
                        }
                    }
                }
                let name = seen_name.ok_or_else(|| de::Error::missing_field("function"))?;
                Ok(ToolChoice::Tool(name))
            }
        }

        deserializer.deserialize_any(ToolChoiceVisitor)
    }
}

impl JsonSchema for ToolChoice {
    fn schema_name() -> String {
        "ToolChoice".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        let str_schema = SchemaObject {
            instance_type: Some(SingleOrVec::Single(Box::new(InstanceType::String))),
            metadata: Some(Box::new(Metadata {
                description: Some("One of the string options: \"required\", \"auto\", \"none\"".to_string()),
                ..Default::default()
            })),
            enum_values: Some(vec![
                serde_json::Value::String("required".to_string()),
                serde_json::Value::String("auto".to_string()),
                serde_json::Value::String("none".to_string()),
            ]),
            ..Default::default()
        };

        let mut func_obj = ObjectValidation::default();
        func_obj.required.insert("type".to_string());
        func_obj.required.insert("function".to_string());
        func_obj.properties.insert(
            "type".to_string(),
            Schema::Object(SchemaObject {
                instance_type: Some(SingleOrVec::Single(Box::new(InstanceType::String))),
                enum_values: Some(vec![serde_json::Value::String("function".to_string())]),
                ..Default::default()
            }),
        );
        let mut inner = ObjectValidation::default();
        inner.required.insert("name".to_string());
        inner.properties.insert(
            "name".to_string(),
            Schema::Object(SchemaObject {
                instance_type: Some(SingleOrVec::Single(Box::new(InstanceType::String))),
                ..Default::default()
            }),
        );
        func_obj.properties.insert(
            "function".to_string(),
            Schema::Object(SchemaObject {
                instance_type: Some(SingleOrVec::Single(Box::new(InstanceType::Object))),
                object: Some(Box::new(inner)),
                ..Default::default()
            }),
        );

        let mut schema = SchemaObject::default();
        schema.subschemas = Some(Box::new(schemars::schema::SubschemaValidation {
            any_of: Some(vec![
                Schema::Object(str_schema),
                Schema::Object(SchemaObject {
                    instance_type: Some(SingleOrVec::Single(Box::new(InstanceType::Object))),
                    object: Some(Box::new(func_obj)),
                    ..Default::default()
                }),
            ]),
            ..Default::default()
        }));

        Schema::Object(schema)
    }
}

/// How tool calls are encoded on the wire for a given channel/model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    /// Provider-native function-calling.
    FunctionCall,
    /// Model emits `<tool_use>...</tool_use>` markup inline in text.
    Xml,
    /// Model emits a fenced/standalone JSON object inline in text.
    Json,
}

/// Renders the textual tool-definition block injected into the system
/// instruction for `xml`/`json` tool modes (§4.2 "Tool definition
/// encoding"). Native (`function_call`) mode returns an empty string since
/// that dialect encodes tools in its own structured request field instead.
pub fn render_tool_block(tools: &[Tool], mode: ToolMode) -> String {
    match mode {
        ToolMode::FunctionCall => String::new(),
        ToolMode::Xml => render_xml_tool_block(tools),
        ToolMode::Json => render_json_tool_block(tools),
    }
}

fn render_xml_tool_block(tools: &[Tool]) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let mut block = String::from(
        "You can call tools by emitting a block of the form:\n\
         <tool_use><tool_name>NAME</tool_name><parameters><param_name>value</param_name>...</parameters></tool_use>\n\n\
         Available tools:\n",
    );
    for tool in tools {
        block.push_str(&format!("- {}: {}\n", tool.function.name, tool.function.description));
        if let Some(props) = tool.function.parameters.get("properties").and_then(|v| v.as_object()) {
            let required: Vec<&str> = tool
                .function
                .parameters
                .get("required")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();
            for (name, schema) in props {
                let param_type = schema.get("type").and_then(|v| v.as_str()).unwrap_or("string");
                let description = schema.get("description").and_then(|v| v.as_str()).unwrap_or("");
                let is_required = required.contains(&name.as_str());
                block.push_str(&format!(
                    "    {name} ({param_type}{}): {description}\n",
                    if is_required { ", required" } else { ", optional" }
                ));
            }
        }
    }
    block
}

fn render_json_tool_block(tools: &[Tool]) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let mut block = String::from(
        "You can call tools by emitting a fenced block of the form:\n\
         <<<TOOL_CALL>>>{\"tool\": \"NAME\", \"parameters\": {...}}<<<END_TOOL_CALL>>>\n\n\
         Available tools:\n",
    );
    for tool in tools {
        block.push_str(&format!(
            "- {}: {} (parameters schema: {})\n",
            tool.function.name, tool.function.description, tool.function.parameters
        ));
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn xml_tool_block_lists_required_and_optional_params() {
        let tools = vec![Tool {
            tool_type: "function".into(),
            function: FunctionTool {
                name: "read_file".into(),
                description: "Reads a file".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"path": {"type": "string", "description": "file path"}},
                    "required": ["path"],
                }),
            },
        }];
        let block = render_tool_block(&tools, ToolMode::Xml);
        assert!(block.contains("read_file"));
        assert!(block.contains("path (string, required): file path"));
    }

    #[test]
    fn function_call_mode_renders_empty_block() {
        assert_eq!(render_tool_block(&[], ToolMode::FunctionCall), "");
    }

    #[test]
    fn tool_choice_string_variants_round_trip() {
        for (value, expected) in [("auto", ToolChoice::Auto), ("required", ToolChoice::Any), ("none", ToolChoice::None)] {
            let decoded: ToolChoice = serde_json::from_value(json!(value)).unwrap();
            assert_eq!(serde_json::to_value(&decoded).unwrap(), serde_json::to_value(&expected).unwrap());
        }
    }

    #[test]
    fn tool_choice_named_tool_round_trips_through_object_form() {
        let decoded: ToolChoice =
            serde_json::from_value(json!({"type": "function", "function": {"name": "list_files"}})).unwrap();
        assert!(matches!(decoded, ToolChoice::Tool(ref n) if n == "list_files"));
    }
}
