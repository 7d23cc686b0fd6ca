//! Tool descriptors and the tool store trait.
//!
//! A tool descriptor is what the catalog persists; a `ToolDefinition` is
//! the wire shape injected into the model's `tools` array. The JSON Schema
//! in `input_schema` travels verbatim from storage to the wire.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// How a tool is executed.
///
/// Native tools dispatch to a registered in-process handler by entry point;
/// the script kinds hand their payload to a pluggable sandbox runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolKind {
    Native,
    Python,
    Node,
    Shell,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "NATIVE",
            Self::Python => "PYTHON",
            Self::Node => "NODE",
            Self::Shell => "SHELL",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NATIVE" => Ok(Self::Native),
            "PYTHON" => Ok(Self::Python),
            "NODE" => Ok(Self::Node),
            "SHELL" => Ok(Self::Shell),
            other => Err(format!("unknown tool kind: {other}")),
        }
    }
}

/// One catalogued tool the agent can invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: i64,

    /// Unique machine-readable identifier, used as the function name in
    /// LLM calls.
    pub tool_name: String,

    /// Natural-language description sent to the LLM so it knows when to
    /// call this tool.
    pub tool_description: String,

    /// JSON Schema object describing the tool's parameters, stored and
    /// forwarded verbatim.
    pub input_schema: serde_json::Value,

    pub kind: ToolKind,

    /// Raw script source for the script kinds; None for native tools.
    pub script_content: Option<String>,

    /// Native: handler registration name. Script kinds: suggested filename.
    pub entry_point: Option<String>,

    pub is_active: bool,
}

impl ToolDescriptor {
    /// Wire representation for the model's `tools` array.
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            &self.tool_name,
            &self.tool_description,
            self.input_schema.clone(),
        )
    }
}

/// One entry in the `tools` array sent to the LLM.
///
/// Wire format:
/// `{"type":"function","function":{"name":...,"description":...,"parameters":{...}}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: "function".into(),
            function: ToolFunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Persistence boundary for the tool catalog.
#[async_trait]
pub trait ToolStore: Send + Sync {
    async fn find_by_name(&self, tool_name: &str) -> std::result::Result<Option<ToolDescriptor>, StoreError>;

    async fn list_active(&self) -> std::result::Result<Vec<ToolDescriptor>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_kind_roundtrip() {
        for k in [ToolKind::Native, ToolKind::Python, ToolKind::Node, ToolKind::Shell] {
            let parsed: ToolKind = k.as_str().parse().unwrap();
            assert_eq!(parsed, k);
        }
    }

    #[test]
    fn definition_wire_shape() {
        let def = ToolDefinition::function(
            "web_search",
            "Search the web",
            serde_json::json!({"type":"object","properties":{"query":{"type":"string"}},"required":["query"]}),
        );
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "web_search");
        assert_eq!(json["function"]["parameters"]["required"][0], "query");
    }

    #[test]
    fn descriptor_schema_travels_verbatim() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "x": { "type": "integer", "minimum": 1 } }
        });
        let desc = ToolDescriptor {
            id: 1,
            tool_name: "t".into(),
            tool_description: "d".into(),
            input_schema: schema.clone(),
            kind: ToolKind::Python,
            script_content: Some("print('hi')".into()),
            entry_point: Some("t.py".into()),
            is_active: true,
        };
        assert_eq!(desc.to_definition().function.parameters, schema);
    }
}
