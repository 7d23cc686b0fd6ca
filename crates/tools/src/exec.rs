//! Tool execution dispatch.
//!
//! A tool invocation always resolves to a single string — failures become
//! `[ToolError] ...` strings the model can read and react to, never
//! errors that cross the loop boundary.
//!
//! Dispatch by kind: native tools call a registered in-process handler by
//! entry point; the script kinds (python/node/shell) hand the descriptor
//! and raw arguments to a pluggable sandbox runner. Without a handler or
//! runner the result is an explicit `[STUB]` so the model knows nothing
//! ran.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use agentforge_core::error::ToolError;
use agentforge_core::tool::{ToolDescriptor, ToolKind};

use crate::registry::ToolRegistry;

/// An in-process tool implementation, registered under an entry point.
#[async_trait]
pub trait NativeToolHandler: Send + Sync {
    /// `arguments` is the model-produced JSON string, forwarded verbatim.
    async fn execute(&self, arguments: &str) -> Result<String, ToolError>;
}

/// Sandbox hook for script tools. Execution environment is external to
/// the engine; the runner receives the descriptor (script payload, entry
/// point) and the verbatim arguments JSON.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, tool: &ToolDescriptor, arguments: &str) -> Result<String, ToolError>;
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    native_handlers: HashMap<String, Arc<dyn NativeToolHandler>>,
    script_runner: Option<Arc<dyn ScriptRunner>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            native_handlers: HashMap::new(),
            script_runner: None,
        }
    }

    /// Register a native handler under its entry point name.
    pub fn register_native(
        mut self,
        entry_point: impl Into<String>,
        handler: Arc<dyn NativeToolHandler>,
    ) -> Self {
        self.native_handlers.insert(entry_point.into(), handler);
        self
    }

    pub fn with_script_runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.script_runner = Some(runner);
        self
    }

    /// Execute a catalogued tool by name. The built-in memory tools are
    /// dispatched by the agent loop before reaching here.
    pub async fn execute(&self, tool_name: &str, arguments: &str, session_id: &str) -> String {
        info!(session_id, tool = tool_name, args = arguments, "executing tool");

        let descriptor = match self.registry.find(tool_name).await {
            Ok(Some(d)) => d,
            Ok(None) => return format!("[ToolError] Unknown tool: {tool_name}"),
            Err(e) => {
                warn!(tool = tool_name, error = %e, "tool lookup failed");
                return format!("[ToolError] Tool lookup failed: {e}");
            }
        };

        match descriptor.kind {
            ToolKind::Native => self.execute_native(&descriptor, arguments).await,
            ToolKind::Python | ToolKind::Node | ToolKind::Shell => {
                self.execute_script(&descriptor, arguments).await
            }
        }
    }

    async fn execute_native(&self, tool: &ToolDescriptor, arguments: &str) -> String {
        let entry_point = tool.entry_point.as_deref().unwrap_or(&tool.tool_name);
        debug!(tool = %tool.tool_name, entry_point, "native tool dispatch");

        let Some(handler) = self.native_handlers.get(entry_point) else {
            return format!(
                "[STUB] Native tool '{}' has no registered handler. args={arguments}",
                tool.tool_name
            );
        };

        match handler.execute(arguments).await {
            Ok(output) => output,
            Err(e) => format!("[ToolError] {}: {e}", tool.tool_name),
        }
    }

    async fn execute_script(&self, tool: &ToolDescriptor, arguments: &str) -> String {
        debug!(tool = %tool.tool_name, kind = %tool.kind, "script tool dispatch");

        let Some(runner) = &self.script_runner else {
            return format!(
                "[STUB] Script tool '{}' ({}) would execute here. args={arguments}",
                tool.tool_name, tool.kind
            );
        };

        match runner.run(tool, arguments).await {
            Ok(output) => output,
            Err(e) => format!("[ToolError] {}: {e}", tool.tool_name),
        }
    }
}
