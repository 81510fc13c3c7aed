use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use conductor_core::types::RunId;
use conductor_gate::{Artifact, ArtifactSet};

/// One invocation of a routed tool.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub run_id: RunId,
    pub node_id: String,
    pub tool: String,
    pub capability: String,
    pub params: serde_json::Value,
    pub attempt: u32,
    /// Cancelled when the run is cancelled. Handlers should stop promptly.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub artifacts: ArtifactSet,
    pub summary: Option<String>,
}

impl ToolOutput {
    pub fn new(artifacts: ArtifactSet) -> Self {
        Self {
            artifacts,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Failure reported by a tool handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolError {
    pub message: String,
    pub transient: bool,
}

impl ToolError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ToolError {}

/// A concrete tool the router can select.
pub trait ToolHandler: Send + Sync + 'static {
    fn invoke(&self, call: ToolCall) -> BoxFuture<'_, Result<ToolOutput, ToolError>>;
}

/// Tool handlers keyed by tool id.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    fallback: Option<Arc<dyn ToolHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Into<String>, handler: impl ToolHandler) {
        self.handlers.insert(tool.into(), Arc::new(handler));
    }

    pub fn register_arc(&mut self, tool: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(tool.into(), handler);
    }

    /// Handler used for tools with no registration of their own.
    pub fn set_fallback(&mut self, handler: impl ToolHandler) {
        self.fallback = Some(Arc::new(handler));
    }

    pub fn get(&self, tool: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers
            .get(tool)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Echoes the call parameters back as a single `output` artifact.
pub struct NoopHandler;

impl ToolHandler for NoopHandler {
    fn invoke(&self, call: ToolCall) -> BoxFuture<'_, Result<ToolOutput, ToolError>> {
        Box::pin(async move {
            let artifacts = ArtifactSet::new().with("output", Artifact::json(call.params));
            let summary = format!("{} via {}", call.capability, call.tool);
            Ok(ToolOutput::new(artifacts).with_summary(summary))
        })
    }
}
