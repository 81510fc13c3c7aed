//! Protocol between the delegated engine and an external reasoning process.
//!
//! The executor sends a [`DelegateTurn`] carrying the node context and the
//! results of the previous round of tool requests. The delegate answers with
//! more tool requests or with the node's final artifacts. Every request is
//! routed through the capability router; denied requests come back to the
//! delegate as failed [`ToolResponse`]s carrying the router decision.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use conductor_core::types::RunId;
use conductor_gate::ArtifactSet;
use conductor_router::RouterDecision;

use crate::handler::ToolError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateTurn {
    pub run_id: RunId,
    pub node_id: String,
    pub capability: String,
    pub params: serde_json::Value,
    /// Zero-based iteration of the loop.
    pub iteration: u32,
    /// Responses to the requests of the previous turn, in request order.
    pub results: Vec<ToolResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub capability: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ToolRequest {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub request_id: String,
    pub capability: String,
    pub ok: bool,
    pub decision: RouterDecision,
    #[serde(default)]
    pub artifacts: ArtifactSet,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum DelegateReply {
    ToolRequests(Vec<ToolRequest>),
    Done(ArtifactSet),
}

/// An external reasoning process driven one turn at a time.
pub trait DelegateClient: Send + Sync + 'static {
    fn step(&self, turn: DelegateTurn) -> BoxFuture<'_, Result<DelegateReply, ToolError>>;
}
