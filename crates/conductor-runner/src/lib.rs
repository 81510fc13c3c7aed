pub mod control;
pub mod delegate;
pub mod error;
pub mod executor;
pub mod graph;
pub mod handler;
pub mod retry;
pub mod run_log;
pub mod runner;
pub mod state;
pub mod store;
pub mod summary;

pub use control::ControlSurface;
pub use delegate::{DelegateClient, DelegateReply, DelegateTurn, ToolRequest, ToolResponse};
pub use error::{FailureClass, NodeError};
pub use executor::{DelegateLimits, NodeExecutor, NodeOutcome, NodeTask};
pub use graph::{GraphPlan, GraphSpec, NodeSpec, RetrySpec};
pub use handler::{HandlerRegistry, NoopHandler, ToolCall, ToolError, ToolHandler, ToolOutput};
pub use retry::RetryPolicy;
pub use run_log::{Redactor, RunLogger};
pub use runner::{GraphRunner, RunControl};
pub use state::{FailureRecord, NodeState, NodeStatus, RunOptions, RunSnapshot};
pub use store::{RunRecord, SnapshotStore};
pub use summary::ResultCard;
