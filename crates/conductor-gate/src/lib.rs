pub mod artifact;
pub mod contract;
pub mod evaluator;
pub mod schema;

pub use artifact::{Artifact, ArtifactSet};
pub use contract::{ArtifactContract, ContractKind, RequiredArtifact, Threshold, ThresholdOp};
pub use evaluator::{GateEvaluator, GateResult, GateStatus, Violation, ViolationCategory};
