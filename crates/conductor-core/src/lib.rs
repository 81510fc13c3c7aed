pub mod config;
pub mod error;
pub mod event;
pub mod policy;
pub mod types;

pub use config::AppConfig;
pub use error::{ConductorError, Result};
pub use event::EventBus;
pub use policy::PolicyConfig;
pub use types::*;
