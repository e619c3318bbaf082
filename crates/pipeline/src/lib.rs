//! Job orchestration: worker registry, worker discovery and the
//! orchestrator that drives every job through its state machine.

pub mod clock;
pub mod config;
pub mod discovery;
pub mod orchestrator;
pub mod registry;

pub use config::OrchestratorConfig;
pub use orchestrator::{CancelOutcome, Orchestrator, OrchestratorError};
pub use registry::{RegistryConfig, RegistryError, WorkerRegistry};
