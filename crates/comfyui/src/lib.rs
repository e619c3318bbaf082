//! ComfyUI worker integration.
//!
//! Provides the HTTP API wrapper, history parsing, workflow templates, the
//! [`client::WorkerClient`] seam used by the orchestrator, and the
//! [`driver::RemoteJobDriver`] that polls a submitted job to a terminal
//! outcome.

pub mod api;
pub mod client;
pub mod driver;
pub mod history;
pub mod workflow;
