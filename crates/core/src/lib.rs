//! Domain types and pure logic for the charforge job orchestration core.
//!
//! This crate has zero internal dependencies so it can be shared by the
//! ledger, driver, storage and pipeline crates alike.

pub mod backoff;
pub mod error;
pub mod job;
pub mod ledger;
pub mod scheduling;
pub mod types;
pub mod worker;
