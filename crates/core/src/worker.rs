//! Worker model, capability tags and validation.
//!
//! Workers are never persisted; the registry rebuilds them from
//! configuration or discovery on every start.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Timestamp, WorkerId};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a worker id.
const MAX_ID_LEN: usize = 128;

/// Maximum number of concurrent slots a single worker may declare.
const MAX_SLOTS: u32 = 64;

fn default_slots() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Work a worker has declared it can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Training,
    Image,
    Video,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(Self::Training),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            other => Err(CoreError::Validation(format!(
                "Unknown capability '{other}'. Must be one of: training, image, video"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// Registered but not probed yet.
    Unknown,
    Healthy,
    Unreachable,
}

// ---------------------------------------------------------------------------
// Spec and snapshot
// ---------------------------------------------------------------------------

/// Declared identity of a worker, as provided by configuration or discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: WorkerId,
    /// Base HTTP URL, e.g. `http://10.0.0.5:8188`.
    pub base_url: String,
    pub capabilities: Vec<Capability>,
    /// Number of jobs the worker runs concurrently.
    #[serde(default = "default_slots")]
    pub slots: u32,
}

impl WorkerSpec {
    pub fn new(
        id: impl Into<WorkerId>,
        base_url: impl Into<String>,
        capabilities: Vec<Capability>,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            capabilities,
            slots: default_slots(),
        }
    }

    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = slots;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        validate_worker_id(&self.id)?;
        validate_capabilities(&self.capabilities)?;
        if self.base_url.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Worker '{}' must have a base URL",
                self.id
            )));
        }
        if self.slots == 0 || self.slots > MAX_SLOTS {
            return Err(CoreError::Validation(format!(
                "Worker '{}' slots must be between 1 and {MAX_SLOTS}",
                self.id
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of a registered worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Worker {
    pub id: WorkerId,
    pub base_url: String,
    pub capabilities: Vec<Capability>,
    pub slots: u32,
    /// Number of jobs currently assigned (assigning or running).
    pub load: u32,
    pub health: WorkerHealth,
    pub last_health_check: Option<Timestamp>,
    pub last_healthy_at: Option<Timestamp>,
    pub consecutive_failures: u32,
}

impl Worker {
    /// A never-probed worker with no load.
    pub fn from_spec(spec: WorkerSpec) -> Self {
        Self {
            id: spec.id,
            base_url: spec.base_url,
            capabilities: spec.capabilities,
            slots: spec.slots,
            load: 0,
            health: WorkerHealth::Unknown,
            last_health_check: None,
            last_healthy_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn has_free_slot(&self) -> bool {
        self.load < self.slots
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a worker id.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_ID_LEN` characters.
/// - Must contain only alphanumeric, hyphen, underscore, or dot characters.
pub fn validate_worker_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation(
            "Worker id must not be empty".to_string(),
        ));
    }
    if id.len() > MAX_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Worker id must not exceed {MAX_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(
            "Worker id may only contain alphanumeric, hyphen, underscore, or dot characters"
                .to_string(),
        ));
    }
    Ok(())
}

/// Validate a declared capability list: non-empty, no duplicates.
pub fn validate_capabilities(capabilities: &[Capability]) -> Result<(), CoreError> {
    if capabilities.is_empty() {
        return Err(CoreError::Validation(
            "A worker must declare at least one capability".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::with_capacity(capabilities.len());
    for capability in capabilities {
        if !seen.insert(*capability) {
            return Err(CoreError::Validation(format!(
                "Duplicate capability: \"{capability}\""
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
