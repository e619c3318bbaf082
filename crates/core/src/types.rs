/// Jobs are keyed by UUID v7 so that ids sort by creation time.
pub type JobId = uuid::Uuid;

/// Workers are identified by an opaque, operator-chosen string.
pub type WorkerId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
