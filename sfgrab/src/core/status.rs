//! Stage status and kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// A stage that validates the environment before work begins.
    Guard,
    /// A stage that prepares local state (directories, names).
    Prepare,
    /// A stage that moves bulk data through an external tool.
    Transfer,
    /// A composite stage gating inner stages.
    Limit,
    /// A stage that finalizes artifacts on disk.
    #[default]
    Finalize,
    /// A stage that talks to the coordinator.
    Report,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guard => write!(f, "guard"),
            Self::Prepare => write!(f, "prepare"),
            Self::Transfer => write!(f, "transfer"),
            Self::Limit => write!(f, "limit"),
            Self::Finalize => write!(f, "finalize"),
            Self::Report => write!(f, "report"),
        }
    }
}

/// The execution status of a stage that did not fail.
///
/// Failures are carried by `PipelineError`, not by a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed its work.
    #[default]
    Ok,
    /// Stage decided there was nothing to do for this item.
    Skip,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Skip => write!(f, "skip"),
        }
    }
}
