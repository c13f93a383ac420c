//! Analysis task descriptors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of analysis requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Fast overview with a small token budget.
    Quick,
    /// Condensed summary of the scanned setup.
    Summary,
    /// Thorough analysis of everything found.
    Full,
    /// Conflict and incompatibility hunting.
    Conflicts,
    /// Performance tuning review.
    Performance,
    /// Caller-defined analysis.
    Custom,
}

impl TaskType {
    /// All task types, in declaration order.
    pub const ALL: [Self; 6] =
        [Self::Quick, Self::Summary, Self::Full, Self::Conflicts, Self::Performance, Self::Custom];

    /// Stable lowercase name, used in configuration and cache keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Summary => "summary",
            Self::Full => "full",
            Self::Conflicts => "conflicts",
            Self::Performance => "performance",
            Self::Custom => "custom",
        }
    }

    /// The timeout ceiling this task is declared with.
    #[must_use]
    pub fn timeout_category(self) -> TimeoutCategory {
        match self {
            Self::Quick | Self::Summary | Self::Custom => TimeoutCategory::Standard,
            Self::Conflicts | Self::Performance => TimeoutCategory::Large,
            Self::Full => TimeoutCategory::Complex,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown task name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown task type: {0}")]
pub struct ParseTaskTypeError(pub String);

impl FromStr for TaskType {
    type Err = ParseTaskTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|task| task.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseTaskTypeError(s.to_string()))
    }
}

/// Timeout ceilings selectable per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutCategory {
    /// Ordinary requests.
    Standard,
    /// Requests over large inputs.
    Large,
    /// Requests that demand deep reasoning over everything.
    Complex,
}
