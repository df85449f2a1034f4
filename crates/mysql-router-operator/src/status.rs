//! Application and unit status reporting.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// The status reported for the application or for a single unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum Status {
    Active(String),
    Blocked(String),
    Maintenance(String),
    Waiting(String),
}

impl Status {
    pub fn active(message: impl Into<String>) -> Self {
        Self::Active(message.into())
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::Blocked(message.into())
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        Self::Maintenance(message.into())
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self::Waiting(message.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Active(message)
            | Self::Blocked(message)
            | Self::Maintenance(message)
            | Self::Waiting(message) => message,
        }
    }

    /// Lower values win. Active is the catch-all tier.
    fn priority(&self) -> u8 {
        match self {
            Self::Blocked(_) => 0,
            Self::Maintenance(_) => 1,
            Self::Waiting(_) => 2,
            Self::Active(_) => 3,
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::Active(String::new())
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Active(_) => "active",
            Self::Blocked(_) => "blocked",
            Self::Maintenance(_) => "maintenance",
            Self::Waiting(_) => "waiting",
        };

        match self.message() {
            "" => write!(f, "{kind}"),
            message => write!(f, "{kind}: {message}"),
        }
    }
}

/// Reports the highest priority status.
///
/// The priority is `Blocked > Maintenance > Waiting > Active`. Statuses of the same kind are
/// reported in the order they were added. If no status is given, an empty [`Status::Active`] is
/// returned.
pub fn prioritize(statuses: impl IntoIterator<Item = Status>) -> Status {
    // `min_by_key` returns the first of several equally ranked elements.
    statuses
        .into_iter()
        .min_by_key(Status::priority)
        .unwrap_or_default()
}
