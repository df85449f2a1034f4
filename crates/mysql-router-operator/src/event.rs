//! Events delivered by the runtime, one at a time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::model::RelationId;

pub const RESUME_UPGRADE_ACTION: &str = "resume-upgrade";
pub const PRE_UPGRADE_CHECK_ACTION: &str = "pre-upgrade-check";

/// A lifecycle, relation or action event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Event {
    Install,
    Start,
    ConfigChanged,
    UpgradeCharm,
    LeaderElected,
    PebbleReady,
    UpdateStatus,
    Stop,
    RelationCreated {
        endpoint: String,
        relation_id: RelationId,
    },
    RelationJoined {
        endpoint: String,
        relation_id: RelationId,
    },
    RelationChanged {
        endpoint: String,
        relation_id: RelationId,
    },
    RelationDeparted {
        endpoint: String,
        relation_id: RelationId,
    },
    RelationBroken {
        endpoint: String,
        relation_id: RelationId,
    },
    ActionInvoked {
        name: String,
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
    },
}

impl Event {
    pub fn relation_broken(endpoint: impl Into<String>, relation_id: RelationId) -> Self {
        Self::RelationBroken {
            endpoint: endpoint.into(),
            relation_id,
        }
    }

    pub fn action(name: impl Into<String>) -> Self {
        Self::ActionInvoked {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if let Self::ActionInvoked { params, .. } = &mut self {
            params.insert(key.into(), value);
        }
        self
    }

    /// Whether this event is the relation broken event of `relation_id`.
    ///
    /// While a relation broken event is handled, the relation is still visible in the model but
    /// must be treated as gone.
    pub fn is_breaking(&self, relation_id: RelationId) -> bool {
        matches!(self, Self::RelationBroken { relation_id: id, .. } if *id == relation_id)
    }
}

#[derive(Debug, PartialEq, Snafu)]
pub enum ActionError {
    #[snafu(display("unknown action {name:?}"))]
    UnknownAction { name: String },

    #[snafu(display("action parameter {param:?} must be a boolean"))]
    InvalidBoolParam { param: String },
}

/// The actions this operator supports, parsed from [`Event::ActionInvoked`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Confirms that the first upgraded unit is healthy (or forces the next unit) and resumes a
    /// paused upgrade.
    ResumeUpgrade { force: bool },

    /// Checks that the application is ready to be upgraded.
    PreUpgradeCheck,
}

impl Action {
    pub fn from_invocation(
        name: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Self, ActionError> {
        match name {
            RESUME_UPGRADE_ACTION => {
                let force = match params.get("force") {
                    None => false,
                    Some(value) => value.as_bool().ok_or_else(|| ActionError::InvalidBoolParam {
                        param: "force".to_owned(),
                    })?,
                };
                Ok(Self::ResumeUpgrade { force })
            }
            PRE_UPGRADE_CHECK_ACTION => Ok(Self::PreUpgradeCheck),
            _ => UnknownActionSnafu { name }.fail(),
        }
    }
}

/// The outcome reported back to the user who invoked an action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionResult {
    Success(String),
    Failure(String),
}
