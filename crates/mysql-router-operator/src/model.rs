//! The persisted state one event is reconciled against.
//!
//! The runtime loads a [`Model`] before delivering an event and persists it (including the
//! status slots and all databag writes) once the event has been handled.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, Snafu};

use crate::{config::CharmConfig, status::Status, unit::UnitId};

pub type RelationId = u32;

/// Raised when a databag does not contain a key its schema requires.
#[derive(Debug, PartialEq, Snafu)]
#[snafu(display("databag is missing required key {key:?}"))]
pub struct MissingKeyError {
    pub key: String,
}

/// The key/value payload attached to one side of a relation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Databag(BTreeMap<String, String>);

impl Databag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the value of a key the databag schema requires.
    ///
    /// Empty values are treated as missing.
    pub fn require(&self, key: &str) -> Result<&str, MissingKeyError> {
        self.get(key)
            .filter(|value| !value.is_empty())
            .context(MissingKeySnafu { key })
    }

    /// Whether every key in `keys` is present with a non-empty value.
    pub fn contains_all(&self, keys: &[&str]) -> bool {
        keys.iter().all(|key| self.require(key).is_ok())
    }

    /// Sets `key` and returns whether the stored value changed.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let value = value.into();
        match self.0.insert(key.into(), value.clone()) {
            Some(previous) => previous != value,
            None => true,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for Databag
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// One relation this application takes part in, as seen from the local unit.
///
/// For peer relations `remote_units` holds the databags of all *other* units of this
/// application, and `local_unit_data` the databag of the local unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub id: RelationId,
    pub endpoint: String,
    #[serde(default)]
    pub remote_app: Option<String>,
    #[serde(default)]
    pub local_app_data: Databag,
    #[serde(default)]
    pub local_unit_data: Databag,
    #[serde(default)]
    pub remote_app_data: Databag,
    #[serde(default)]
    pub remote_units: BTreeMap<UnitId, Databag>,
}

impl Relation {
    pub fn new(id: RelationId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_remote_app(mut self, remote_app: impl Into<String>) -> Self {
        self.remote_app = Some(remote_app.into());
        self
    }

    /// The remote application name, or a placeholder while the runtime has not seen it yet.
    pub fn remote_app_name(&self) -> &str {
        self.remote_app.as_deref().unwrap_or("remote")
    }
}

/// Lifecycle flags of the local unit and application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    /// The local unit is being removed.
    #[serde(default)]
    pub unit_tearing_down: bool,

    /// The whole application is being removed.
    #[serde(default)]
    pub app_tearing_down: bool,
}

/// Everything an event handler may read and write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub unit: UnitId,
    #[serde(default)]
    pub leader: bool,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub config: CharmConfig,
    /// Address other machines reach this unit at. Only used on machines.
    #[serde(default)]
    pub unit_address: Option<String>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    /// TCP ports opened on the unit. Only used on machines.
    #[serde(default)]
    pub opened_ports: BTreeSet<u16>,
    #[serde(default)]
    pub app_status: Status,
    #[serde(default)]
    pub unit_status: Status,
}

impl Model {
    pub fn new(unit: UnitId) -> Self {
        Self {
            unit,
            leader: false,
            lifecycle: Lifecycle::default(),
            config: CharmConfig::default(),
            unit_address: None,
            relations: Vec::new(),
            opened_ports: BTreeSet::new(),
            app_status: Status::default(),
            unit_status: Status::default(),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.unit.app_name
    }

    /// Leadership is only acted upon while the unit is not tearing down, since a departing
    /// leader must not perform cluster-wide writes.
    pub fn authorized_leader(&self) -> bool {
        self.leader && !self.lifecycle.unit_tearing_down
    }

    /// The unit is being removed while the rest of the application stays (scale down).
    pub fn tearing_down_and_app_active(&self) -> bool {
        self.lifecycle.unit_tearing_down && !self.lifecycle.app_tearing_down
    }

    pub fn relations<'a>(&'a self, endpoint: &str) -> impl Iterator<Item = &'a Relation> {
        self.relations
            .iter()
            .filter(move |relation| relation.endpoint == endpoint)
    }

    /// The first relation on `endpoint`, for endpoints limited to a single relation.
    pub fn relation(&self, endpoint: &str) -> Option<&Relation> {
        self.relations(endpoint).next()
    }

    pub fn relation_mut(&mut self, endpoint: &str) -> Option<&mut Relation> {
        self.relations
            .iter_mut()
            .find(|relation| relation.endpoint == endpoint)
    }

    pub fn relation_by_id_mut(&mut self, id: RelationId) -> Option<&mut Relation> {
        self.relations.iter_mut().find(|relation| relation.id == id)
    }
}
