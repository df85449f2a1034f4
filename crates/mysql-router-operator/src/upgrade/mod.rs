//! In-place rolling upgrade protocol.
//!
//! Units are upgraded one at a time from the highest unit number to the lowest. A single
//! cluster-wide partition gates the rollout: units with a number at or above the partition may
//! run the new workload, all others must keep the old one. Only the leader lowers the partition.
//! After the highest unit has been upgraded the rollout pauses until the user confirms that unit
//! is healthy by running the `resume-upgrade` action.

use std::cmp::Reverse;

use snafu::{ResultExt, Snafu, ensure};
use strum::{Display, EnumString};

use crate::{
    event::{ActionResult, RESUME_UPGRADE_ACTION},
    model::{Databag, Model, Relation},
    platform,
    status::Status,
    unit::UnitId,
    versions::VersionPair,
};

pub mod compatibility;

pub use compatibility::{CompatibilityRecord, is_compatible};

/// Peer relation holding the unit health states and the compatibility record.
pub const PEER_RELATION_ENDPOINT: &str = "upgrade-version-a";

const STATE_KEY: &str = "state";
const VERSIONS_KEY: &str = "versions";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read upgrade state from the platform"))]
    Platform { source: platform::Error },

    #[snafu(display("failed to serialize compatibility record"))]
    SerializeVersions { source: serde_json::Error },

    #[snafu(display("refusing to record versions while an upgrade is in progress"))]
    RecordDuringUpgrade,
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Self::Platform { source } => source.status(),
            Self::SerializeVersions { .. } | Self::RecordDuringUpgrade => {
                Status::blocked("Failed to record upgrade compatibility versions")
            }
        }
    }
}

/// Platform specific storage of the partition and of the running workload identities.
///
/// On Kubernetes the identity is the controller revision hash of a pod, on machines it is the
/// installed snap revision.
pub trait UpgradeBackend {
    /// The stored partition. Unit numbers at or above it may run the new workload.
    fn partition(&mut self, model: &Model) -> Result<u32, platform::Error>;

    fn set_partition(&mut self, model: &mut Model, value: u32) -> Result<(), platform::Error>;

    /// The identity of the workload `unit` currently runs.
    fn unit_workload_version(
        &mut self,
        model: &Model,
        unit: &UnitId,
    ) -> Result<String, platform::Error>;

    /// The identity every unit runs once the upgrade has completed.
    fn app_workload_version(&mut self, model: &Model) -> Result<String, platform::Error>;

    /// The active status of this unit while an upgrade is in progress.
    fn unit_active_status(
        &mut self,
        model: &Model,
        versions: &VersionPair,
    ) -> Result<Status, platform::Error>;
}

/// Health of one unit, written only by that unit.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum UnitState {
    #[default]
    Unset,
    Healthy,
    Restarting,
}

impl UnitState {
    fn from_databag(databag: &Databag) -> Self {
        databag
            .get(STATE_KEY)
            .and_then(|state| state.parse().ok())
            .unwrap_or_default()
    }
}

/// What caused a partition reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Reconciliation as part of a regular event. Never advances past the highest unit.
    Automatic,

    /// The user ran the `resume-upgrade` action.
    Action { force: bool },
}

/// One unit as seen by the partition algorithm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitUpgradeState {
    pub number: u32,
    pub state: UnitState,
    pub workload_version: String,
}

/// Computes the partition for an upgrade in progress.
///
/// `units` must be ordered by unit number, highest first. The first unit that is unhealthy
/// (ignored when forced) or still runs an outdated workload is the next one to upgrade, its number
/// becomes the partition. Without an explicit user action the rollout stops after the highest
/// unit.
pub fn determine_partition(
    units: &[UnitUpgradeState],
    app_workload_version: &str,
    trigger: Trigger,
) -> u32 {
    let force = matches!(trigger, Trigger::Action { force: true });

    for (upgrade_order_index, unit) in units.iter().enumerate() {
        let unhealthy = !force && unit.state != UnitState::Healthy;
        if unhealthy || unit.workload_version != app_workload_version {
            if trigger == Trigger::Automatic && upgrade_order_index == 1 {
                // Wait for the user to confirm the highest unit is healthy
                return units[0].number;
            }
            return unit.number;
        }
    }

    units.last().map_or(0, |unit| unit.number)
}

/// Raises the stored partition of `backend` to `target`, freezing the rollout for every unit
/// below it. A higher partition is left alone.
///
/// Works without the upgrade peer relation, a stopping unit protects itself before it joined.
pub fn raise_partition<B: UpgradeBackend>(
    backend: &mut B,
    model: &mut Model,
    target: u32,
) -> Result<()> {
    let current = backend.partition(model).context(PlatformSnafu)?;
    if target > current {
        backend.set_partition(model, target).context(PlatformSnafu)?;
        tracing::info!(from = current, to = target, "raised upgrade partition");
    }
    Ok(())
}

/// The upgrade protocol for a single event.
///
/// Borrows the model and the platform for the duration of one operation, so every query goes
/// through the per-event platform cache.
pub struct Upgrade<'a, B> {
    model: &'a mut Model,
    backend: &'a mut B,
    versions: &'a VersionPair,
    peer_index: usize,
}

impl<'a, B: UpgradeBackend> Upgrade<'a, B> {
    /// Returns [`None`] while the peer relation has not been created yet.
    pub fn new(model: &'a mut Model, backend: &'a mut B, versions: &'a VersionPair) -> Option<Self> {
        let peer_index = model
            .relations
            .iter()
            .position(|relation| relation.endpoint == PEER_RELATION_ENDPOINT)?;

        Some(Self {
            model,
            backend,
            versions,
            peer_index,
        })
    }

    fn peer(&self) -> &Relation {
        &self.model.relations[self.peer_index]
    }

    fn peer_mut(&mut self) -> &mut Relation {
        &mut self.model.relations[self.peer_index]
    }

    /// All units of the application, highest unit number first.
    pub fn sorted_units(&self) -> Vec<UnitId> {
        let mut units: Vec<UnitId> = std::iter::once(self.model.unit.clone())
            .chain(self.peer().remote_units.keys().cloned())
            .collect();
        units.sort_by_key(|unit| Reverse(unit.number));
        units.dedup();
        units
    }

    pub fn unit_state(&self, unit: &UnitId) -> UnitState {
        if *unit == self.model.unit {
            UnitState::from_databag(&self.peer().local_unit_data)
        } else {
            self.peer()
                .remote_units
                .get(unit)
                .map(UnitState::from_databag)
                .unwrap_or_default()
        }
    }

    fn set_own_state(&mut self, state: UnitState) {
        let unit = self.model.unit.clone();
        if self
            .peer_mut()
            .local_unit_data
            .insert(STATE_KEY, state.to_string())
        {
            tracing::info!(%unit, %state, "set unit upgrade state");
        }
    }

    /// Called before the workload of this unit restarts.
    pub fn mark_restarting(&mut self) {
        self.set_own_state(UnitState::Restarting);
    }

    /// Called once the workload of this unit has been verified to serve correctly.
    pub fn mark_healthy(&mut self) {
        self.set_own_state(UnitState::Healthy);
    }

    /// Whether any unit runs a different workload identity than the application targets.
    pub fn in_progress(&mut self) -> Result<bool> {
        let app_version = self
            .backend
            .app_workload_version(self.model)
            .context(PlatformSnafu)?;

        for unit in self.sorted_units() {
            let unit_version = self
                .backend
                .unit_workload_version(self.model, &unit)
                .context(PlatformSnafu)?;
            if unit_version != app_version {
                tracing::debug!(%unit, %unit_version, %app_version, "upgrade in progress");
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn previous_versions(&self) -> Option<CompatibilityRecord> {
        let raw = self.peer().local_app_data.get(VERSIONS_KEY)?;
        match serde_json::from_str(raw) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(%error, raw, "ignoring malformed compatibility record");
                None
            }
        }
    }

    /// Whether the versions recorded before this upgrade are compatible with the running ones.
    pub fn is_compatible(&self) -> bool {
        is_compatible(self.previous_versions().as_ref(), self.versions)
    }

    /// Records the running versions as the baseline for the next upgrade.
    ///
    /// Only the leader may call this. The record is refreshed during every stable period and
    /// frozen once an upgrade starts.
    pub fn set_versions_in_app_databag(&mut self) -> Result<()> {
        ensure!(!self.in_progress()?, RecordDuringUpgradeSnafu);

        let record = serde_json::to_string(&CompatibilityRecord::from(self.versions))
            .context(SerializeVersionsSnafu)?;
        if self.peer_mut().local_app_data.insert(VERSIONS_KEY, record) {
            tracing::info!(versions = %self.versions, "recorded versions for upgrade compatibility");
        }
        Ok(())
    }

    /// The workload of this unit may start unless an incompatible upgrade is in progress.
    pub fn workload_allowed_to_start(&mut self) -> Result<bool> {
        Ok(!self.in_progress()? || self.is_compatible())
    }

    pub fn app_status(&mut self) -> Result<Option<Status>> {
        if !self.in_progress()? {
            return Ok(None);
        }

        let app_name = self.model.app_name().to_owned();
        let units = self.sorted_units();
        let partition = self.backend.partition(self.model).context(PlatformSnafu)?;

        if units.len() >= 2 && partition > units[1].number {
            Ok(Some(Status::blocked(format!(
                "Upgrading. Check that highest number unit is healthy and run `juju run {app_name}/leader {RESUME_UPGRADE_ACTION}`. To rollback, `juju refresh` to the previous revision"
            ))))
        } else {
            Ok(Some(Status::maintenance(
                "Upgrading. To rollback, `juju refresh` to the previous revision",
            )))
        }
    }

    /// Unit status that overrides every other unit status.
    pub fn unit_status_higher_priority(&mut self) -> Result<Option<Status>> {
        if self.in_progress()? && !self.is_compatible() {
            return Ok(Some(Status::blocked(
                "Upgrade incompatible. Rollback to previous revision with `juju refresh`",
            )));
        }
        Ok(None)
    }

    /// Unit status used only when nothing else is reported.
    pub fn unit_status_lower_priority(&mut self) -> Result<Option<Status>> {
        if !self.in_progress()? {
            return Ok(None);
        }
        self.backend
            .unit_active_status(self.model, self.versions)
            .map(Some)
            .context(PlatformSnafu)
    }

    fn unit_upgrade_states(&mut self) -> Result<Vec<UnitUpgradeState>> {
        self.sorted_units()
            .into_iter()
            .map(|unit| {
                let workload_version = self
                    .backend
                    .unit_workload_version(self.model, &unit)
                    .context(PlatformSnafu)?;
                Ok(UnitUpgradeState {
                    number: unit.number,
                    state: self.unit_state(&unit),
                    workload_version,
                })
            })
            .collect()
    }

    /// Lowers the stored partition to `target`. Returns the partition in effect afterwards.
    fn lower_partition(&mut self, target: u32) -> Result<u32> {
        let current = self.backend.partition(self.model).context(PlatformSnafu)?;
        if target < current {
            self.backend
                .set_partition(self.model, target)
                .context(PlatformSnafu)?;
            tracing::info!(from = current, to = target, "lowered upgrade partition");
            Ok(target)
        } else {
            if target > current {
                tracing::debug!(current, target, "not raising upgrade partition");
            }
            Ok(current)
        }
    }

    /// Raises the partition to the highest unit number so only that unit upgrades first.
    ///
    /// The partition is written even if its value does not change, which records it for the
    /// revision being rolled out.
    pub fn begin_rollout(&mut self) -> Result<()> {
        let Some(highest) = self.sorted_units().first().map(|unit| unit.number) else {
            return Ok(());
        };
        let current = self.backend.partition(self.model).context(PlatformSnafu)?;
        let partition = current.max(highest);
        self.backend
            .set_partition(self.model, partition)
            .context(PlatformSnafu)?;
        tracing::info!(partition, "began rollout");
        Ok(())
    }

    /// Leader only. Advances the partition as far as the protocol allows without user input.
    pub fn reconcile_partition(&mut self) -> Result<u32> {
        let target = if self.in_progress()? {
            let app_version = self
                .backend
                .app_workload_version(self.model)
                .context(PlatformSnafu)?;
            determine_partition(
                &self.unit_upgrade_states()?,
                &app_version,
                Trigger::Automatic,
            )
        } else {
            0
        };
        self.lower_partition(target)
    }

    /// Leader only. Handles the `resume-upgrade` action.
    pub fn resume(&mut self, force: bool) -> Result<ActionResult> {
        if !self.in_progress()? {
            return Ok(ActionResult::Failure("No upgrade in progress".to_owned()));
        }

        let units = self.unit_upgrade_states()?;
        if units.len() < 2 {
            return Ok(ActionResult::Failure(
                "Upgrade can only be resumed with two or more units".to_owned(),
            ));
        }

        let app_version = self
            .backend
            .app_workload_version(self.model)
            .context(PlatformSnafu)?;
        let partition = determine_partition(&units, &app_version, Trigger::Action { force });
        tracing::debug!(partition, force, "resuming upgrade");
        self.lower_partition(partition)?;

        let result = if partition > units[1].number {
            ActionResult::Failure(
                "Highest number unit is unhealthy. Upgrade will not resume.".to_owned(),
            )
        } else if force {
            // The platform decides when the unit actually restarts
            ActionResult::Success(format!("Attempting to upgrade unit {partition}"))
        } else {
            ActionResult::Success(format!(
                "Upgrade resumed. Unit {partition} is upgrading next"
            ))
        };
        Ok(result)
    }

    /// Leader only. Handles the `pre-upgrade-check` action.
    pub fn pre_upgrade_check(&mut self) -> Result<ActionResult> {
        if self.in_progress()? {
            return Ok(ActionResult::Failure(
                "Upgrade already in progress".to_owned(),
            ));
        }

        if let Some(unit) = self
            .sorted_units()
            .into_iter()
            .find(|unit| self.unit_state(unit) != UnitState::Healthy)
        {
            return Ok(ActionResult::Failure(format!(
                "Unit {unit} is not healthy. Upgrade cannot start"
            )));
        }

        Ok(ActionResult::Success(
            "Charm is ready for upgrade".to_owned(),
        ))
    }

    /// Whether this unit may replace its own workload now.
    ///
    /// Used on machines, where units refresh themselves. The unit must be at or above the
    /// partition and every higher unit must already run the target workload and be healthy.
    pub fn own_refresh_allowed(&mut self) -> Result<bool> {
        let own_number = self.model.unit.number;
        let app_version = self
            .backend
            .app_workload_version(self.model)
            .context(PlatformSnafu)?;
        let units = self.unit_upgrade_states()?;

        let Some(own) = units.iter().find(|unit| unit.number == own_number) else {
            return Ok(false);
        };
        if own.workload_version == app_version {
            return Ok(false);
        }

        let partition = self.backend.partition(self.model).context(PlatformSnafu)?;
        let higher_units_done = units
            .iter()
            .filter(|unit| unit.number > own_number)
            .all(|unit| unit.workload_version == app_version && unit.state == UnitState::Healthy);

        tracing::debug!(own_number, partition, higher_units_done, "checked own refresh");
        Ok(own_number >= partition && higher_units_done)
    }
}
