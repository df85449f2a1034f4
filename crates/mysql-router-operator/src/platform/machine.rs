//! The router snap on a machine.
//!
//! The upgrade partition is kept in the application databag of the upgrade peer relation,
//! together with the snap revision it was recorded for. Units refresh their own snap once the
//! partition allows it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    model::Model,
    platform::{
        ContainerSnafu, Error, InvalidPartitionSnafu, Platform, PlatformKind, Readiness,
        ROUTER_READ_ONLY_PORT, ROUTER_READ_WRITE_PORT, SerializePartitionSnafu,
    },
    relations::database_provides::RouterEndpoints,
    status::Status,
    unit::UnitId,
    upgrade::{PEER_RELATION_ENDPOINT, UpgradeBackend},
    versions::VersionPair,
    workload::container::{self, Container},
};

const PARTITION_KEY: &str = "partition";
const SNAP_REVISION_KEY: &str = "snap-revision";

const SOCKET_DIRECTORY: &str = "/var/snap/charmed-mysql/common/run/mysqlrouter";

/// Package management of the router snap.
pub trait Snap {
    fn installed_revision(&self) -> Result<String, container::Error>;

    /// Installs `revision`, restarting the snap services.
    fn refresh(&mut self, revision: &str) -> Result<(), container::Error>;
}

pub struct Machine<C> {
    container: C,
    target_revision: String,
    readiness: Readiness,
}

impl<C: Container + Snap> Machine<C> {
    /// `target_revision` is the snap revision pinned by the running operator.
    pub fn new(container: C, target_revision: impl Into<String>) -> Self {
        Self {
            container,
            target_revision: target_revision.into(),
            readiness: Readiness::default(),
        }
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn into_container(self) -> C {
        self.container
    }

    fn installed_revision(&self) -> Result<String, Error> {
        self.container.installed_revision().context(ContainerSnafu)
    }
}

/// The partition as stored in the peer relation, bound to the snap revision it gates.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
struct PartitionRecord {
    revision: String,
    partition: u32,
}

/// The highest unit number of the application, the most restrictive partition.
fn highest_unit_number(model: &Model) -> u32 {
    model
        .relation(PEER_RELATION_ENDPOINT)
        .into_iter()
        .flat_map(|relation| relation.remote_units.keys())
        .map(|unit| unit.number)
        .fold(model.unit.number, u32::max)
}

impl<C: Container + Snap> UpgradeBackend for Machine<C> {
    /// A partition that was not recorded for the target revision gates every unit but the
    /// highest, so a rollout never starts ungated.
    fn partition(&mut self, model: &Model) -> Result<u32, Error> {
        let Some(value) = model
            .relation(PEER_RELATION_ENDPOINT)
            .and_then(|relation| relation.local_app_data.get(PARTITION_KEY))
        else {
            return Ok(highest_unit_number(model));
        };

        let record: PartitionRecord =
            serde_json::from_str(value).context(InvalidPartitionSnafu { value })?;
        if record.revision == self.target_revision {
            Ok(record.partition)
        } else {
            tracing::debug!(
                recorded_revision = %record.revision,
                target_revision = %self.target_revision,
                "partition recorded for another revision"
            );
            Ok(highest_unit_number(model))
        }
    }

    fn set_partition(&mut self, model: &mut Model, value: u32) -> Result<(), Error> {
        let record = PartitionRecord {
            revision: self.target_revision.clone(),
            partition: value,
        };
        let serialized = serde_json::to_string(&record).context(SerializePartitionSnafu)?;
        if let Some(relation) = model.relation_mut(PEER_RELATION_ENDPOINT) {
            relation.local_app_data.insert(PARTITION_KEY, serialized);
            tracing::info!(partition = value, revision = %record.revision, "set upgrade partition");
        }
        Ok(())
    }

    fn unit_workload_version(&mut self, model: &Model, unit: &UnitId) -> Result<String, Error> {
        if *unit == model.unit {
            return self.installed_revision();
        }

        let revision = model
            .relation(PEER_RELATION_ENDPOINT)
            .and_then(|relation| relation.remote_units.get(unit))
            .and_then(|data| data.get(SNAP_REVISION_KEY));
        match revision {
            Some(revision) => Ok(revision.to_owned()),
            None => {
                // Units publish their revision on their first event
                tracing::debug!(%unit, "unit did not publish its snap revision yet");
                Ok(self.target_revision.clone())
            }
        }
    }

    fn app_workload_version(&mut self, _model: &Model) -> Result<String, Error> {
        Ok(self.target_revision.clone())
    }

    fn unit_active_status(
        &mut self,
        _model: &Model,
        versions: &VersionPair,
    ) -> Result<Status, Error> {
        Ok(Status::active(format!(
            "MySQL Router {}; Charm version {}; snap revision {}",
            versions.workload,
            versions.charm,
            self.installed_revision()?
        )))
    }
}

impl<C: Container + Snap> Platform for Machine<C> {
    type Container = C;

    fn kind(&self) -> PlatformKind {
        PlatformKind::Machine
    }

    fn container(&mut self) -> &mut C {
        &mut self.container
    }

    fn container_ready(&self) -> bool {
        self.container.ready()
    }

    fn readiness(&self) -> Readiness {
        self.readiness
    }

    fn read_write_endpoint(&mut self, _model: &Model) -> Result<String, Error> {
        Ok(format!("file://{SOCKET_DIRECTORY}/mysql.sock"))
    }

    fn read_only_endpoint(&mut self, _model: &Model) -> Result<String, Error> {
        Ok(format!("file://{SOCKET_DIRECTORY}/mysqlro.sock"))
    }

    fn exposed_endpoints(&mut self, model: &Model) -> Result<Option<RouterEndpoints>, Error> {
        Ok(model.unit_address.as_ref().map(|address| RouterEndpoints {
            read_write: format!("{address}:{ROUTER_READ_WRITE_PORT}"),
            read_only: format!("{address}:{ROUTER_READ_ONLY_PORT}"),
        }))
    }

    fn reconcile_node_port(&mut self, _model: &Model) -> Result<(), Error> {
        Ok(())
    }

    fn reconcile_ports(&mut self, model: &mut Model, external: bool) -> Result<(), Error> {
        let desired: BTreeSet<u16> = if external {
            BTreeSet::from([ROUTER_READ_WRITE_PORT, ROUTER_READ_ONLY_PORT])
        } else {
            BTreeSet::new()
        };
        if model.opened_ports != desired {
            tracing::info!(from = ?model.opened_ports, to = ?desired, "updated opened ports");
            model.opened_ports = desired;
        }
        Ok(())
    }

    fn publish_workload_version(&mut self, model: &mut Model) -> Result<(), Error> {
        let revision = self.installed_revision()?;
        if let Some(relation) = model.relation_mut(PEER_RELATION_ENDPOINT) {
            if relation
                .local_unit_data
                .insert(SNAP_REVISION_KEY, revision.as_str())
            {
                tracing::debug!(%revision, "published snap revision");
            }
        }
        Ok(())
    }

    fn refresh_workload(&mut self, model: &mut Model) -> Result<(), Error> {
        tracing::info!(
            from = %self.installed_revision()?,
            to = %self.target_revision,
            "refreshing router snap"
        );
        self.container
            .refresh(&self.target_revision)
            .context(ContainerSnafu)?;
        self.publish_workload_version(model)
    }
}
