//! The per-event reconciler.
//!
//! A [`Charm`] borrows the persisted [`Model`] and a [`Platform`] for the duration of one
//! [`Event`]. Every event except `stop` and actions is handled by the same idempotent
//! [`reconcile`](Charm::reconcile) pass, which converges relations, workload and upgrade state and
//! finally recomputes both status slots.

use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};

use crate::{
    event::{Action, ActionResult, Event},
    model::Model,
    platform::{self, NotReadyError, Platform, PlatformKind},
    relations::{cos, database_provides, database_requires, tls},
    status::{Status, prioritize},
    upgrade::{self, Upgrade},
    versions::VersionPair,
    workload::{self, ReconcileRequest, Workload, container::Container, shell::Shell},
};

/// Errors reported through the unit status. The event is considered handled.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("platform operation failed"))]
    Platform { source: platform::Error },

    #[snafu(display("upgrade operation failed"))]
    Upgrade { source: upgrade::Error },

    #[snafu(display("failed to reconcile database users"))]
    DatabaseProvides { source: database_provides::Error },

    #[snafu(display("failed to reconcile the workload"))]
    Workload { source: workload::Error },

    #[snafu(display("MySQL Router did not come back after refreshing the workload"))]
    RefreshNotReady { source: NotReadyError },
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Self::Platform { source } => source.status(),
            Self::Upgrade { source } => source.status(),
            Self::DatabaseProvides { source } => source.status(),
            Self::Workload { source } => source.status(),
            Self::RefreshNotReady { .. } => {
                Status::maintenance("Waiting for MySQL Router to start")
            }
        }
    }
}

/// Errors that fail the event instead of being reported through the unit status.
#[derive(Debug, Snafu)]
pub enum FatalError {
    #[snafu(display("MySQL Router did not become ready"))]
    WaitUntilReady { source: NotReadyError },
}

pub struct Charm<'a, P> {
    model: &'a mut Model,
    platform: &'a mut P,
    versions: &'a VersionPair,
}

impl<'a, P: Platform> Charm<'a, P> {
    pub fn new(model: &'a mut Model, platform: &'a mut P, versions: &'a VersionPair) -> Self {
        Self {
            model,
            platform,
            versions,
        }
    }

    /// Handles a single event.
    ///
    /// Returns the result of an action event, [`None`] for every other event.
    pub fn handle(&mut self, event: &Event) -> Result<Option<ActionResult>, FatalError> {
        let result = match event {
            Event::Stop => self.on_stop().map(|()| None),
            Event::ActionInvoked { name, params } => self.on_action(name, params).map(Some),
            Event::UpgradeCharm => self
                .on_upgrade_charm()
                .and_then(|()| self.reconcile(event))
                .map(|()| None),
            _ => self.reconcile(event).map(|()| None),
        };

        match result {
            Ok(action_result) => Ok(action_result),
            Err(
                Error::Workload {
                    source: workload::Error::NotReady { source },
                }
                | Error::RefreshNotReady { source },
            ) => Err(FatalError::WaitUntilReady { source }),
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to handle event"
                );
                // The app status may carry a more specific problem set by the leader
                self.model.unit_status = error.status();
                Ok(None)
            }
        }
    }

    fn upgrade(&mut self) -> Option<Upgrade<'_, P>> {
        Upgrade::new(&mut *self.model, &mut *self.platform, self.versions)
    }

    fn upgrade_in_progress(&mut self) -> Result<bool, Error> {
        match self.upgrade() {
            Some(mut upgrade) => upgrade.in_progress().context(UpgradeSnafu),
            None => Ok(false),
        }
    }

    fn workload_allowed_to_start(&mut self) -> Result<bool, Error> {
        match self.upgrade() {
            Some(mut upgrade) => upgrade.workload_allowed_to_start().context(UpgradeSnafu),
            None => Ok(true),
        }
    }

    /// The name MySQL Router is bootstrapped with.
    fn router_name(&self) -> String {
        self.model.unit.to_string()
    }

    /// Whether any client application asked for endpoints reachable from outside the host.
    fn external_connectivity_requested(&self, event: &Event) -> bool {
        database_provides::requested_users(self.model, event)
            .iter()
            .any(|user| user.external_connectivity)
    }

    pub fn reconcile(&mut self, event: &Event) -> Result<(), Error> {
        let leader = self.model.authorized_leader();
        tracing::debug!(?event, leader, unit = %self.model.unit, "reconciling");

        self.platform
            .publish_workload_version(self.model)
            .context(PlatformSnafu)?;
        if leader {
            database_requires::request_database(self.model, event);
        }
        tls::save_issued_certificate(self.model, event);
        tls::clear_on_broken(self.model, event);

        let in_progress = self.upgrade_in_progress()?;
        if leader && database_requires::is_breaking(self.model, event) {
            if in_progress {
                tracing::warn!(
                    "backend database relation removed during upgrade, shared credentials are left as is"
                );
            } else {
                database_provides::delete_all_databags(self.model);
            }
        }

        let workload = Workload::new(database_requires::connection_info(self.model, event).ok());
        let container_ready = self.platform.container_ready();
        let router_name = self.router_name();
        tracing::debug!(
            in_progress,
            container_ready,
            authenticated = workload.connection().is_some(),
            "reconcile inputs"
        );

        if leader && !in_progress && container_ready {
            if let Some(connection) = workload.connection() {
                self.platform
                    .reconcile_node_port(self.model)
                    .context(PlatformSnafu)?;
                let endpoints = self.platform.endpoints(self.model).context(PlatformSnafu)?;
                let mut shell = Shell::new(self.platform.container(), connection);
                database_provides::reconcile_users(self.model, event, &endpoints, &mut shell)
                    .context(DatabaseProvidesSnafu)?;
            }
        }

        if container_ready && self.workload_allowed_to_start()? {
            self.refresh_own_workload()?;

            let tls_materials = tls::saved_materials(self.model, event);
            let exporter = cos::exporter_config(self.model, event);
            let request = ReconcileRequest {
                tls: tls_materials.as_ref(),
                exporter: exporter.as_ref(),
            };
            workload
                .reconcile(&mut *self.platform, &router_name, request)
                .context(WorkloadSnafu)?;

            if !in_progress && workload.connection().is_some() {
                let external = self.external_connectivity_requested(event);
                self.platform
                    .reconcile_ports(self.model, external)
                    .context(PlatformSnafu)?;
            }
        }

        let workload_status = workload.status(self.platform.container(), &router_name);
        let workload_settled = match &workload_status {
            None => true,
            Some(Status::Waiting(message)) => message.is_empty(),
            Some(_) => false,
        };
        if workload_settled {
            if let Some(mut upgrade) = self.upgrade() {
                upgrade.mark_healthy();
            }
        }

        if leader {
            if let Some(mut upgrade) = self.upgrade() {
                if !upgrade.in_progress().context(UpgradeSnafu)? {
                    upgrade
                        .set_versions_in_app_databag()
                        .context(UpgradeSnafu)?;
                }
                upgrade.reconcile_partition().context(UpgradeSnafu)?;
            }
        }

        self.set_status(event, workload_status)
    }

    /// Replaces the workload of this unit once the upgrade order allows it.
    fn refresh_own_workload(&mut self) -> Result<(), Error> {
        if self.platform.kind() != PlatformKind::Machine {
            return Ok(());
        }
        let Some(mut upgrade) = self.upgrade() else {
            return Ok(());
        };
        if !upgrade.own_refresh_allowed().context(UpgradeSnafu)? {
            return Ok(());
        }
        upgrade.mark_restarting();

        let router_running = self.platform.container().router_service_enabled();
        self.platform
            .refresh_workload(self.model)
            .context(PlatformSnafu)?;
        if router_running {
            // The refresh restarted MySQL Router
            self.platform
                .wait_until_ready()
                .context(RefreshNotReadySnafu)?;
        }
        Ok(())
    }

    fn set_status(&mut self, event: &Event, workload_status: Option<Status>) -> Result<(), Error> {
        let leader = self.model.authorized_leader();
        let (upgrade_app, upgrade_higher, upgrade_lower) = match self.upgrade() {
            Some(mut upgrade) => (
                if leader {
                    upgrade.app_status().context(UpgradeSnafu)?
                } else {
                    None
                },
                upgrade
                    .unit_status_higher_priority()
                    .context(UpgradeSnafu)?,
                upgrade.unit_status_lower_priority().context(UpgradeSnafu)?,
            ),
            None => (None, None, None),
        };

        if leader {
            let config_status = self
                .model
                .config
                .expose_external()
                .err()
                .map(|error| error.status());
            self.model.app_status = prioritize(
                upgrade_app
                    .into_iter()
                    .chain(config_status)
                    .chain(database_requires::status(self.model, event))
                    .chain(database_provides::status(self.model, event)),
            );
        }
        self.model.unit_status = prioritize(
            [upgrade_higher, workload_status, upgrade_lower]
                .into_iter()
                .flatten(),
        );
        tracing::debug!(
            app_status = %self.model.app_status,
            unit_status = %self.model.unit_status,
            "set status"
        );
        Ok(())
    }

    /// On Kubernetes a stopping pod is about to be replaced. Raising the partition to the own unit
    /// number keeps the StatefulSet controller from restarting lower units meanwhile.
    fn on_stop(&mut self) -> Result<(), Error> {
        if self.platform.kind() != PlatformKind::Kubernetes {
            return Ok(());
        }
        if self.model.tearing_down_and_app_active() {
            // Scale down, the unit will not come back
            return Ok(());
        }

        let own_number = self.model.unit.number;
        upgrade::raise_partition(&mut *self.platform, &mut *self.model, own_number)
            .context(UpgradeSnafu)?;
        if let Some(mut upgrade) = self.upgrade() {
            upgrade.mark_restarting();
        }
        Ok(())
    }

    fn on_upgrade_charm(&mut self) -> Result<(), Error> {
        if self.platform.kind() != PlatformKind::Machine || !self.model.authorized_leader() {
            return Ok(());
        }
        if let Some(mut upgrade) = self.upgrade() {
            if upgrade.in_progress().context(UpgradeSnafu)? {
                upgrade.begin_rollout().context(UpgradeSnafu)?;
            }
        }
        Ok(())
    }

    fn on_action(
        &mut self,
        name: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<ActionResult, Error> {
        let action = match Action::from_invocation(name, params) {
            Ok(action) => action,
            Err(error) => return Ok(ActionResult::Failure(error.to_string())),
        };
        if !self.model.authorized_leader() {
            return Ok(ActionResult::Failure(format!(
                "Must run action on leader unit. (e.g. `juju run {app}/leader {name}`)",
                app = self.model.app_name()
            )));
        }
        let Some(mut upgrade) = self.upgrade() else {
            return Ok(ActionResult::Failure("No upgrade in progress".to_owned()));
        };

        let result = match action {
            Action::ResumeUpgrade { force } => upgrade.resume(force),
            Action::PreUpgradeCheck => upgrade.pre_upgrade_check(),
        }
        .context(UpgradeSnafu)?;
        tracing::info!(action = name, ?result, "ran action");
        Ok(result)
    }
}
