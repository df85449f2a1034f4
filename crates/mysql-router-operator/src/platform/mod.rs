//! Where the router runs: a Kubernetes StatefulSet or a machine with the router snap.
//!
//! The reconciler only talks to the [`Platform`] trait. The variant is picked once at process
//! start from [`PlatformKind`].

use std::{
    thread,
    time::{Duration, Instant},
};

use snafu::Snafu;
use strum::{Display, EnumString};

use crate::{
    config,
    model::Model,
    relations::database_provides::{Endpoints, RouterEndpoints},
    status::Status,
    upgrade::UpgradeBackend,
    workload::container::{self, Container},
};

pub mod kubernetes;
pub mod machine;

pub const ROUTER_READ_WRITE_PORT: u16 = 6446;
pub const ROUTER_READ_ONLY_PORT: u16 = 6447;

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum PlatformKind {
    Kubernetes,
    Machine,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the {app_name} app is not allowed to manage cluster scoped resources"))]
    DeployedWithoutTrust { app_name: String },

    #[snafu(display("failed to {operation}"))]
    KubernetesApi {
        source: kubernetes::ApiError,
        operation: String,
    },

    #[snafu(display("kubernetes did not report a revision for {resource}"))]
    MissingRevision { resource: String },

    #[snafu(display("invalid application configuration"))]
    InvalidConfig { source: config::Error },

    #[snafu(display("failed to operate the workload container"))]
    Container { source: container::Error },

    #[snafu(display("stored partition {value:?} is malformed"))]
    InvalidPartition {
        source: serde_json::Error,
        value: String,
    },

    #[snafu(display("failed to serialize upgrade partition"))]
    SerializePartition { source: serde_json::Error },
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Self::DeployedWithoutTrust { app_name } => Status::blocked(format!(
                "Run `juju trust {app_name} --scope=cluster`. Needed to manage Kubernetes resources"
            )),
            Self::KubernetesApi { operation, .. } => {
                Status::blocked(format!("Kubernetes API request failed: {operation}"))
            }
            Self::MissingRevision { resource } => Status::waiting(format!(
                "Waiting for Kubernetes to report revision of {resource}"
            )),
            Self::InvalidConfig { source } => source.status(),
            Self::Container { .. } => Status::blocked("Failed to operate workload container"),
            Self::InvalidPartition { value, .. } => {
                Status::blocked(format!("Invalid upgrade partition {value:?}"))
            }
            Self::SerializePartition { .. } => Status::blocked("Failed to record upgrade partition"),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("MySQL Router did not accept connections on {ports:?} within {timeout:?}"))]
pub struct NotReadyError {
    ports: Vec<u16>,
    timeout: Duration,
}

/// Polling schedule used after the router has been (re)started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Readiness {
    /// Polls `probe` until it succeeds or the timeout has passed.
    pub fn wait(
        &self,
        ports: &[u16],
        mut probe: impl FnMut(&[u16]) -> bool,
    ) -> Result<(), NotReadyError> {
        let started = Instant::now();
        loop {
            if probe(ports) {
                tracing::debug!(?ports, elapsed = ?started.elapsed(), "MySQL Router ready");
                return Ok(());
            }
            if started.elapsed() >= self.timeout {
                return NotReadySnafu {
                    ports,
                    timeout: self.timeout,
                }
                .fail();
            }
            tracing::debug!(?ports, "waiting for MySQL Router to accept connections");
            thread::sleep(self.interval);
        }
    }
}

/// The capabilities the reconciler needs from the platform.
///
/// Implementations are constructed for a single event and may cache API responses for its
/// duration.
pub trait Platform: UpgradeBackend {
    type Container: Container;

    fn kind(&self) -> PlatformKind;

    fn container(&mut self) -> &mut Self::Container;

    fn container_ready(&self) -> bool;

    fn readiness(&self) -> Readiness {
        Readiness::default()
    }

    fn read_write_endpoint(&mut self, model: &Model) -> Result<String, Error>;

    fn read_only_endpoint(&mut self, model: &Model) -> Result<String, Error>;

    /// Endpoints reachable from outside the router host, [`None`] while not exposed.
    fn exposed_endpoints(&mut self, model: &Model) -> Result<Option<RouterEndpoints>, Error>;

    fn endpoints(&mut self, model: &Model) -> Result<Endpoints, Error> {
        Ok(Endpoints {
            internal: RouterEndpoints {
                read_write: self.read_write_endpoint(model)?,
                read_only: self.read_only_endpoint(model)?,
            },
            exposed: self.exposed_endpoints(model)?,
        })
    }

    /// Keeps the service exposing the router in line with the `expose-external` config.
    fn reconcile_node_port(&mut self, model: &Model) -> Result<(), Error>;

    /// Opens the router ports on the host if any client requested external connectivity.
    fn reconcile_ports(&mut self, model: &mut Model, external: bool) -> Result<(), Error>;

    /// Blocks until the router accepts connections.
    fn wait_until_ready(&mut self) -> Result<(), NotReadyError> {
        let readiness = self.readiness();
        let container = self.container();
        readiness.wait(&[ROUTER_READ_WRITE_PORT, ROUTER_READ_ONLY_PORT], |ports| {
            container.ports_listening(ports)
        })
    }

    /// Records the workload identity this unit runs, where other units cannot observe it.
    fn publish_workload_version(&mut self, _model: &mut Model) -> Result<(), Error> {
        Ok(())
    }

    /// Replaces the workload of this unit with the target version.
    ///
    /// Only machines refresh themselves, on Kubernetes the StatefulSet controller restarts pods.
    fn refresh_workload(&mut self, _model: &mut Model) -> Result<(), Error> {
        Ok(())
    }
}
