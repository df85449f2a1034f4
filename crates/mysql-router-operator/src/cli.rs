//! Command line and environment options of the operator process.
//!
//! Every option can also be set through the environment, Juju exports most of them to hooks.

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    platform::{PlatformKind, Readiness},
    unit::UnitId,
    versions::{self, VersionPair},
};

pub const DEFAULT_LOG_ENV: &str = "MYSQL_ROUTER_OPERATOR_LOG";

#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command {
    /// Handle a single event.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// The unit this process runs for, e.g. `mysql-router-k8s/0`.
    #[arg(long, env = "JUJU_UNIT_NAME")]
    pub unit: UnitId,

    /// Where the operator runs.
    #[arg(long, env, value_enum, default_value_t = PlatformKind::Kubernetes)]
    pub platform: PlatformKind,

    /// The Kubernetes namespace of the application, the Juju model name.
    #[arg(long, env = "JUJU_MODEL_NAME", default_value = "")]
    pub namespace: String,

    /// Directory holding the `charm_version` and `workload_version` files.
    #[arg(long, env, value_name = "DIRECTORY", default_value = ".")]
    pub version_directory: PathBuf,

    /// The event to handle, as JSON, e.g. `{"kind": "update-status"}`.
    #[arg(long, env, default_value = r#"{"kind": "update-status"}"#)]
    pub event: String,

    /// File the unit's model is loaded from and saved to. Created on the first event.
    #[arg(long, env, value_name = "FILE", default_value = "state.json")]
    pub state_file: PathBuf,

    /// Directory the workload's file system is reachable under.
    #[arg(long, env, value_name = "DIRECTORY", default_value = "/")]
    pub workload_root: PathBuf,

    /// Snap revision the operator installs on machines.
    #[arg(long, env)]
    pub snap_revision: Option<String>,

    /// Cooldown after lowering the StatefulSet partition.
    #[arg(long, env, default_value = "30s")]
    pub partition_settle_delay: humantime::Duration,

    /// Interval between checks whether MySQL Router accepts connections.
    #[arg(long, env, default_value = "5s")]
    pub readiness_interval: humantime::Duration,

    /// How long to wait for MySQL Router to accept connections after a (re)start.
    #[arg(long, env, default_value = "30s")]
    pub readiness_timeout: humantime::Duration,

    /// Environment variable holding the log filter. `{log_env}_DIRECTORY` enables file logging.
    #[arg(long, env, default_value = DEFAULT_LOG_ENV)]
    pub log_env: String,
}

impl RunArguments {
    pub fn readiness(&self) -> Readiness {
        Readiness {
            interval: *self.readiness_interval,
            timeout: *self.readiness_timeout,
        }
    }

    pub fn partition_settle_delay(&self) -> Duration {
        *self.partition_settle_delay
    }

    /// Reads the packaged versions. The process must not handle events if this fails.
    pub fn versions(&self) -> Result<VersionPair, versions::Error> {
        VersionPair::from_directory(&self.version_directory)
    }
}
