//! The workload container, on Kubernetes a pod sidecar and on machines a snap.

use std::path::{Path, PathBuf};

use snafu::Snafu;

use crate::relations::cos::ExporterConfig;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("command {command:?} exited with code {exit_code}: {stderr}"))]
    CommandFailed {
        command: Vec<String>,
        exit_code: i32,
        stderr: String,
    },

    #[snafu(display("failed to run command {command:?}"))]
    Spawn {
        source: std::io::Error,
        command: Vec<String>,
    },

    #[snafu(display("command {command:?} printed unexpected output"))]
    UnexpectedOutput { command: Vec<String> },

    #[snafu(display("failed to access {path:?}: {message}"))]
    FileAccess { path: PathBuf, message: String },

    #[snafu(display("failed to update service {service}: {message}"))]
    UpdateService { service: String, message: String },
}

/// Operations the operator performs inside the workload container.
///
/// Service updates are expected to be idempotent: a service is only (re)started when its
/// desired state differs from the current one.
pub trait Container {
    /// Whether the container can accept commands.
    fn ready(&self) -> bool;

    /// Hostname MySQL Router registers with in the cluster set metadata.
    fn hostname(&self) -> String;

    fn router_service_enabled(&self) -> bool;

    /// Starts, restarts or stops MySQL Router.
    ///
    /// With `tls` the router serves the certificate stored below [`Container::tls_directory`].
    fn update_router_service(&mut self, enabled: bool, tls: bool) -> Result<()>;

    fn exporter_service_enabled(&self) -> bool;

    /// Starts, restarts or stops the MySQL Router Prometheus exporter.
    fn update_exporter_service(&mut self, config: Option<&ExporterConfig>, tls: bool)
    -> Result<()>;

    /// Runs `command` to completion and returns its standard output.
    fn run_command(&mut self, command: &[String], input: Option<&str>) -> Result<String>;

    /// Returns [`None`] if the file does not exist.
    fn read_file(&self, path: &Path) -> Result<Option<String>>;

    fn write_file(&mut self, path: &Path, content: &str) -> Result<()>;

    /// Removing a file that does not exist is not an error.
    fn remove_file(&mut self, path: &Path) -> Result<()>;

    /// Whether MySQL Router accepts connections on all of `ports`.
    fn ports_listening(&mut self, ports: &[u16]) -> bool;

    /// Directory holding the MySQL Router configuration.
    fn router_directory(&self) -> PathBuf {
        PathBuf::from("/etc/mysqlrouter")
    }

    fn tls_directory(&self) -> PathBuf {
        self.router_directory().join("tls")
    }

    fn log_directory(&self) -> PathBuf {
        PathBuf::from("/var/log/mysqlrouter")
    }

    fn logrotate_config_path(&self) -> PathBuf {
        PathBuf::from("/etc/logrotate.d/flush_mysqlrouter_logs")
    }

    /// Scratch directory for MySQL Shell scripts.
    fn scratch_directory(&self) -> PathBuf {
        PathBuf::from("/tmp")
    }
}
