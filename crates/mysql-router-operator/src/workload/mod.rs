//! The MySQL Router workload.
//!
//! Whether the router can run depends on the backend connection, so the workload is a sum type:
//! without connection info it is [`Workload::Unauthenticated`] and kept stopped.

use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};

use crate::{
    platform::{NotReadyError, Platform},
    relations::{cos::ExporterConfig, database_requires::ConnectionInfo, tls::TlsMaterials},
    status::Status,
    workload::{container::Container, shell::Shell},
};

pub mod container;
pub mod host;
pub mod logrotate;
pub mod shell;

pub const TLS_KEY_FILE: &str = "custom-key.pem";
pub const TLS_CERTIFICATE_FILE: &str = "custom-certificate.pem";
pub const TLS_CA_FILE: &str = "custom-certificate-authority.pem";
pub const ROUTER_CONFIG_FILE: &str = "mysqlrouter.conf";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to operate the workload container"))]
    Container { source: container::Error },

    #[snafu(display("failed to bootstrap MySQL Router"))]
    Bootstrap { source: container::Error },

    #[snafu(display("failed to configure log rotation"))]
    Logrotate { source: logrotate::Error },

    #[snafu(display("MySQL Router did not become ready"))]
    NotReady { source: NotReadyError },
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Self::Container { .. } | Self::Logrotate { .. } => {
                Status::blocked("Failed to configure MySQL Router")
            }
            Self::Bootstrap { .. } => Status::blocked("Failed to bootstrap MySQL Router"),
            Self::NotReady { .. } => Status::maintenance("Waiting for MySQL Router to start"),
        }
    }
}

/// Desired configuration of an authenticated router.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReconcileRequest<'a> {
    pub tls: Option<&'a TlsMaterials>,
    pub exporter: Option<&'a ExporterConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Workload {
    /// No backend connection info, the router must not run.
    Unauthenticated,
    Authenticated { connection: ConnectionInfo },
}

impl Workload {
    pub fn new(connection: Option<ConnectionInfo>) -> Self {
        match connection {
            Some(connection) => Self::Authenticated { connection },
            None => Self::Unauthenticated,
        }
    }

    pub fn connection(&self) -> Option<&ConnectionInfo> {
        match self {
            Self::Unauthenticated => None,
            Self::Authenticated { connection } => Some(connection),
        }
    }

    /// Workload issues, [`None`] only if the router was verified to be fine.
    ///
    /// `router_name` is the name the router was bootstrapped with.
    pub fn status<C: Container>(&self, container: &mut C, router_name: &str) -> Option<Status> {
        if !container.ready() {
            return Some(Status::maintenance("Waiting for container"));
        }

        match self {
            Self::Unauthenticated => Some(Status::waiting("")),
            Self::Authenticated { connection } => {
                if !container.router_service_enabled() {
                    return None;
                }
                let router_id = format!("{}::{router_name}", container.hostname());
                match Shell::new(container, connection).is_router_in_cluster_set(&router_id) {
                    Ok(true) => None,
                    Ok(false) => Some(Status::blocked(
                        "Router was manually removed from MySQL ClusterSet. Remove & re-deploy unit",
                    )),
                    Err(error) => {
                        tracing::warn!(
                            error = &error as &dyn std::error::Error,
                            "failed to check cluster set membership"
                        );
                        Some(Status::waiting(
                            "Unable to verify MySQL Router cluster set membership",
                        ))
                    }
                }
            }
        }
    }

    /// Converges the container towards this workload.
    ///
    /// Every (re)start of the router blocks until it accepts connections.
    pub fn reconcile<P: Platform>(
        &self,
        platform: &mut P,
        router_name: &str,
        request: ReconcileRequest<'_>,
    ) -> Result<(), Error> {
        match self {
            Self::Unauthenticated => disable(platform.container()),
            Self::Authenticated { connection } => {
                enable(platform, connection, router_name, request)
            }
        }
    }
}

fn tls_paths<C: Container>(container: &C) -> [PathBuf; 3] {
    let directory = container.tls_directory();
    [
        directory.join(TLS_KEY_FILE),
        directory.join(TLS_CERTIFICATE_FILE),
        directory.join(TLS_CA_FILE),
    ]
}

/// Writes `content` unless the file already holds it. Returns whether the file changed.
fn write_if_changed<C: Container>(
    container: &mut C,
    path: &Path,
    content: &str,
) -> Result<bool, container::Error> {
    if container.read_file(path)?.as_deref() == Some(content) {
        return Ok(false);
    }
    container.write_file(path, content)?;
    Ok(true)
}

/// Brings the TLS files in line with `tls`. Returns whether they changed.
fn reconcile_tls_files<C: Container>(
    container: &mut C,
    tls: Option<&TlsMaterials>,
) -> Result<bool, container::Error> {
    let paths = tls_paths(container);
    match tls {
        Some(materials) => {
            let contents = [
                &materials.key,
                &materials.certificate,
                &materials.certificate_authority,
            ];
            let mut changed = false;
            for (path, content) in paths.iter().zip(contents) {
                changed |= write_if_changed(container, path, content)?;
            }
            Ok(changed)
        }
        None => {
            let mut changed = false;
            for path in &paths {
                if container.read_file(path)?.is_some() {
                    container.remove_file(path)?;
                    changed = true;
                }
            }
            Ok(changed)
        }
    }
}

fn bootstrap_command<C: Container>(
    container: &C,
    connection: &ConnectionInfo,
    router_name: &str,
) -> Vec<String> {
    vec![
        "mysqlrouter".to_owned(),
        "--bootstrap".to_owned(),
        connection.uri(),
        "--directory".to_owned(),
        container.router_directory().display().to_string(),
        "--name".to_owned(),
        router_name.to_owned(),
        "--user".to_owned(),
        "mysql".to_owned(),
        "--conf-use-gr-notifications".to_owned(),
        "--strict".to_owned(),
        "--force".to_owned(),
    ]
}

fn enable<P: Platform>(
    platform: &mut P,
    connection: &ConnectionInfo,
    router_name: &str,
    request: ReconcileRequest<'_>,
) -> Result<(), Error> {
    let container = platform.container();
    let tls = request.tls.is_some();
    let tls_changed = reconcile_tls_files(container, request.tls).context(ContainerSnafu)?;

    let restarted = if !container.router_service_enabled() {
        let command = bootstrap_command(container, connection, router_name);
        container
            .run_command(&command, None)
            .context(BootstrapSnafu)?;
        tracing::info!(router_name, "bootstrapped MySQL Router");
        container
            .update_router_service(true, tls)
            .context(ContainerSnafu)?;
        true
    } else if tls_changed {
        tracing::info!(tls, "restarting MySQL Router to apply TLS changes");
        container
            .update_router_service(true, tls)
            .context(ContainerSnafu)?;
        true
    } else {
        false
    };

    logrotate::enable(container).context(LogrotateSnafu)?;

    let exporter_toggled = request.exporter.is_some() != container.exporter_service_enabled();
    if exporter_toggled || (tls_changed && request.exporter.is_some()) {
        container
            .update_exporter_service(request.exporter, tls)
            .context(ContainerSnafu)?;
        tracing::info!(enabled = request.exporter.is_some(), "updated exporter");
    }

    if restarted {
        platform.wait_until_ready().context(NotReadySnafu)?;
    }
    Ok(())
}

fn disable<C: Container>(container: &mut C) -> Result<(), Error> {
    if container.exporter_service_enabled() {
        container
            .update_exporter_service(None, false)
            .context(ContainerSnafu)?;
        tracing::info!("stopped exporter");
    }

    if container.router_service_enabled() {
        container
            .update_router_service(false, false)
            .context(ContainerSnafu)?;
        // A new backend requires a new bootstrap
        let config = container.router_directory().join(ROUTER_CONFIG_FILE);
        container.remove_file(&config).context(ContainerSnafu)?;
        tracing::info!("stopped MySQL Router");
    }

    logrotate::disable(container).context(LogrotateSnafu)?;
    reconcile_tls_files(container, None).context(ContainerSnafu)?;
    Ok(())
}
