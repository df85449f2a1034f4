//! [`Container`] and [`Snap`] for the host the operator process runs on.
//!
//! On Kubernetes MySQL Router runs as a Pebble service of the workload sidecar, which shares the
//! router directories with the operator container. The Pebble client has to reach the sidecar,
//! e.g. through `PEBBLE_SOCKET`. On machines MySQL Router runs from the `charmed-mysql` snap.

use std::{
    fs,
    io::{ErrorKind, Write},
    net::{Ipv4Addr, SocketAddr, TcpStream},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

use serde_json::json;

use crate::{
    platform::machine::Snap,
    relations::cos::ExporterConfig,
    workload::{
        ROUTER_CONFIG_FILE, TLS_CA_FILE, TLS_CERTIFICATE_FILE, TLS_KEY_FILE,
        container::{self, Container},
    },
};

const UNIX_USER: &str = "mysql";
const SNAP_NAME: &str = "charmed-mysql";
const TLS_CONFIG_FILE: &str = "tls.conf";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

const PEBBLE_ROUTER_SERVICE: &str = "mysql_router";
const PEBBLE_EXPORTER_SERVICE: &str = "mysql_router_exporter";

/// How the MySQL Router services are managed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceManager {
    /// Services of the Pebble instance in the workload sidecar.
    Pebble,

    /// Services of the `charmed-mysql` snap.
    Snap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Service {
    Router,
    Exporter,
}

impl ServiceManager {
    fn service_name(self, service: Service) -> &'static str {
        match (self, service) {
            (Self::Pebble, Service::Router) => PEBBLE_ROUTER_SERVICE,
            (Self::Pebble, Service::Exporter) => PEBBLE_EXPORTER_SERVICE,
            (Self::Snap, Service::Router) => "charmed-mysql.mysqlrouter-service",
            (Self::Snap, Service::Exporter) => "charmed-mysql.mysqlrouter-exporter",
        }
    }

    /// Lists the services of this manager, including their startup mode.
    fn status_command(self, name: &str) -> Vec<String> {
        let program = match self {
            Self::Pebble => "pebble",
            Self::Snap => "snap",
        };
        strings(&[program, "services", name])
    }
}

#[derive(Debug)]
pub struct HostContainer {
    manager: ServiceManager,
    root: PathBuf,
}

impl HostContainer {
    pub fn new(manager: ServiceManager) -> Self {
        Self {
            manager,
            root: PathBuf::from("/"),
        }
    }

    /// Resolves container paths below `root` instead of the file system root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    fn host_path(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    /// The command line that runs `command` as the workload user.
    fn workload_command(&self, command: &[String]) -> Vec<String> {
        match self.manager {
            ServiceManager::Pebble => strings(&[
                "pebble", "exec", "--user", UNIX_USER, "--group", UNIX_USER, "--",
            ])
            .into_iter()
            .chain(command.iter().cloned())
            .collect(),
            ServiceManager::Snap => match command.split_first() {
                Some((program, arguments)) if program == "mysqlrouter" || program == "mysqlsh" => {
                    std::iter::once(format!("{SNAP_NAME}.{program}"))
                        .chain(arguments.iter().cloned())
                        .collect()
                }
                _ => command.to_vec(),
            },
        }
    }

    fn service_enabled(&self, service: Service) -> bool {
        let name = self.manager.service_name(service);
        match execute(&self.manager.status_command(name), None) {
            Ok(output) => startup_enabled(&output, name),
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    service = name,
                    "failed to query service"
                );
                false
            }
        }
    }

    fn router_command(&self, tls: bool) -> String {
        let router_directory = self.router_directory();
        let mut command = format!(
            "mysqlrouter --config {}",
            router_directory.join(ROUTER_CONFIG_FILE).display()
        );
        if tls {
            command.push_str(&format!(
                " --extra-config {}",
                router_directory.join(TLS_CONFIG_FILE).display()
            ));
        }
        command
    }

    fn write_tls_config(&mut self, tls: bool) -> container::Result<()> {
        let path = self.router_directory().join(TLS_CONFIG_FILE);
        if tls {
            let config = tls_config(&self.tls_directory());
            self.write_file(&path, &config)
        } else {
            self.remove_file(&path)
        }
    }

    /// Replaces the Pebble service `name` with the one in `layer` and (re)starts or stops it.
    fn apply_pebble_layer(
        &mut self,
        name: &str,
        layer: &serde_json::Value,
        enabled: bool,
    ) -> container::Result<()> {
        // JSON is valid YAML
        let path = self.scratch_directory().join(format!("{name}-layer.yaml"));
        self.write_file(&path, &layer.to_string())?;
        let layer_path = self.host_path(&path).display().to_string();

        execute(&strings(&["pebble", "add", name, &layer_path, "--combine"]), None)?;
        let action = if enabled { "restart" } else { "stop" };
        execute(&strings(&["pebble", action, name]), None)?;
        tracing::debug!(service = name, action, "applied Pebble layer");
        Ok(())
    }

    fn update_snap_service(&self, service: Service, enabled: bool) -> container::Result<()> {
        let name = self.manager.service_name(service);
        let command = match (enabled, self.service_enabled(service)) {
            (true, true) => strings(&["snap", "restart", name]),
            (true, false) => strings(&["snap", "start", "--enable", name]),
            (false, _) => strings(&["snap", "stop", "--disable", name]),
        };
        execute(&command, None)?;
        tracing::debug!(service = name, enabled, "updated snap service");
        Ok(())
    }

    fn exporter_tls_paths(&self) -> [(&'static str, PathBuf); 3] {
        let directory = self.tls_directory();
        [
            ("MYSQLROUTER_TLS_CACERT_PATH", directory.join(TLS_CA_FILE)),
            ("MYSQLROUTER_TLS_CERT_PATH", directory.join(TLS_CERTIFICATE_FILE)),
            ("MYSQLROUTER_TLS_KEY_PATH", directory.join(TLS_KEY_FILE)),
        ]
    }
}

impl Container for HostContainer {
    fn ready(&self) -> bool {
        let command = match self.manager {
            ServiceManager::Pebble => strings(&["pebble", "services"]),
            ServiceManager::Snap => strings(&["snap", "list", SNAP_NAME]),
        };
        execute(&command, None).is_ok()
    }

    fn hostname(&self) -> String {
        std::env::var("HOSTNAME")
            .ok()
            .or_else(|| fs::read_to_string("/etc/hostname").ok())
            .map(|hostname| hostname.trim().to_owned())
            .unwrap_or_default()
    }

    fn router_service_enabled(&self) -> bool {
        self.service_enabled(Service::Router)
    }

    fn update_router_service(&mut self, enabled: bool, tls: bool) -> container::Result<()> {
        self.write_tls_config(enabled && tls)?;
        match self.manager {
            ServiceManager::Pebble => {
                let layer = router_layer(&self.router_command(tls), enabled);
                self.apply_pebble_layer(PEBBLE_ROUTER_SERVICE, &layer, enabled)
            }
            ServiceManager::Snap => {
                let key = "mysqlrouter.extra-config";
                let command = if enabled && tls {
                    let path = self.router_directory().join(TLS_CONFIG_FILE);
                    strings(&["snap", "set", SNAP_NAME, &format!("{key}={}", path.display())])
                } else {
                    strings(&["snap", "unset", SNAP_NAME, key])
                };
                execute(&command, None)?;
                self.update_snap_service(Service::Router, enabled)
            }
        }
    }

    fn exporter_service_enabled(&self) -> bool {
        self.service_enabled(Service::Exporter)
    }

    fn update_exporter_service(
        &mut self,
        config: Option<&ExporterConfig>,
        tls: bool,
    ) -> container::Result<()> {
        let tls_paths = if tls {
            self.exporter_tls_paths().to_vec()
        } else {
            Vec::new()
        };
        match self.manager {
            ServiceManager::Pebble => {
                let layer = exporter_layer(config, &tls_paths);
                self.apply_pebble_layer(PEBBLE_EXPORTER_SERVICE, &layer, config.is_some())
            }
            ServiceManager::Snap => {
                if let Some(config) = config {
                    let mut command = strings(&["snap", "set", SNAP_NAME]);
                    command.extend(exporter_snap_settings(config, &tls_paths));
                    execute(&command, None)?;
                }
                self.update_snap_service(Service::Exporter, config.is_some())
            }
        }
    }

    fn run_command(&mut self, command: &[String], input: Option<&str>) -> container::Result<String> {
        execute(&self.workload_command(command), input)
    }

    fn read_file(&self, path: &Path) -> container::Result<Option<String>> {
        match fs::read_to_string(self.host_path(path)) {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(file_access(path, &error)),
        }
    }

    fn write_file(&mut self, path: &Path, content: &str) -> container::Result<()> {
        let host_path = self.host_path(path);
        if let Some(parent) = host_path.parent() {
            fs::create_dir_all(parent).map_err(|error| file_access(path, &error))?;
        }
        fs::write(&host_path, content).map_err(|error| file_access(path, &error))?;
        fs::set_permissions(&host_path, fs::Permissions::from_mode(0o600))
            .map_err(|error| file_access(path, &error))
    }

    fn remove_file(&mut self, path: &Path) -> container::Result<()> {
        match fs::remove_file(self.host_path(path)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(file_access(path, &error)),
        }
    }

    fn ports_listening(&mut self, ports: &[u16]) -> bool {
        ports.iter().all(|port| {
            let address = SocketAddr::from((Ipv4Addr::LOCALHOST, *port));
            TcpStream::connect_timeout(&address, CONNECT_TIMEOUT).is_ok()
        })
    }
}

impl Snap for HostContainer {
    fn installed_revision(&self) -> container::Result<String> {
        let command = strings(&["snap", "list", SNAP_NAME]);
        let output = execute(&command, None)?;
        installed_snap_revision(&output, SNAP_NAME)
            .ok_or(container::Error::UnexpectedOutput { command })
    }

    fn refresh(&mut self, revision: &str) -> container::Result<()> {
        execute(
            &strings(&["snap", "refresh", SNAP_NAME, "--revision", revision]),
            None,
        )?;
        // Keep automatic refreshes from bypassing the upgrade order
        execute(&strings(&["snap", "refresh", "--hold", SNAP_NAME]), None)?;
        tracing::info!(revision, "refreshed snap");
        Ok(())
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

fn file_access(path: &Path, error: &std::io::Error) -> container::Error {
    container::Error::FileAccess {
        path: path.to_owned(),
        message: error.to_string(),
    }
}

/// Runs `command` to completion, feeding `input` to its standard input.
fn execute(command: &[String], input: Option<&str>) -> container::Result<String> {
    let spawn_error = |source| container::Error::Spawn {
        source,
        command: command.to_vec(),
    };
    let Some((program, arguments)) = command.split_first() else {
        return Err(spawn_error(std::io::Error::new(
            ErrorKind::InvalidInput,
            "empty command",
        )));
    };

    let mut child = Command::new(program)
        .args(arguments)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_error)?;
    if let Some(input) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).map_err(spawn_error)?;
        }
    }

    let output = child.wait_with_output().map_err(spawn_error)?;
    if !output.status.success() {
        return Err(container::Error::CommandFailed {
            command: command.to_vec(),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether `service` is listed with startup `enabled` in the output of `pebble services` or
/// `snap services`.
fn startup_enabled(output: &str, service: &str) -> bool {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            Some((columns.next()?, columns.next()?))
        })
        .any(|(name, startup)| name == service && startup == "enabled")
}

/// The `Rev` column of `snap` in the output of `snap list`.
fn installed_snap_revision(output: &str, snap: &str) -> Option<String> {
    let mut lines = output.lines();
    let column = lines
        .next()?
        .split_whitespace()
        .position(|header| header == "Rev")?;
    lines
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .find(|columns| columns.first() == Some(&snap))?
        .get(column)
        .map(|revision| (*revision).to_owned())
}

/// MySQL Router options serving client connections with the custom certificate.
fn tls_config(tls_directory: &Path) -> String {
    format!(
        "[DEFAULT]\nclient_ssl_mode = PREFERRED\nclient_ssl_cert = {}\nclient_ssl_key = {}\n",
        tls_directory.join(TLS_CERTIFICATE_FILE).display(),
        tls_directory.join(TLS_KEY_FILE).display()
    )
}

fn startup(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}

fn router_layer(command: &str, enabled: bool) -> serde_json::Value {
    json!({
        "summary": "MySQL Router layer",
        "services": {
            "mysql_router": {
                "override": "replace",
                "summary": "MySQL Router",
                "command": command,
                "startup": startup(enabled),
                "user": UNIX_USER,
                "group": UNIX_USER,
            },
        },
    })
}

fn exporter_layer(
    config: Option<&ExporterConfig>,
    tls_paths: &[(&str, PathBuf)],
) -> serde_json::Value {
    let mut environment = serde_json::Map::new();
    let mut command = "mysqlrouter_exporter".to_owned();
    if let Some(config) = config {
        command.push_str(&format!(" --listen-port {}", config.listen_port));
        environment.insert("MYSQLROUTER_EXPORTER_URL".to_owned(), json!(config.url));
        environment.insert("MYSQLROUTER_EXPORTER_USER".to_owned(), json!(config.username));
        environment.insert("MYSQLROUTER_EXPORTER_PASS".to_owned(), json!(config.password));
        for (name, path) in tls_paths {
            environment.insert((*name).to_owned(), json!(path.display().to_string()));
        }
    }
    json!({
        "summary": "MySQL Router exporter layer",
        "services": {
            "mysql_router_exporter": {
                "override": "replace",
                "summary": "MySQL Router exporter",
                "command": command,
                "startup": startup(config.is_some()),
                "user": UNIX_USER,
                "group": UNIX_USER,
                "environment": environment,
            },
        },
    })
}

fn exporter_snap_settings(config: &ExporterConfig, tls_paths: &[(&str, PathBuf)]) -> Vec<String> {
    let mut settings = vec![
        format!("mysqlrouter-exporter.listen-port={}", config.listen_port),
        format!("mysqlrouter-exporter.url={}", config.url),
        format!("mysqlrouter-exporter.user={}", config.username),
        format!("mysqlrouter-exporter.password={}", config.password),
    ];
    settings.extend(tls_paths.iter().map(|(name, path)| {
        let key = name
            .trim_start_matches("MYSQLROUTER_")
            .to_lowercase()
            .replace('_', "-");
        format!("mysqlrouter-exporter.{key}={}", path.display())
    }));
    settings
}
