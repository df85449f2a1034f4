//! Fake collaborators recording every side effect, and fixtures shared by the scenarios.

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use k8s_openapi::{
    api::{
        apps::v1::{
            RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetStatus,
            StatefulSetUpdateStrategy,
        },
        core::v1::{Node, NodeAddress, NodeStatus, Pod, PodSpec, Service},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use mysql_router_operator::{
    model::{Databag, Model, Relation, RelationId},
    platform::{
        Readiness,
        kubernetes::{ApiError, Kubernetes, KubernetesApi},
        machine::{Machine, Snap},
    },
    relations::{BACKEND_DATABASE_ENDPOINT, DATABASE_ENDPOINT, cos::ExporterConfig},
    unit::UnitId,
    upgrade::PEER_RELATION_ENDPOINT,
    versions::VersionPair,
    workload::container::{self, Container},
};
use semver::Version;

pub const APP: &str = "mysql-router-k8s";
pub const NAMESPACE: &str = "database";
pub const OLD_REVISION: &str = "mysql-router-k8s-5d8f6c9b7";
pub const NEW_REVISION: &str = "mysql-router-k8s-7c4b9d6f8";

pub const BACKEND_RELATION_ID: RelationId = 1;
pub const PEER_RELATION_ID: RelationId = 2;

/// A side effect issued against the workload container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    UpdateRouter { enabled: bool, tls: bool },
    UpdateExporter { enabled: bool, tls: bool },
    RunCommand(Vec<String>),
    /// A MySQL Shell script, recorded by its content.
    MysqlShell(String),
    WriteFile(PathBuf),
    RemoveFile(PathBuf),
    RefreshSnap(String),
}

impl Call {
    /// Whether the call changes state. Cluster set membership probes only read.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::MysqlShell(script) if script.contains("list_routers"))
    }
}

#[derive(Debug)]
pub struct FakeContainer {
    pub ready: bool,
    pub router_enabled: bool,
    pub router_tls: bool,
    pub exporter: Option<ExporterConfig>,
    pub files: BTreeMap<PathBuf, String>,
    pub in_cluster_set: bool,
    pub listening: bool,
    /// Every MySQL Shell invocation exits non-zero.
    pub shell_fails: bool,
    pub snap_revision: String,
    pub calls: Vec<Call>,
}

impl Default for FakeContainer {
    fn default() -> Self {
        Self {
            ready: true,
            router_enabled: false,
            router_tls: false,
            exporter: None,
            files: BTreeMap::new(),
            in_cluster_set: true,
            listening: true,
            shell_fails: false,
            snap_revision: OLD_REVISION.to_owned(),
            calls: Vec::new(),
        }
    }
}

impl FakeContainer {
    pub fn not_ready() -> Self {
        Self {
            ready: false,
            ..Self::default()
        }
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls
            .iter()
            .filter(|call| call.is_mutation())
            .cloned()
            .collect()
    }

    pub fn shell_scripts_containing(&self, needle: &str) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, Call::MysqlShell(script) if script.contains(needle)))
            .count()
    }

    fn is_scratch_file(&self, path: &Path) -> bool {
        path.starts_with(self.scratch_directory())
    }
}

impl Container for FakeContainer {
    fn ready(&self) -> bool {
        self.ready
    }

    fn hostname(&self) -> String {
        format!("{APP}-0")
    }

    fn router_service_enabled(&self) -> bool {
        self.router_enabled
    }

    fn update_router_service(&mut self, enabled: bool, tls: bool) -> container::Result<()> {
        self.router_enabled = enabled;
        self.router_tls = tls;
        self.calls.push(Call::UpdateRouter { enabled, tls });
        Ok(())
    }

    fn exporter_service_enabled(&self) -> bool {
        self.exporter.is_some()
    }

    fn update_exporter_service(
        &mut self,
        config: Option<&ExporterConfig>,
        tls: bool,
    ) -> container::Result<()> {
        self.exporter = config.cloned();
        self.calls.push(Call::UpdateExporter {
            enabled: config.is_some(),
            tls,
        });
        Ok(())
    }

    fn run_command(&mut self, command: &[String], _input: Option<&str>) -> container::Result<String> {
        if command.first().map(String::as_str) != Some("mysqlsh") {
            self.calls.push(Call::RunCommand(command.to_vec()));
            return Ok(String::new());
        }

        let script = command
            .last()
            .and_then(|path| self.files.get(Path::new(path)))
            .cloned()
            .unwrap_or_default();
        let output = if script.contains("list_routers") {
            self.in_cluster_set.to_string()
        } else {
            String::new()
        };
        self.calls.push(Call::MysqlShell(script));
        if self.shell_fails {
            return Err(container::Error::CommandFailed {
                command: command.to_vec(),
                exit_code: 1,
                stderr: "Can't connect to MySQL server".to_owned(),
            });
        }
        Ok(output)
    }

    fn read_file(&self, path: &Path) -> container::Result<Option<String>> {
        Ok(self.files.get(path).cloned())
    }

    fn write_file(&mut self, path: &Path, content: &str) -> container::Result<()> {
        if !self.is_scratch_file(path) {
            self.calls.push(Call::WriteFile(path.to_owned()));
        }
        self.files.insert(path.to_owned(), content.to_owned());
        Ok(())
    }

    fn remove_file(&mut self, path: &Path) -> container::Result<()> {
        if !self.is_scratch_file(path) {
            self.calls.push(Call::RemoveFile(path.to_owned()));
        }
        self.files.remove(path);
        Ok(())
    }

    fn ports_listening(&mut self, _ports: &[u16]) -> bool {
        self.router_enabled && self.listening
    }
}

impl Snap for FakeContainer {
    fn installed_revision(&self) -> container::Result<String> {
        Ok(self.snap_revision.clone())
    }

    fn refresh(&mut self, revision: &str) -> container::Result<()> {
        self.snap_revision = revision.to_owned();
        self.calls.push(Call::RefreshSnap(revision.to_owned()));
        Ok(())
    }
}

/// An in-memory namespace holding the router StatefulSet, its pods and nodes.
#[derive(Debug)]
pub struct FakeKubernetesApi {
    pub stateful_set: StatefulSet,
    pub pods: BTreeMap<String, Pod>,
    pub nodes: BTreeMap<String, Node>,
    pub service: Option<Service>,
    /// Simulates an application deployed without `juju trust`.
    pub forbidden: bool,
    pub stateful_set_gets: usize,
    pub partition_patches: Vec<u32>,
    pub applied_services: Vec<Service>,
}

impl FakeKubernetesApi {
    /// A StatefulSet targeting `update_revision` whose pods all run `update_revision`.
    pub fn new(units: &[u32], update_revision: &str, partition: u32) -> Self {
        let stateful_set = StatefulSet {
            metadata: ObjectMeta {
                name: Some(APP.to_owned()),
                namespace: Some(NAMESPACE.to_owned()),
                ..ObjectMeta::default()
            },
            spec: Some(StatefulSetSpec {
                update_strategy: Some(StatefulSetUpdateStrategy {
                    rolling_update: Some(RollingUpdateStatefulSetStrategy {
                        partition: Some(partition.try_into().expect("partition fits i32")),
                        ..RollingUpdateStatefulSetStrategy::default()
                    }),
                    type_: Some("RollingUpdate".to_owned()),
                }),
                ..StatefulSetSpec::default()
            }),
            status: Some(StatefulSetStatus {
                update_revision: Some(update_revision.to_owned()),
                ..StatefulSetStatus::default()
            }),
        };

        let mut api = Self {
            stateful_set,
            pods: BTreeMap::new(),
            nodes: BTreeMap::new(),
            service: None,
            forbidden: false,
            stateful_set_gets: 0,
            partition_patches: Vec::new(),
            applied_services: Vec::new(),
        };
        for number in units {
            api.set_pod_revision(*number, update_revision);
        }
        api.nodes.insert("node-0".to_owned(), node("node-0", "10.1.2.3"));
        api
    }

    pub fn set_pod_revision(&mut self, number: u32, revision: &str) {
        let name = UnitId::new(APP, number).pod_name();
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([(
                    "controller-revision-hash".to_owned(),
                    revision.to_owned(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-0".to_owned()),
                ..PodSpec::default()
            }),
            status: None,
        };
        self.pods.insert(name, pod);
    }

    pub fn partition(&self) -> u32 {
        self.stateful_set
            .spec
            .as_ref()
            .and_then(|spec| spec.update_strategy.as_ref())
            .and_then(|strategy| strategy.rolling_update.as_ref())
            .and_then(|rolling_update| rolling_update.partition)
            .and_then(|partition| u32::try_from(partition).ok())
            .unwrap_or_default()
    }

    pub fn service_type(&self) -> Option<String> {
        self.service
            .as_ref()
            .and_then(|service| service.spec.as_ref())
            .and_then(|spec| spec.type_.clone())
    }
}

fn node(name: &str, address: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            ..ObjectMeta::default()
        },
        spec: None,
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                address: address.to_owned(),
                type_: "InternalIP".to_owned(),
            }]),
            ..NodeStatus::default()
        }),
    }
}

impl KubernetesApi for FakeKubernetesApi {
    fn get_stateful_set(&mut self, _name: &str) -> Result<StatefulSet, ApiError> {
        self.stateful_set_gets += 1;
        Ok(self.stateful_set.clone())
    }

    fn patch_stateful_set_partition(&mut self, _name: &str, partition: u32) -> Result<(), ApiError> {
        if self.forbidden {
            return Err(ApiError::Forbidden);
        }
        if let Some(rolling_update) = self
            .stateful_set
            .spec
            .as_mut()
            .and_then(|spec| spec.update_strategy.as_mut())
            .and_then(|strategy| strategy.rolling_update.as_mut())
        {
            rolling_update.partition = Some(partition.try_into().expect("partition fits i32"));
        }
        self.partition_patches.push(partition);
        Ok(())
    }

    fn get_pod(&mut self, name: &str) -> Result<Pod, ApiError> {
        self.pods.get(name).cloned().ok_or(ApiError::NotFound)
    }

    fn get_node(&mut self, name: &str) -> Result<Node, ApiError> {
        self.nodes.get(name).cloned().ok_or(ApiError::NotFound)
    }

    fn get_service(&mut self, _name: &str) -> Result<Option<Service>, ApiError> {
        if self.forbidden {
            return Err(ApiError::Forbidden);
        }
        Ok(self.service.clone())
    }

    fn apply_service(&mut self, service: &Service) -> Result<(), ApiError> {
        if self.forbidden {
            return Err(ApiError::Forbidden);
        }
        self.service = Some(service.clone());
        self.applied_services.push(service.clone());
        Ok(())
    }
}

pub fn instant_readiness() -> Readiness {
    Readiness {
        interval: Duration::ZERO,
        timeout: Duration::ZERO,
    }
}

pub fn kubernetes(
    api: FakeKubernetesApi,
    container: FakeContainer,
) -> Kubernetes<FakeKubernetesApi, FakeContainer> {
    Kubernetes::new(api, container, APP, NAMESPACE)
        .with_settle_delay(Duration::ZERO)
        .with_readiness(instant_readiness())
}

pub fn machine(container: FakeContainer, target_revision: &str) -> Machine<FakeContainer> {
    Machine::new(container, target_revision).with_readiness(instant_readiness())
}

pub fn versions() -> VersionPair {
    VersionPair::new(Version::new(3, 1, 0), Version::new(8, 0, 36))
}

pub fn model(unit_number: u32, leader: bool) -> Model {
    let mut model = Model::new(UnitId::new(APP, unit_number));
    model.leader = leader;
    model
}

pub fn databag(entries: &[(&str, &str)]) -> Databag {
    entries.iter().copied().collect()
}

pub fn backend_relation() -> Relation {
    let mut relation = Relation::new(BACKEND_RELATION_ID, BACKEND_DATABASE_ENDPOINT)
        .with_remote_app("mysql-k8s");
    relation.remote_app_data = databag(&[
        ("username", "router-admin"),
        ("password", "admin-secret"),
        ("endpoints", "mysql-k8s-primary.database.svc.cluster.local:3306"),
    ]);
    relation
}

pub fn client_relation(id: RelationId, remote_app: &str, database: &str) -> Relation {
    let mut relation = Relation::new(id, DATABASE_ENDPOINT).with_remote_app(remote_app);
    relation.remote_app_data = databag(&[("database", database)]);
    relation
}

/// The upgrade peer relation as seen by `own`, with the health state of every unit.
pub fn peer_relation(own: u32, states: &[(u32, &str)]) -> Relation {
    let mut relation = Relation::new(PEER_RELATION_ID, PEER_RELATION_ENDPOINT);
    for (number, state) in states {
        let data = databag(&[("state", *state)]);
        if *number == own {
            relation.local_unit_data = data;
        } else {
            relation.remote_units.insert(UnitId::new(APP, *number), data);
        }
    }
    relation
}
