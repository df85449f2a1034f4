//! The router as a sidecar of a StatefulSet pod.
//!
//! The StatefulSet `updateStrategy.rollingUpdate.partition` is the upgrade partition. Pods are
//! compared by their `controller-revision-hash` label against the StatefulSet `updateRevision`,
//! since Kubernetes restarts pods for spec changes that do not change any version.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    thread,
    time::Duration,
};

use k8s_openapi::{
    api::{
        apps::v1::StatefulSet,
        core::v1::{Node, Pod, Service, ServicePort, ServiceSpec},
    },
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    config::ExposeExternal,
    model::Model,
    platform::{
        Error, InvalidConfigSnafu, MissingRevisionSnafu, Platform, PlatformKind, Readiness,
        ROUTER_READ_ONLY_PORT, ROUTER_READ_WRITE_PORT,
    },
    relations::database_provides::RouterEndpoints,
    status::Status,
    unit::UnitId,
    upgrade::UpgradeBackend,
    versions::VersionPair,
    workload::container::Container,
};

pub mod client;

pub use client::KubeApi;

const REVISION_HASH_LABEL: &str = "controller-revision-hash";
const APP_NAME_LABEL: &str = "app.kubernetes.io/name";

/// Pause after lowering the partition. Rapid successive partition writes hang the Juju agent.
pub const DEFAULT_PARTITION_SETTLE_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum ApiError {
    #[snafu(display("forbidden"))]
    Forbidden,

    #[snafu(display("not found"))]
    NotFound,

    #[snafu(display("{message}"))]
    Request { message: String },
}

/// The Kubernetes requests the operator issues, all within the namespace of the application.
pub trait KubernetesApi {
    fn get_stateful_set(&mut self, name: &str) -> Result<StatefulSet, ApiError>;

    fn patch_stateful_set_partition(&mut self, name: &str, partition: u32)
    -> Result<(), ApiError>;

    fn get_pod(&mut self, name: &str) -> Result<Pod, ApiError>;

    fn get_node(&mut self, name: &str) -> Result<Node, ApiError>;

    /// Returns [`None`] if the service does not exist.
    fn get_service(&mut self, name: &str) -> Result<Option<Service>, ApiError>;

    /// Creates or updates the service.
    fn apply_service(&mut self, service: &Service) -> Result<(), ApiError>;
}

/// API responses for the duration of one event.
#[derive(Debug, Default)]
struct EventCache {
    stateful_set: Option<StatefulSet>,
    pods: BTreeMap<String, Pod>,
    nodes: BTreeMap<String, Node>,
    service: Option<Option<Service>>,
}

pub fn service_name(app_name: &str) -> String {
    format!("{app_name}-service")
}

fn service_type(expose_external: ExposeExternal) -> &'static str {
    match expose_external {
        ExposeExternal::False => "ClusterIP",
        ExposeExternal::NodePort => "NodePort",
        ExposeExternal::LoadBalancer => "LoadBalancer",
    }
}

fn service_port(name: &str, port: u16) -> ServicePort {
    ServicePort {
        name: Some(name.to_owned()),
        port: port.into(),
        target_port: Some(IntOrString::Int(port.into())),
        ..ServicePort::default()
    }
}

/// The service exposing the router pods of `app_name`.
pub fn build_service(app_name: &str, namespace: &str, expose_external: ExposeExternal) -> Service {
    let labels = BTreeMap::from([(APP_NAME_LABEL.to_owned(), app_name.to_owned())]);
    Service {
        metadata: ObjectMeta {
            name: Some(service_name(app_name)),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type(expose_external).to_owned()),
            selector: Some(labels),
            ports: Some(vec![
                service_port("mysql-rw", ROUTER_READ_WRITE_PORT),
                service_port("mysql-ro", ROUTER_READ_ONLY_PORT),
            ]),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

fn short_revision(revision: &str) -> &str {
    revision.rsplit('-').next().unwrap_or(revision)
}

pub struct Kubernetes<A, C> {
    api: A,
    container: C,
    app_name: String,
    namespace: String,
    settle_delay: Duration,
    readiness: Readiness,
    cache: EventCache,
}

impl<A: KubernetesApi, C: Container> Kubernetes<A, C> {
    pub fn new(
        api: A,
        container: C,
        app_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api,
            container,
            app_name: app_name.into(),
            namespace: namespace.into(),
            settle_delay: DEFAULT_PARTITION_SETTLE_DELAY,
            readiness: Readiness::default(),
            cache: EventCache::default(),
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Ends the event, dropping cached responses and handing back the collaborators.
    pub fn into_parts(self) -> (A, C) {
        (self.api, self.container)
    }

    fn api_error(app_name: &str, source: ApiError, operation: &str) -> Error {
        match source {
            ApiError::Forbidden => Error::DeployedWithoutTrust {
                app_name: app_name.to_owned(),
            },
            source => Error::KubernetesApi {
                source,
                operation: operation.to_owned(),
            },
        }
    }

    fn stateful_set(&mut self) -> Result<&StatefulSet, Error> {
        let stateful_set = match self.cache.stateful_set.take() {
            Some(stateful_set) => stateful_set,
            None => self
                .api
                .get_stateful_set(&self.app_name)
                .map_err(|source| Self::api_error(&self.app_name, source, "get StatefulSet"))?,
        };
        Ok(self.cache.stateful_set.insert(stateful_set))
    }

    fn pod(&mut self, name: &str) -> Result<&Pod, Error> {
        let pod = match self.cache.pods.entry(name.to_owned()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(
                self.api
                    .get_pod(name)
                    .map_err(|source| Self::api_error(&self.app_name, source, "get pod"))?,
            ),
        };
        Ok(pod)
    }

    fn node(&mut self, name: &str) -> Result<&Node, Error> {
        let node = match self.cache.nodes.entry(name.to_owned()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(
                self.api
                    .get_node(name)
                    .map_err(|source| Self::api_error(&self.app_name, source, "get node"))?,
            ),
        };
        Ok(node)
    }

    fn service(&mut self) -> Result<Option<&Service>, Error> {
        let service = match self.cache.service.take() {
            Some(service) => service,
            None => self
                .api
                .get_service(&service_name(&self.app_name))
                .map_err(|source| Self::api_error(&self.app_name, source, "get service"))?,
        };
        Ok(self.cache.service.insert(service).as_ref())
    }

    fn pod_revision(&mut self, unit: &UnitId) -> Result<String, Error> {
        let pod_name = unit.pod_name();
        self.pod(&pod_name)?
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(REVISION_HASH_LABEL))
            .cloned()
            .context(MissingRevisionSnafu { resource: pod_name })
    }

    /// Address of the node this unit's pod is scheduled on.
    fn node_address(&mut self, unit: &UnitId) -> Result<Option<String>, Error> {
        let Some(node_name) = self
            .pod(&unit.pod_name())?
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
        else {
            return Ok(None);
        };

        let addresses = self
            .node(&node_name)?
            .status
            .as_ref()
            .and_then(|status| status.addresses.as_ref());
        Ok(addresses.and_then(|addresses| {
            ["ExternalIP", "InternalIP"].iter().find_map(|kind| {
                addresses
                    .iter()
                    .find(|address| address.type_ == *kind)
                    .map(|address| address.address.clone())
            })
        }))
    }
}

impl<A: KubernetesApi, C: Container> UpgradeBackend for Kubernetes<A, C> {
    fn partition(&mut self, _model: &Model) -> Result<u32, Error> {
        let partition = self
            .stateful_set()?
            .spec
            .as_ref()
            .and_then(|spec| spec.update_strategy.as_ref())
            .and_then(|strategy| strategy.rolling_update.as_ref())
            .and_then(|rolling_update| rolling_update.partition)
            .unwrap_or_default();
        Ok(u32::try_from(partition).unwrap_or_default())
    }

    fn set_partition(&mut self, model: &mut Model, value: u32) -> Result<(), Error> {
        let current = self.partition(model)?;
        self.api
            .patch_stateful_set_partition(&self.app_name, value)
            .map_err(|source| Self::api_error(&self.app_name, source, "patch StatefulSet"))?;
        self.cache.stateful_set = None;
        tracing::info!(from = current, to = value, "set StatefulSet partition");

        if value < current && !self.settle_delay.is_zero() {
            tracing::debug!(delay = ?self.settle_delay, "waiting after lowering partition");
            thread::sleep(self.settle_delay);
        }
        Ok(())
    }

    fn unit_workload_version(&mut self, _model: &Model, unit: &UnitId) -> Result<String, Error> {
        self.pod_revision(unit)
    }

    fn app_workload_version(&mut self, _model: &Model) -> Result<String, Error> {
        let app_name = self.app_name.clone();
        self.stateful_set()?
            .status
            .as_ref()
            .and_then(|status| status.update_revision.clone())
            .context(MissingRevisionSnafu {
                resource: format!("StatefulSet {app_name}"),
            })
    }

    fn unit_active_status(
        &mut self,
        model: &Model,
        versions: &VersionPair,
    ) -> Result<Status, Error> {
        let revision = self.pod_revision(&model.unit)?;
        Ok(Status::active(format!(
            "MySQL Router {}; Charm version {} ({})",
            versions.workload,
            versions.charm,
            short_revision(&revision)
        )))
    }
}

impl<A: KubernetesApi, C: Container> Platform for Kubernetes<A, C> {
    type Container = C;

    fn kind(&self) -> PlatformKind {
        PlatformKind::Kubernetes
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
        Ok(format!(
            "{}.{}.svc.cluster.local:{ROUTER_READ_WRITE_PORT}",
            service_name(&self.app_name),
            self.namespace
        ))
    }

    fn read_only_endpoint(&mut self, _model: &Model) -> Result<String, Error> {
        Ok(format!(
            "{}.{}.svc.cluster.local:{ROUTER_READ_ONLY_PORT}",
            service_name(&self.app_name),
            self.namespace
        ))
    }

    fn exposed_endpoints(&mut self, model: &Model) -> Result<Option<RouterEndpoints>, Error> {
        let expose_external = model.config.expose_external().context(InvalidConfigSnafu)?;
        match expose_external {
            ExposeExternal::False => Ok(None),
            ExposeExternal::NodePort => {
                let node_ports: Option<(i32, i32)> = self.service()?.and_then(|service| {
                    let ports = service.spec.as_ref()?.ports.as_ref()?;
                    let node_port = |port: u16| {
                        ports
                            .iter()
                            .find(|candidate| candidate.port == i32::from(port))
                            .and_then(|candidate| candidate.node_port)
                    };
                    Some((
                        node_port(ROUTER_READ_WRITE_PORT)?,
                        node_port(ROUTER_READ_ONLY_PORT)?,
                    ))
                });
                let Some((read_write, read_only)) = node_ports else {
                    return Ok(None);
                };
                Ok(self.node_address(&model.unit)?.map(|address| RouterEndpoints {
                    read_write: format!("{address}:{read_write}"),
                    read_only: format!("{address}:{read_only}"),
                }))
            }
            ExposeExternal::LoadBalancer => {
                let address = self.service()?.and_then(|service| {
                    let ingress = service.status.as_ref()?.load_balancer.as_ref()?.ingress.as_ref()?;
                    let first = ingress.first()?;
                    first.ip.clone().or_else(|| first.hostname.clone())
                });
                Ok(address.map(|address| RouterEndpoints {
                    read_write: format!("{address}:{ROUTER_READ_WRITE_PORT}"),
                    read_only: format!("{address}:{ROUTER_READ_ONLY_PORT}"),
                }))
            }
        }
    }

    fn reconcile_node_port(&mut self, model: &Model) -> Result<(), Error> {
        let expose_external = model.config.expose_external().context(InvalidConfigSnafu)?;
        let desired_type = service_type(expose_external);
        let current_type = self
            .service()?
            .and_then(|service| service.spec.as_ref())
            .and_then(|spec| spec.type_.clone());
        if current_type.as_deref() == Some(desired_type) {
            return Ok(());
        }

        let service = build_service(&self.app_name, &self.namespace, expose_external);
        self.api
            .apply_service(&service)
            .map_err(|source| Self::api_error(&self.app_name, source, "apply service"))?;
        self.cache.service = None;
        tracing::info!(
            service = %service_name(&self.app_name),
            from = ?current_type,
            to = desired_type,
            "reconciled router service"
        );
        Ok(())
    }

    fn reconcile_ports(&mut self, _model: &mut Model, _external: bool) -> Result<(), Error> {
        // Ports are exposed through the service
        Ok(())
    }
}
