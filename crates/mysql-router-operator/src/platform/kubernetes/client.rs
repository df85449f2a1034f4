//! [`KubernetesApi`] backed by a [`kube::Client`].
//!
//! Events are handled synchronously, so every request blocks on a current-thread runtime owned by
//! the client.

use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        apps::v1::StatefulSet,
        core::v1::{Node, Pod, Service},
    },
};
use kube::{
    Api, Client, Resource,
    api::{Patch, PatchParams},
};
use serde_json::json;
use snafu::{ResultExt, Snafu};
use tokio::runtime::Runtime;

use crate::platform::kubernetes::{ApiError, KubernetesApi};

pub const FIELD_MANAGER: &str = "mysql-router-operator";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to start the Kubernetes client runtime"))]
    StartRuntime { source: std::io::Error },

    #[snafu(display("failed to create the Kubernetes client"))]
    CreateClient { source: kube::Error },
}

fn map_error(error: kube::Error) -> ApiError {
    match error {
        kube::Error::Api(response) if response.code == 403 => ApiError::Forbidden,
        kube::Error::Api(response) if response.code == 404 => ApiError::NotFound,
        error => ApiError::Request {
            message: error.to_string(),
        },
    }
}

pub struct KubeApi {
    runtime: Runtime,
    client: Client,
    namespace: String,
}

impl KubeApi {
    /// Connects with the in-cluster service account or the local kubeconfig.
    pub fn new(namespace: impl Into<String>) -> Result<Self, Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context(StartRuntimeSnafu)?;
        let client = runtime
            .block_on(Client::try_default())
            .context(CreateClientSnafu)?;

        Ok(Self {
            runtime,
            client,
            namespace: namespace.into(),
        })
    }

    fn namespaced<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

impl KubernetesApi for KubeApi {
    fn get_stateful_set(&mut self, name: &str) -> Result<StatefulSet, ApiError> {
        let api = self.namespaced::<StatefulSet>();
        self.runtime.block_on(api.get(name)).map_err(map_error)
    }

    fn patch_stateful_set_partition(
        &mut self,
        name: &str,
        partition: u32,
    ) -> Result<(), ApiError> {
        let api = self.namespaced::<StatefulSet>();
        let patch = json!({
            "spec": {
                "updateStrategy": {
                    "rollingUpdate": {
                        "partition": partition
                    }
                }
            }
        });
        self.runtime
            .block_on(api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)))
            .map(|_| ())
            .map_err(map_error)
    }

    fn get_pod(&mut self, name: &str) -> Result<Pod, ApiError> {
        let api = self.namespaced::<Pod>();
        self.runtime.block_on(api.get(name)).map_err(map_error)
    }

    fn get_node(&mut self, name: &str) -> Result<Node, ApiError> {
        let api: Api<Node> = Api::all(self.client.clone());
        self.runtime.block_on(api.get(name)).map_err(map_error)
    }

    fn get_service(&mut self, name: &str) -> Result<Option<Service>, ApiError> {
        let api = self.namespaced::<Service>();
        self.runtime.block_on(api.get_opt(name)).map_err(map_error)
    }

    fn apply_service(&mut self, service: &Service) -> Result<(), ApiError> {
        let api = self.namespaced::<Service>();
        let name = service.metadata.name.clone().unwrap_or_default();
        let patch_params = PatchParams::apply(FIELD_MANAGER).force();
        self.runtime
            .block_on(api.patch(&name, &patch_params, &Patch::Apply(service)))
            .map(|_| ())
            .map_err(map_error)
    }
}
