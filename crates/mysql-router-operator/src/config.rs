//! Application configuration set by the operator administrator.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use strum::{Display, EnumString};

use crate::status::Status;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display(
        "invalid value {value:?} for config option `expose-external`, expected one of false, nodeport, loadbalancer"
    ))]
    InvalidExposeExternal { value: String },
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidExposeExternal { value } => Status::blocked(format!(
                "Invalid value {value:?} for config option expose-external"
            )),
        }
    }
}

/// How the router endpoints are exposed outside of the Kubernetes cluster.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum ExposeExternal {
    /// Only reachable inside the cluster through a ClusterIP service.
    #[default]
    False,
    #[strum(serialize = "nodeport")]
    NodePort,
    #[strum(serialize = "loadbalancer")]
    LoadBalancer,
}

/// The charm configuration as delivered by the runtime.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CharmConfig {
    #[serde(default = "CharmConfig::default_expose_external")]
    pub expose_external: String,
}

impl CharmConfig {
    fn default_expose_external() -> String {
        ExposeExternal::default().to_string()
    }

    /// Validates the raw `expose-external` value.
    pub fn expose_external(&self) -> Result<ExposeExternal, Error> {
        ExposeExternal::from_str(&self.expose_external).map_err(|_| Error::InvalidExposeExternal {
            value: self.expose_external.clone(),
        })
    }
}

impl Default for CharmConfig {
    fn default() -> Self {
        Self {
            expose_external: Self::default_expose_external(),
        }
    }
}
