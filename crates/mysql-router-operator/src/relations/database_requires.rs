//! The `backend-database` relation to the MySQL cluster the router connects to.

use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    event::Event,
    model::{MissingKeyError, Model, Relation},
    relations::BACKEND_DATABASE_ENDPOINT,
    status::Status,
};

/// The database requested from the MySQL cluster. Router accounts read the cluster metadata.
pub const REQUESTED_DATABASE: &str = "mysql_innodb_cluster_metadata";
pub const REQUESTED_EXTRA_USER_ROLES: &str = "mysqlrouter";

const DATABASE_KEY: &str = "database";
const EXTRA_USER_ROLES_KEY: &str = "extra-user-roles";
const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";
const ENDPOINTS_KEY: &str = "endpoints";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the backend-database relation does not exist"))]
    MissingRelation,

    #[snafu(display("the {remote_app} app did not share connection info yet"))]
    IncompleteDatabag {
        source: MissingKeyError,
        remote_app: String,
    },

    #[snafu(display("the {remote_app} app shared the invalid endpoint {endpoint:?}"))]
    InvalidEndpoint { endpoint: String, remote_app: String },
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Self::MissingRelation => {
                Status::blocked(format!("Missing relation: {BACKEND_DATABASE_ENDPOINT}"))
            }
            Self::IncompleteDatabag { remote_app, .. } => Status::waiting(format!(
                "Waiting for {remote_app} app on {BACKEND_DATABASE_ENDPOINT} endpoint"
            )),
            Self::InvalidEndpoint { remote_app, .. } => Status::blocked(format!(
                "{remote_app} app shared an invalid endpoint on {BACKEND_DATABASE_ENDPOINT} endpoint"
            )),
        }
    }
}

/// Credentials and address of the MySQL cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl ConnectionInfo {
    /// `user:password@host:port`, as accepted by MySQL Router and MySQL Shell.
    pub fn uri(&self) -> String {
        format!(
            "{}:{}@{}:{}",
            self.username, self.password, self.host, self.port
        )
    }
}

fn active_relation<'a>(model: &'a Model, event: &Event) -> Option<&'a Relation> {
    model
        .relation(BACKEND_DATABASE_ENDPOINT)
        .filter(|relation| !event.is_breaking(relation.id))
}

/// Whether the relation exists but the current event is its broken event.
pub fn is_breaking(model: &Model, event: &Event) -> bool {
    model
        .relation(BACKEND_DATABASE_ENDPOINT)
        .is_some_and(|relation| event.is_breaking(relation.id))
}

/// Leader only. Asks the MySQL cluster for a router account.
pub fn request_database(model: &mut Model, event: &Event) {
    let Some(relation) = model.relation_mut(BACKEND_DATABASE_ENDPOINT) else {
        return;
    };
    if event.is_breaking(relation.id) {
        return;
    }

    let data = &mut relation.local_app_data;
    let database_changed = data.insert(DATABASE_KEY, REQUESTED_DATABASE);
    let roles_changed = data.insert(EXTRA_USER_ROLES_KEY, REQUESTED_EXTRA_USER_ROLES);
    if database_changed || roles_changed {
        tracing::debug!(
            relation_id = relation.id,
            database = REQUESTED_DATABASE,
            "requested backend database"
        );
    }
}

/// The connection info shared by the MySQL cluster.
pub fn connection_info(model: &Model, event: &Event) -> Result<ConnectionInfo, Error> {
    let relation = active_relation(model, event).context(MissingRelationSnafu)?;
    let remote_app = relation.remote_app_name();
    let data = &relation.remote_app_data;

    let require = |key: &str| {
        data.require(key)
            .map(str::to_owned)
            .context(IncompleteDatabagSnafu { remote_app })
    };
    let username = require(USERNAME_KEY)?;
    let password = require(PASSWORD_KEY)?;
    let endpoints = require(ENDPOINTS_KEY)?;

    // Any endpoint works, MySQL Router discovers the primary through the cluster metadata
    let endpoint = endpoints.split(',').next().unwrap_or_default().trim();
    let (host, port) = endpoint
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
        .filter(|(host, _)| !host.is_empty())
        .context(InvalidEndpointSnafu {
            endpoint,
            remote_app,
        })?;

    Ok(ConnectionInfo {
        username,
        password,
        host: host.to_owned(),
        port,
    })
}

pub fn status(model: &Model, event: &Event) -> Option<Status> {
    connection_info(model, event).err().map(|error| error.status())
}
