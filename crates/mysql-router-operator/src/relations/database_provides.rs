//! The `database` relation, over which client applications request a database user.

use std::collections::BTreeSet;

use snafu::{ResultExt, Snafu};

use crate::{
    event::Event,
    model::{MissingKeyError, Model, Relation, RelationId},
    relations::DATABASE_ENDPOINT,
    status::{Status, prioritize},
    workload::{
        container::Container,
        shell::{self, Shell},
    },
};

const DATABASE_KEY: &str = "database";
const EXTRA_USER_ROLES_KEY: &str = "extra-user-roles";
const EXTERNAL_CONNECTIVITY_KEY: &str = "external-node-connectivity";

const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";
const ENDPOINTS_KEY: &str = "endpoints";
const READ_ONLY_ENDPOINTS_KEY: &str = "read-only-endpoints";

/// Keys present in the local app databag once a user has been created and shared.
const SHARED_USER_KEYS: [&str; 5] = [
    USERNAME_KEY,
    PASSWORD_KEY,
    ENDPOINTS_KEY,
    READ_ONLY_ENDPOINTS_KEY,
    DATABASE_KEY,
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("the {remote_app} app requested unsupported extra user roles"))]
    UnsupportedExtraUserRole { remote_app: String },

    #[snafu(display("the {remote_app} app did not request a database yet"))]
    IncompleteDatabag {
        source: MissingKeyError,
        remote_app: String,
    },

    #[snafu(display("failed to create user {username}"))]
    CreateUser {
        source: shell::Error,
        username: String,
    },

    #[snafu(display("failed to delete user {username}"))]
    DeleteUser {
        source: shell::Error,
        username: String,
    },
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Self::UnsupportedExtraUserRole { remote_app } => Status::blocked(format!(
                "{remote_app} app requested unsupported extra user role on {DATABASE_ENDPOINT} endpoint"
            )),
            Self::IncompleteDatabag { remote_app, .. } => Status::waiting(format!(
                "Waiting for {remote_app} app on {DATABASE_ENDPOINT} endpoint"
            )),
            Self::CreateUser { username, .. } => {
                Status::blocked(format!("Failed to create database user {username}"))
            }
            Self::DeleteUser { username, .. } => {
                Status::blocked(format!("Failed to delete database user {username}"))
            }
        }
    }
}

/// Connection endpoints of the router, `host:port` or unix socket paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterEndpoints {
    pub read_write: String,
    pub read_only: String,
}

/// Endpoints published to client applications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    pub internal: RouterEndpoints,

    /// Reachable from outside the router host, if exposed.
    pub exposed: Option<RouterEndpoints>,
}

impl Endpoints {
    fn for_user(&self, user: &RequestedUser) -> &RouterEndpoints {
        match &self.exposed {
            Some(exposed) if user.external_connectivity => exposed,
            _ => &self.internal,
        }
    }
}

/// A user requested by a client application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestedUser {
    pub relation_id: RelationId,
    pub remote_app: String,
    pub database: String,
    pub external_connectivity: bool,
}

impl RequestedUser {
    fn from_relation(relation: &Relation) -> Result<Self, Error> {
        let remote_app = relation.remote_app_name();
        let data = &relation.remote_app_data;

        let database = data
            .require(DATABASE_KEY)
            .context(IncompleteDatabagSnafu { remote_app })?;
        if data
            .get(EXTRA_USER_ROLES_KEY)
            .is_some_and(|roles| !roles.trim().is_empty())
        {
            return UnsupportedExtraUserRoleSnafu { remote_app }.fail();
        }

        Ok(Self {
            relation_id: relation.id,
            remote_app: remote_app.to_owned(),
            database: database.to_owned(),
            external_connectivity: data.get(EXTERNAL_CONNECTIVITY_KEY) == Some("true"),
        })
    }

    pub fn username(&self) -> String {
        username(self.relation_id)
    }
}

/// A user that has been created and whose credentials are shared in the relation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedUser {
    pub relation_id: RelationId,
    pub username: String,
}

pub fn username(relation_id: RelationId) -> String {
    format!("relation-{relation_id}")
}

fn active_relations<'a>(
    model: &'a Model,
    event: &'a Event,
) -> impl Iterator<Item = &'a Relation> {
    model
        .relations(DATABASE_ENDPOINT)
        .filter(move |relation| !event.is_breaking(relation.id))
}

/// Users requested over relations that are not breaking. Invalid requests are left out and
/// reported by [`status`].
pub fn requested_users(model: &Model, event: &Event) -> Vec<RequestedUser> {
    active_relations(model, event)
        .filter_map(|relation| RequestedUser::from_relation(relation).ok())
        .collect()
}

/// Users whose credentials are shared, including those of breaking relations.
pub fn shared_users(model: &Model) -> Vec<SharedUser> {
    model
        .relations(DATABASE_ENDPOINT)
        .filter(|relation| relation.local_app_data.contains_all(&SHARED_USER_KEYS))
        .filter_map(|relation| {
            Some(SharedUser {
                relation_id: relation.id,
                username: relation.local_app_data.get(USERNAME_KEY)?.to_owned(),
            })
        })
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserDelta {
    pub to_create: Vec<RequestedUser>,
    pub to_delete: Vec<SharedUser>,
}

/// Matches requested users against shared users by relation.
pub fn user_delta(requested: &[RequestedUser], shared: &[SharedUser]) -> UserDelta {
    let requested_ids: BTreeSet<RelationId> =
        requested.iter().map(|user| user.relation_id).collect();
    let shared_ids: BTreeSet<RelationId> = shared.iter().map(|user| user.relation_id).collect();

    UserDelta {
        to_create: requested
            .iter()
            .filter(|user| !shared_ids.contains(&user.relation_id))
            .cloned()
            .collect(),
        to_delete: shared
            .iter()
            .filter(|user| !requested_ids.contains(&user.relation_id))
            .cloned()
            .collect(),
    }
}

fn publish_endpoints(relation: &mut Relation, endpoints: &RouterEndpoints) {
    let data = &mut relation.local_app_data;
    let read_write_changed = data.insert(ENDPOINTS_KEY, endpoints.read_write.as_str());
    let read_only_changed = data.insert(READ_ONLY_ENDPOINTS_KEY, endpoints.read_only.as_str());
    if read_write_changed || read_only_changed {
        tracing::info!(relation_id = relation.id, ?endpoints, "published endpoints");
    }
}

/// Leader only. Creates requested users, deletes users no longer requested and keeps the
/// published endpoints of existing users current.
pub fn reconcile_users<C: Container>(
    model: &mut Model,
    event: &Event,
    endpoints: &Endpoints,
    shell: &mut Shell<'_, C>,
) -> Result<(), Error> {
    let requested = requested_users(model, event);
    let shared = shared_users(model);
    let delta = user_delta(&requested, &shared);
    tracing::debug!(?delta, "reconciling database users");

    for user in &delta.to_create {
        let username = user.username();
        // A previous attempt may have created the user without sharing it
        shell
            .delete_user(&username)
            .context(DeleteUserSnafu { username: &username })?;
        let password = shell
            .create_application_database_and_user(&username, &user.database)
            .context(CreateUserSnafu { username: &username })?;

        let Some(relation) = model.relation_by_id_mut(user.relation_id) else {
            continue;
        };
        publish_endpoints(relation, endpoints.for_user(user));
        let data = &mut relation.local_app_data;
        data.insert(DATABASE_KEY, user.database.as_str());
        data.insert(PASSWORD_KEY, password);
        data.insert(USERNAME_KEY, username);
    }

    for user in requested
        .iter()
        .filter(|user| !delta.to_create.contains(user))
    {
        if let Some(relation) = model.relation_by_id_mut(user.relation_id) {
            publish_endpoints(relation, endpoints.for_user(user));
        }
    }

    for user in &delta.to_delete {
        // Revoke the credentials before the user so a retry never shares a deleted user
        if let Some(relation) = model.relation_by_id_mut(user.relation_id) {
            clear_databag(relation);
        }
        shell
            .delete_user(&user.username)
            .context(DeleteUserSnafu {
                username: &user.username,
            })?;
    }

    Ok(())
}

fn clear_databag(relation: &mut Relation) {
    let data = &mut relation.local_app_data;
    let removed = SHARED_USER_KEYS
        .iter()
        .filter_map(|key| data.remove(key))
        .count();
    if removed > 0 {
        tracing::info!(relation_id = relation.id, "removed shared credentials");
    }
}

/// Removes every shared credential, used when the backend database is gone.
pub fn delete_all_databags(model: &mut Model) {
    for relation in model
        .relations
        .iter_mut()
        .filter(|relation| relation.endpoint == DATABASE_ENDPOINT)
    {
        clear_databag(relation);
    }
}

/// Unsupported roles take precedence over incomplete requests, which take precedence over no
/// request at all.
pub fn status(model: &Model, event: &Event) -> Option<Status> {
    let mut any_requested = false;
    let mut statuses = Vec::new();
    for relation in active_relations(model, event) {
        match RequestedUser::from_relation(relation) {
            Ok(_) => any_requested = true,
            Err(error) => statuses.push(error.status()),
        }
    }

    if !statuses.is_empty() {
        return Some(prioritize(statuses));
    }
    if !any_requested {
        return Some(Status::blocked(format!(
            "Missing relation: {DATABASE_ENDPOINT}"
        )));
    }
    None
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::unit::UnitId;

    fn requested(relation_id: RelationId) -> RequestedUser {
        RequestedUser {
            relation_id,
            remote_app: format!("app-{relation_id}"),
            database: "wordpress".to_owned(),
            external_connectivity: false,
        }
    }

    fn shared(relation_id: RelationId) -> SharedUser {
        SharedUser {
            relation_id,
            username: username(relation_id),
        }
    }

    #[test]
    fn delta_creates_and_deletes_only_differences() {
        let delta = user_delta(&[requested(1), requested(2)], &[shared(2), shared(3)]);

        assert_eq!(delta.to_create, vec![requested(1)]);
        assert_eq!(delta.to_delete, vec![shared(3)]);
    }

    fn model(relations: &[(RelationId, &[(&str, &str)])]) -> Model {
        let mut model = Model::new(UnitId::new("router", 0));
        for (id, remote_app_data) in relations {
            let mut relation =
                Relation::new(*id, DATABASE_ENDPOINT).with_remote_app(format!("app-{id}"));
            relation.remote_app_data = remote_app_data.iter().copied().collect();
            model.relations.push(relation);
        }
        model
    }

    #[rstest]
    #[case::no_relation(&[], Some(Status::blocked("Missing relation: database")))]
    #[case::requested(&[(1, &[("database", "wordpress")] as &[_])], None)]
    #[case::incomplete(
        &[(1, &[("database", "wordpress")] as &[_]), (2, &[])],
        Some(Status::waiting("Waiting for app-2 app on database endpoint"))
    )]
    #[case::unsupported_role_wins(
        &[(2, &[] as &[_]), (3, &[("database", "db"), ("extra-user-roles", "admin")])],
        Some(Status::blocked("app-3 app requested unsupported extra user role on database endpoint"))
    )]
    fn reports_status(
        #[case] relations: &[(RelationId, &[(&str, &str)])],
        #[case] expected: Option<Status>,
    ) {
        assert_eq!(status(&model(relations), &Event::Start), expected);
    }

    #[test]
    fn breaking_relation_is_not_requested() {
        let model = model(&[(1, &[("database", "wordpress")])]);
        let event = Event::relation_broken(DATABASE_ENDPOINT, 1);

        assert!(requested_users(&model, &event).is_empty());
        assert_eq!(
            status(&model, &event),
            Some(Status::blocked("Missing relation: database"))
        );
    }

    #[test]
    fn delete_all_databags_clears_shared_users() {
        let mut model = model(&[(1, &[("database", "wordpress")])]);
        model.relations[0].local_app_data = [
            ("username", "relation-1"),
            ("password", "secret"),
            ("endpoints", "router:6446"),
            ("read-only-endpoints", "router:6447"),
            ("database", "wordpress"),
        ]
        .into_iter()
        .collect();
        assert_eq!(shared_users(&model), vec![shared(1)]);

        delete_all_databags(&mut model);
        assert!(shared_users(&model).is_empty());
        assert!(model.relations[0].local_app_data.is_empty());
    }
}
