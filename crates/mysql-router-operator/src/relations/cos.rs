//! Canonical Observability Stack integration through the MySQL Router exporter.

use rand::{Rng, distr::Alphanumeric};

use crate::{
    event::Event,
    model::{Model, Relation},
    relations::{COS_PEER_ENDPOINT, METRICS_ENDPOINT},
};

/// Address of the MySQL Router REST API the exporter scrapes.
pub const ROUTER_REST_API_URL: &str = "https://127.0.0.1:8443";
pub const MONITORING_USERNAME: &str = "monitoring";
pub const EXPORTER_PORT: u16 = 9152;

const MONITORING_PASSWORD_KEY: &str = "monitoring-password";
const PASSWORD_LENGTH: usize = 24;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExporterConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub listen_port: u16,
}

pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

fn metrics_relation_active(model: &Model, event: &Event) -> bool {
    model
        .relations(METRICS_ENDPOINT)
        .any(|relation: &Relation| !event.is_breaking(relation.id))
}

/// The exporter configuration, or [`None`] while no metrics consumer is related.
///
/// The monitoring password is generated once per unit and kept in the unit databag of the `cos`
/// peer relation. Returns [`None`] until that relation exists.
pub fn exporter_config(model: &mut Model, event: &Event) -> Option<ExporterConfig> {
    if !metrics_relation_active(model, event) {
        return None;
    }

    let secrets = &mut model.relation_mut(COS_PEER_ENDPOINT)?.local_unit_data;
    let password = match secrets.require(MONITORING_PASSWORD_KEY) {
        Ok(password) => password.to_owned(),
        Err(_) => {
            let password = generate_password();
            secrets.insert(MONITORING_PASSWORD_KEY, password.clone());
            tracing::debug!("generated monitoring password");
            password
        }
    };

    Some(ExporterConfig {
        url: ROUTER_REST_API_URL.to_owned(),
        username: MONITORING_USERNAME.to_owned(),
        password,
        listen_port: EXPORTER_PORT,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitId;

    fn model() -> Model {
        let mut model = Model::new(UnitId::new("router", 0));
        model.relations.push(Relation::new(1, COS_PEER_ENDPOINT));
        model.relations.push(Relation::new(5, METRICS_ENDPOINT).with_remote_app("grafana-agent"));
        model
    }

    #[test]
    fn password_is_generated_once() {
        let mut model = model();
        let first = exporter_config(&mut model, &Event::Start).expect("exporter enabled");
        let second = exporter_config(&mut model, &Event::Start).expect("exporter enabled");

        assert_eq!(first, second);
        assert_eq!(first.password.len(), PASSWORD_LENGTH);
        assert_eq!(first.listen_port, EXPORTER_PORT);
    }

    #[test]
    fn disabled_while_metrics_relation_breaks() {
        let mut model = model();
        let event = Event::relation_broken(METRICS_ENDPOINT, 5);
        assert_eq!(exporter_config(&mut model, &event), None);
    }
}
