//! The `certificates` relation.
//!
//! Certificate signing requests are handled by the TLS library. This endpoint keeps the saved
//! private key, certificate and CA in the unit databag and hands them to the workload.

use crate::{
    event::Event,
    model::{Databag, Model},
    relations::CERTIFICATES_ENDPOINT,
};

const KEY_KEY: &str = "key";
const CERTIFICATE_KEY: &str = "certificate";
const CERTIFICATE_AUTHORITY_KEY: &str = "certificate-authority";

/// Keys the provider shares once it signed the request of this unit.
const SIGNED_CERTIFICATE_KEY: &str = "certificate";
const SIGNED_CA_KEY: &str = "ca";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsMaterials {
    pub key: String,
    pub certificate: String,
    pub certificate_authority: String,
}

impl TlsMaterials {
    fn from_databag(data: &Databag) -> Option<Self> {
        Some(Self {
            key: data.require(KEY_KEY).ok()?.to_owned(),
            certificate: data.require(CERTIFICATE_KEY).ok()?.to_owned(),
            certificate_authority: data.get(CERTIFICATE_AUTHORITY_KEY)?.to_owned(),
        })
    }
}

pub fn relation_active(model: &Model, event: &Event) -> bool {
    model
        .relation(CERTIFICATES_ENDPOINT)
        .is_some_and(|relation| !event.is_breaking(relation.id))
}

/// The saved materials, if a certificate has been issued and the relation is not breaking.
pub fn saved_materials(model: &Model, event: &Event) -> Option<TlsMaterials> {
    let relation = model
        .relation(CERTIFICATES_ENDPOINT)
        .filter(|relation| !event.is_breaking(relation.id))?;
    TlsMaterials::from_databag(&relation.local_unit_data)
}

pub fn certificate_saved(model: &Model, event: &Event) -> bool {
    saved_materials(model, event).is_some()
}

/// Saves a certificate issued by the provider for the key of this unit.
///
/// Returns whether the saved materials changed.
pub fn save_issued_certificate(model: &mut Model, event: &Event) -> bool {
    let Some(relation) = model.relation_mut(CERTIFICATES_ENDPOINT) else {
        return false;
    };
    if event.is_breaking(relation.id) || relation.local_unit_data.require(KEY_KEY).is_err() {
        return false;
    }

    let signed = relation
        .remote_units
        .values()
        .chain(std::iter::once(&relation.remote_app_data))
        .find_map(|data| {
            Some((
                data.require(SIGNED_CERTIFICATE_KEY).ok()?.to_owned(),
                data.get(SIGNED_CA_KEY).unwrap_or_default().to_owned(),
            ))
        });
    let Some((certificate, certificate_authority)) = signed else {
        return false;
    };

    let data = &mut relation.local_unit_data;
    let certificate_changed = data.insert(CERTIFICATE_KEY, certificate);
    let ca_changed = data.insert(CERTIFICATE_AUTHORITY_KEY, certificate_authority);
    if certificate_changed || ca_changed {
        tracing::info!(relation_id = relation.id, "saved TLS certificate");
    }
    certificate_changed || ca_changed
}

/// Drops the saved materials once the relation is gone.
pub fn clear_on_broken(model: &mut Model, event: &Event) {
    let Some(relation) = model.relation_mut(CERTIFICATES_ENDPOINT) else {
        return;
    };
    if !event.is_breaking(relation.id) {
        return;
    }

    let data = &mut relation.local_unit_data;
    let removed = [KEY_KEY, CERTIFICATE_KEY, CERTIFICATE_AUTHORITY_KEY]
        .into_iter()
        .filter_map(|key| data.remove(key))
        .count();
    if removed > 0 {
        tracing::info!(relation_id = relation.id, "cleared saved TLS materials");
    }
}
