use serde::{Deserialize, Serialize};

use crate::versions::{VersionPair, parse_version};

/// The versions that were running before the most recent upgrade started.
///
/// Stored as JSON in the upgrade peer relation application databag and written by the leader
/// whenever no upgrade is in progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityRecord {
    pub charm: String,
    pub workload: String,
}

impl From<&VersionPair> for CompatibilityRecord {
    fn from(versions: &VersionPair) -> Self {
        Self {
            charm: versions.charm.to_string(),
            workload: versions.workload.to_string(),
        }
    }
}

/// Whether an in-place upgrade from `previous` to `current` is supported.
///
/// - The charm version must not decrease and must keep its major version.
/// - The workload version must not decrease and must keep its major and minor version.
///
/// A missing record or an unparsable recorded version is never considered compatible.
pub fn is_compatible(previous: Option<&CompatibilityRecord>, current: &VersionPair) -> bool {
    let Some(previous) = previous else {
        tracing::debug!("no compatibility record, upgrade is considered incompatible");
        return false;
    };

    let (previous_charm, previous_workload) =
        match (parse_version(&previous.charm), parse_version(&previous.workload)) {
            (Ok(charm), Ok(workload)) => (charm, workload),
            (charm, workload) => {
                tracing::debug!(
                    ?charm,
                    ?workload,
                    "recorded versions are malformed, upgrade is considered incompatible"
                );
                return false;
            }
        };

    if previous_charm > current.charm || previous_charm.major != current.charm.major {
        tracing::debug!(%previous_charm, current_charm = %current.charm, "charm versions incompatible");
        return false;
    }

    if previous_workload > current.workload
        || previous_workload.major != current.workload.major
        || previous_workload.minor != current.workload.minor
    {
        tracing::debug!(
            %previous_workload,
            current_workload = %current.workload,
            "workload versions incompatible"
        );
        return false;
    }

    tracing::debug!(?previous, %current, "versions before upgrade compatible with versions after upgrade");
    true
}
