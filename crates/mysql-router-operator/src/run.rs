//! One invocation of the operator process.
//!
//! The unit's [`Model`] is loaded from the state file, the event is handled by a [`Charm`] on the
//! selected platform, and the model is saved again. A failed event leaves the state file untouched
//! so the runtime can retry it.

use std::{fs, io::ErrorKind, path::PathBuf};

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::{
    charm::{Charm, FatalError},
    cli::RunArguments,
    event::{ActionResult, Event},
    model::Model,
    platform::{
        PlatformKind,
        kubernetes::{self, KubeApi, Kubernetes},
        machine::Machine,
    },
    unit::UnitId,
    versions,
    workload::host::{HostContainer, ServiceManager},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the packaged versions"))]
    ReadVersions { source: versions::Error },

    #[snafu(display("failed to parse event {event:?}"))]
    ParseEvent {
        source: serde_json::Error,
        event: String,
    },

    #[snafu(display("failed to read state file {path:?}"))]
    ReadState {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse state file {path:?}"))]
    ParseState {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("state file {path:?} belongs to unit {found}, not {expected}"))]
    ForeignState {
        path: PathBuf,
        expected: UnitId,
        found: UnitId,
    },

    #[snafu(display("failed to serialize the model"))]
    SerializeState { source: serde_json::Error },

    #[snafu(display("failed to write state file {path:?}"))]
    WriteState {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("a namespace is required on Kubernetes"))]
    MissingNamespace,

    #[snafu(display("failed to connect to Kubernetes"))]
    ConnectKubernetes { source: kubernetes::client::Error },

    #[snafu(display("a snap revision is required on machines"))]
    MissingSnapRevision,

    #[snafu(display("failed to handle the event"))]
    HandleEvent { source: FatalError },
}

/// Handles the event given in `arguments`. Returns the result of an action event.
pub fn run(arguments: &RunArguments) -> Result<Option<ActionResult>, Error> {
    let versions = arguments.versions().context(ReadVersionsSnafu)?;
    let event: Event = serde_json::from_str(&arguments.event).context(ParseEventSnafu {
        event: arguments.event.clone(),
    })?;
    let mut model = load_model(arguments)?;
    tracing::info!(
        unit = %arguments.unit,
        platform = ?arguments.platform,
        ?event,
        charm_version = %versions.charm,
        "handling event"
    );

    let result = match arguments.platform {
        PlatformKind::Kubernetes => {
            ensure!(!arguments.namespace.is_empty(), MissingNamespaceSnafu);
            let api = KubeApi::new(&arguments.namespace).context(ConnectKubernetesSnafu)?;
            let container =
                HostContainer::new(ServiceManager::Pebble).with_root(&arguments.workload_root);
            let app_name = model.app_name().to_owned();
            let mut platform = Kubernetes::new(api, container, app_name, &arguments.namespace)
                .with_settle_delay(arguments.partition_settle_delay())
                .with_readiness(arguments.readiness());
            Charm::new(&mut model, &mut platform, &versions).handle(&event)
        }
        PlatformKind::Machine => {
            let revision = arguments
                .snap_revision
                .clone()
                .context(MissingSnapRevisionSnafu)?;
            let container =
                HostContainer::new(ServiceManager::Snap).with_root(&arguments.workload_root);
            let mut platform = Machine::new(container, revision).with_readiness(arguments.readiness());
            Charm::new(&mut model, &mut platform, &versions).handle(&event)
        }
    };

    let action_result = result.context(HandleEventSnafu)?;
    save_model(arguments, &model)?;
    tracing::info!(
        app_status = %model.app_status,
        unit_status = %model.unit_status,
        "handled event"
    );
    Ok(action_result)
}

/// Loads the model of the unit, a fresh one if the state file does not exist yet.
fn load_model(arguments: &RunArguments) -> Result<Model, Error> {
    let path = &arguments.state_file;
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            tracing::info!(?path, "no state file, starting with an empty model");
            return Ok(Model::new(arguments.unit.clone()));
        }
        Err(source) => return Err(source).context(ReadStateSnafu { path }),
    };

    let model: Model = serde_json::from_str(&content).context(ParseStateSnafu { path })?;
    ensure!(
        model.unit == arguments.unit,
        ForeignStateSnafu {
            path,
            expected: arguments.unit.clone(),
            found: model.unit.clone(),
        }
    );
    Ok(model)
}

fn save_model(arguments: &RunArguments, model: &Model) -> Result<(), Error> {
    let path = &arguments.state_file;
    let content = serde_json::to_string_pretty(model).context(SerializeStateSnafu)?;
    fs::write(path, content).context(WriteStateSnafu { path })
}
