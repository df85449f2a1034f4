//! Rotation of the MySQL Router log files.

use snafu::{ResultExt, Snafu};

use crate::workload::container::{self, Container};

/// Rotated files are kept for a week.
const RETAINED_ROTATIONS: u32 = 10080;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to update the logrotate configuration"))]
    UpdateConfig { source: container::Error },
}

fn render_config<C: Container>(container: &C) -> String {
    let log_directory = container.log_directory();
    format!(
        "# Managed by the MySQL Router operator
{log_directory}/*.log {{
    minute
    rotate {RETAINED_ROTATIONS}
    missingok
    nocompress
    copytruncate
    dateext
    dateformat -%Y%m%d_%H%M
    olddir {log_directory}/archive
    createolddir 770 mysql mysql
}}
",
        log_directory = log_directory.display()
    )
}

/// Installs the logrotate configuration. Nothing is written if it is already current.
pub fn enable<C: Container>(container: &mut C) -> Result<(), Error> {
    let path = container.logrotate_config_path();
    let config = render_config(container);
    let current = container.read_file(&path).context(UpdateConfigSnafu)?;
    if current.as_deref() != Some(config.as_str()) {
        container
            .write_file(&path, &config)
            .context(UpdateConfigSnafu)?;
        tracing::debug!(?path, "enabled log rotation");
    }
    Ok(())
}

pub fn disable<C: Container>(container: &mut C) -> Result<(), Error> {
    let path = container.logrotate_config_path();
    if container
        .read_file(&path)
        .context(UpdateConfigSnafu)?
        .is_some()
    {
        container.remove_file(&path).context(UpdateConfigSnafu)?;
        tracing::debug!(?path, "disabled log rotation");
    }
    Ok(())
}
