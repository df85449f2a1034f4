//! MySQL Shell, run inside the workload container.
//!
//! Scripts are written in Python mode. String values are embedded as JSON string literals, which
//! are valid Python string literals.

use snafu::{ResultExt, Snafu};

use crate::{
    relations::{cos::generate_password, database_requires::ConnectionInfo},
    workload::container::{self, Container},
};

const SCRIPT_FILE_NAME: &str = "mysqlsh_script.py";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to encode script argument"))]
    EncodeArgument { source: serde_json::Error },

    #[snafu(display("failed to run MySQL Shell script"))]
    RunScript { source: container::Error },

    #[snafu(display("failed to parse MySQL Shell output {output:?}"))]
    ParseOutput {
        source: serde_json::Error,
        output: String,
    },
}

fn literal(value: &str) -> Result<String, Error> {
    serde_json::to_string(value).context(EncodeArgumentSnafu)
}

pub struct Shell<'a, C> {
    container: &'a mut C,
    connection: &'a ConnectionInfo,
}

impl<'a, C: Container> Shell<'a, C> {
    pub fn new(container: &'a mut C, connection: &'a ConnectionInfo) -> Self {
        Self {
            container,
            connection,
        }
    }

    /// Runs `script` after connecting to the MySQL cluster and returns its output.
    fn run(&mut self, script: &[String]) -> Result<String, Error> {
        let mut lines = vec![format!(
            "shell.connect({})",
            literal(&self.connection.uri())?
        )];
        lines.extend_from_slice(script);
        let script = lines.join("\n");

        let path = self.container.scratch_directory().join(SCRIPT_FILE_NAME);
        self.container
            .write_file(&path, &script)
            .context(RunScriptSnafu)?;
        let command = [
            "mysqlsh".to_owned(),
            "--no-wizard".to_owned(),
            "--python".to_owned(),
            "--file".to_owned(),
            path.display().to_string(),
        ];
        let output = self.container.run_command(&command, None);
        // The script contains credentials
        let removed = self.container.remove_file(&path);
        let output = output.context(RunScriptSnafu)?;
        removed.context(RunScriptSnafu)?;
        Ok(output)
    }

    /// Creates `database` and a user with full privileges on it. Returns the generated password.
    pub fn create_application_database_and_user(
        &mut self,
        username: &str,
        database: &str,
    ) -> Result<String, Error> {
        let password = generate_password();
        let username_literal = literal(username)?;
        let database_literal = literal(database)?;
        self.run(&[
            format!("session.run_sql(\"CREATE DATABASE IF NOT EXISTS `\" + {database_literal} + \"`\")"),
            format!(
                "session.run_sql(\"CREATE USER `\" + {username_literal} + \"`@`%` IDENTIFIED BY '\" + {password} + \"'\")",
                password = literal(&password)?
            ),
            format!(
                "session.run_sql(\"GRANT ALL PRIVILEGES ON `\" + {database_literal} + \"`.* TO `\" + {username_literal} + \"`@`%`\")"
            ),
        ])?;
        tracing::info!(username, database, "created database user");
        Ok(password)
    }

    /// Deletes `username`. Deleting a user that does not exist succeeds.
    pub fn delete_user(&mut self, username: &str) -> Result<(), Error> {
        self.run(&[format!(
            "session.run_sql(\"DROP USER IF EXISTS `\" + {} + \"`@`%`\")",
            literal(username)?
        )])?;
        tracing::info!(username, "deleted database user");
        Ok(())
    }

    /// Whether `router_id` is still registered in the cluster set metadata.
    pub fn is_router_in_cluster_set(&mut self, router_id: &str) -> Result<bool, Error> {
        let output = self.run(&[
            "import json".to_owned(),
            "cluster_set = dba.get_cluster_set()".to_owned(),
            "routers = cluster_set.list_routers()[\"routers\"]".to_owned(),
            format!("print(json.dumps({} in routers))", literal(router_id)?),
        ])?;
        let output = output.trim();
        serde_json::from_str(output).context(ParseOutputSnafu { output })
    }
}
