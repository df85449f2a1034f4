use clap::Parser;
use mysql_router_operator::{cli::Command, event::ActionResult, logging, run};
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "mysql-router-operator";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to handle the event"))]
    Run { source: run::Error },

    #[snafu(display("action failed: {message}"))]
    ActionFailed { message: String },
}

#[snafu::report]
fn main() -> Result<(), Error> {
    let Command::Run(arguments) = Command::parse();
    logging::initialize_logging(&arguments.log_env, APP_NAME).context(InitializeLoggingSnafu)?;

    match run::run(&arguments).context(RunSnafu)? {
        Some(ActionResult::Success(message)) => {
            println!("{message}");
            Ok(())
        }
        Some(ActionResult::Failure(message)) => ActionFailedSnafu { message }.fail(),
        None => Ok(()),
    }
}
