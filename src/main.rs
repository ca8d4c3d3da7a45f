use std::process::ExitCode;

use clap::{Parser, Subcommand};

use foreman::commands;
use foreman::commands::identities::IdentitiesCommand;
use foreman::commands::run::RunArgs;
use foreman::error::ExitError;
use foreman::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "foreman",
    version,
    about = "Run a pool of coding-agent workers against a task tracker"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Dispatch ready tasks to workers until interrupted
    Run(RunArgs),
    /// Inspect the credential pool
    Identities {
        #[command(subcommand)]
        command: IdentitiesCommand,
    },
    /// Print the JSON Schema for .foreman.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Identities { .. } => "identities",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Run(args) => args.execute(),
        Commands::Identities { command } => command.execute(),
        Commands::Schema => commands::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
