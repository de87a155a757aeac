pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "carelink",
    about = "CareLink operator CLI",
    long_about = "Apply migrations, check runtime readiness, and inspect or replay outbox jobs.",
    after_help = "Examples:\n  carelink doctor --json\n  carelink jobs failed --limit 5\n  carelink jobs replay <job-id>"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Validate config, messaging readiness, DB connectivity and queue health")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Inspect and remediate outbox jobs")]
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    #[command(about = "Counts by status and type, plus the age of the oldest pending job")]
    Stats,
    #[command(about = "List jobs that exhausted their attempts")]
    Failed {
        #[arg(long, default_value_t = 20, help = "Maximum number of jobs to list")]
        limit: u32,
    },
    #[command(about = "Return a failed job to pending with a fresh attempt count")]
    Replay {
        #[arg(help = "Id of the failed job")]
        job_id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Jobs { command } => match command {
            JobsCommand::Stats => commands::jobs::stats(),
            JobsCommand::Failed { limit } => commands::jobs::failed(limit),
            JobsCommand::Replay { job_id } => commands::jobs::replay(&job_id),
        },
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
