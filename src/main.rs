use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use roleseed::bootstrap::{self, BootstrapError};
use roleseed::config::AppConfig;
use roleseed::db::ConnectionManager;
use roleseed::{logging, seed};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "roleseed", version, about = "Bootstrap and seed the roles database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the timezone gate, then seed baseline roles (default).
    Seed {
        /// Seed file to load instead of `$SEED_DIR/role_seed.json`.
        #[arg(long, env = "SEED_FILE")]
        file: Option<PathBuf>,
    },
    /// Fail unless database connections run in UTC.
    VerifyTimezone,
    /// Log the timezone audit report without failing.
    AuditTimezone,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("roleseed: {}", BootstrapError::from(err));
            return ExitCode::FAILURE;
        }
    };
    let log_path = match logging::init(
        config.log_level,
        &config.app_env,
        config.log_dir.as_deref(),
        config.log_rotation,
    ) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("roleseed: {}", BootstrapError::from(err));
            return ExitCode::FAILURE;
        }
    };
    info!(log_file = %log_path.display(), env = %config.app_env, "logging initialized");

    match run(cli.command.unwrap_or(Command::Seed { file: None }), &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(severity = "critical", error = %err, "roleseed failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &AppConfig) -> Result<(), BootstrapError> {
    let manager = ConnectionManager::instance(&config.database).await?;
    let query_timeout = config.database.query_timeout();

    match command {
        Command::Seed { file } => {
            let path = bootstrap::seed_path(&config.seed_dir, file.as_deref());
            let seed = seed::load_seed_file(&path)?;
            bootstrap::seed_database(manager, &seed, query_timeout).await?;
        }
        Command::VerifyTimezone => {
            bootstrap::verify_timezone(manager, query_timeout).await?;
        }
        Command::AuditTimezone => {
            bootstrap::audit_timezone(manager, query_timeout).await?;
        }
    }
    Ok(())
}
