use clap::Parser;
use std::path::PathBuf;
use tradewarden::commands;
use tradewarden::config::ControllerConfig;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Set the verbosity level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    verbose: String,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run a single recovery cycle and exit (0 clean, 1 outstanding)
    RunOnce,
    /// Run the control loop continuously until shutdown
    Daemon {
        /// Seconds between full cycles, overriding the configured interval
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Print the persisted runtime state and recent incidents
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.verbose.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => match ControllerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Failed to load configuration");
                std::process::exit(2);
            }
        },
        None => ControllerConfig::default(),
    };

    let code = match cli.command {
        Commands::RunOnce => match commands::run_once(config, cli.config.clone()) {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "Startup failed");
                2
            }
        },
        Commands::Daemon { interval } => {
            match commands::run_daemon(config, cli.config.clone(), interval).await {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "Startup failed");
                    2
                }
            }
        }
        Commands::Status => match commands::run_status(&config) {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "Status unavailable");
                2
            }
        },
    };

    std::process::exit(code);
}
