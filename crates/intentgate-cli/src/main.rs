mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    apps, blocklist, config,
    daemon::{run_daemon_foreground, run_daemon_process, show_status, start_daemon, stop_daemon},
    unlock::unlock,
};
use intentgate_core::config::get_data_dir;

#[derive(Parser)]
#[command(name = "intentgate")]
#[command(about = "Type a sentence before opening a distracting app", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the background daemon
    Start,
    /// (Internal) Run the daemon process
    #[command(hide = true)]
    DaemonInternalStart,
    /// Stop the background daemon
    Stop,
    /// Show daemon status and running exemptions
    Status,
    /// Run the daemon in the foreground (Ctrl-C to stop)
    Run,
    /// Add an application to the blocked set
    Block {
        /// Application identifier (bundle id or window class)
        app: String,
    },
    /// Remove an application from the blocked set
    Unblock {
        /// Application identifier
        app: String,
    },
    /// Flip an application between blocked and unblocked
    Toggle {
        /// Application identifier
        app: String,
    },
    /// List blocked applications
    List,
    /// List running applications and whether each is blocked
    Apps,
    /// Turn interposition on
    Enable,
    /// Turn interposition off
    Disable,
    /// Answer the challenge for an application
    Unlock {
        /// Application to unlock (defaults to the pending challenge)
        app: Option<String>,
    },
    /// Challenge settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Get a setting (sentence, duration)
    Get {
        key: String,
    },
    /// Set a setting (sentence, duration)
    Set {
        key: String,
        value: String,
    },
    /// List all settings
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::DaemonInternalStart) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init();
    }

    let data_dir = get_data_dir()?;

    match cli.command {
        Commands::Start => start_daemon(&data_dir),
        Commands::DaemonInternalStart => run_daemon_process(&data_dir).await,
        Commands::Stop => stop_daemon(&data_dir).await,
        Commands::Status => show_status(&data_dir).await,
        Commands::Run => run_daemon_foreground(&data_dir).await,
        Commands::Block { app } => blocklist::block(&data_dir, &app).await,
        Commands::Unblock { app } => blocklist::unblock(&data_dir, &app).await,
        Commands::Toggle { app } => blocklist::toggle(&data_dir, &app).await,
        Commands::List => blocklist::list(&data_dir),
        Commands::Apps => apps::list_apps(&data_dir),
        Commands::Enable => blocklist::set_enabled(&data_dir, true).await,
        Commands::Disable => blocklist::set_enabled(&data_dir, false).await,
        Commands::Unlock { app } => unlock(&data_dir, app).await,
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => config::handle_config_get(&data_dir, &key),
            ConfigAction::Set { key, value } => {
                config::handle_config_set(&data_dir, &key, &value).await
            }
            ConfigAction::List => config::handle_config_list(&data_dir),
        },
    }
}
