use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "beacon-cli", version, about = "Beacon SDK CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Session lifecycle harness
    Session {
        #[command(subcommand)]
        action: commands::session::SessionAction,
    },
    /// Persistent request queue
    Queue {
        #[command(subcommand)]
        action: commands::queue::QueueAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Request signing inspection
    Sign {
        #[command(subcommand)]
        action: commands::sign::SignAction,
    },
}

fn main() {
    // Logs go to stderr; stdout stays parseable JSON.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Session { action } => commands::session::run(action),
        Commands::Queue { action } => commands::queue::run(action),
        Commands::Config { action } => commands::config::run(action),
        Commands::Sign { action } => commands::sign::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
