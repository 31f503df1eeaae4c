// CLI module - command-line argument parsing and handlers
//
// Provides subcommands for configuration management:
// - config --show: Display effective configuration
// - config --reset: Regenerate config file with defaults
// - config --path: Show config file path

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};

/// actrelay - activity-telemetry relay for an LLM desktop assistant
#[derive(Parser)]
#[command(name = "actrelay")]
#[command(version = VERSION)]
#[command(about = "Activity-telemetry relay between a desktop assistant and the warehouse", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Reset config file to the commented template
        #[arg(long)]
        reset: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI commands. Returns true if a command was handled (exit after).
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show, reset, path }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else if reset {
                handle_config_reset();
            } else {
                println!("Usage: actrelay config [--show|--reset|--path]");
            }
            true
        }
        None => false, // No subcommand, run the relay.
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => eprintln!("Could not determine home directory"),
    }
}

fn handle_config_show() {
    match Config::from_env() {
        // Secrets are redacted by the AccountConfig Debug impl.
        Ok(config) => println!("{config:#?}"),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    }
}

fn handle_config_reset() {
    let Some(path) = Config::config_path() else {
        eprintln!("Could not determine home directory");
        return;
    };
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("Failed to create config directory: {e}");
            return;
        }
    }
    match std::fs::write(&path, Config::template_toml()) {
        Ok(()) => println!("Wrote default config to {}", path.display()),
        Err(e) => eprintln!("Failed to write config: {e}"),
    }
}
