//! BusTrack CLI - Command-line interface
//!
//! Replays recorded conductor tracks through a live tracking session,
//! searches bus routes, and manages the configuration file.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::config::ConfigCommands;
use commands::replay::ReplayArgs;
use commands::search::SearchArgs;

#[derive(Debug, Parser)]
#[command(name = "bustrack", version, about = "Live bus tracking")]
struct Cli {
    /// Use this configuration file instead of the default
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replay a recorded GPS track through a conductor tracking session
    Replay {
        /// JSON array of position fixes
        track: PathBuf,

        /// Bus to broadcast as
        #[arg(long)]
        bus: String,

        /// Tag records with this trip id instead of opening a new trip
        #[arg(long)]
        trip: Option<String>,

        /// Play the track this many times faster than recorded
        #[arg(long, default_value_t = 1.0)]
        speedup: f64,

        /// Override tracking.min_interval_ms
        #[arg(long)]
        min_interval_ms: Option<u64>,

        /// Write accepted location records to this JSON file
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Search active buses by origin and/or destination stop
    Search {
        /// JSON array of bus rows
        #[arg(long)]
        buses: Option<PathBuf>,

        /// Boarding stop
        #[arg(long, default_value = "")]
        from: String,

        /// Destination stop
        #[arg(long, default_value = "")]
        to: String,

        /// Do not record this search in the history
        #[arg(long)]
        no_history: bool,
    },

    /// View or modify configuration settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Replay {
            track,
            bus,
            trip,
            speedup,
            min_interval_ms,
            output,
        } => commands::replay::run(ReplayArgs {
            track,
            bus,
            trip,
            speedup,
            min_interval_ms,
            output,
            config: cli.config,
        }),
        Commands::Search {
            buses,
            from,
            to,
            no_history,
        } => commands::search::run(SearchArgs {
            buses,
            from,
            to,
            no_history,
            config: cli.config,
        }),
        Commands::Config { command } => commands::config::run(command, cli.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_replay() {
        let cli = Cli::parse_from([
            "bustrack", "replay", "track.json", "--bus", "B1", "--speedup", "10",
        ]);
        match cli.command {
            Commands::Replay {
                bus, speedup, trip, ..
            } => {
                assert_eq!(bus, "B1");
                assert_eq!(speedup, 10.0);
                assert!(trip.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["bustrack", "config", "path", "--config", "/tmp/x.ini"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.ini")));
    }
}
