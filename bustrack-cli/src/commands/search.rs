//! Search command - find active buses serving a from/to pair.

use std::path::{Path, PathBuf};

use bustrack::model::BusSnapshot;
use bustrack::route_search::{search, RouteQuery, SearchHistory};
use tracing::debug;

use super::common::read_json;
use crate::error::CliError;
use crate::runner::CliRunner;

/// Arguments for the search command.
pub struct SearchArgs {
    pub buses: Option<PathBuf>,
    pub from: String,
    pub to: String,
    pub no_history: bool,
    pub config: Option<PathBuf>,
}

/// Run the search command.
pub fn run(args: SearchArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(args.config.as_deref())?;
    runner.log_startup("search");
    let settings = &runner.config().search;

    let query = RouteQuery::new(args.from, args.to);
    let mut history = SearchHistory::load(&settings.history_file, settings.history_limit)?;

    if query.is_empty() {
        print_history(&history);
        return Ok(());
    }

    let buses_path = args.buses.as_deref().ok_or_else(|| {
        CliError::Config("--buses is required when searching by --from or --to".to_string())
    })?;
    let buses = load_buses(buses_path)?;
    let found = search(&buses, &query);
    print_results(&query, &found);

    if !args.no_history && history.record(&query) {
        history.save(&settings.history_file)?;
        debug!(path = %settings.history_file.display(), "Search history updated");
    }

    Ok(())
}

fn print_results(query: &RouteQuery, found: &[&BusSnapshot]) {
    println!("{}", describe_query(query));
    println!();

    if found.is_empty() {
        println!("No active buses found on this route");
        return;
    }

    for bus in found {
        println!("  Bus {:<6} {}", bus.number, bus.route_name);
        println!("    {}", bus.complete_route().join(" → "));
        if let Some(capacity) = bus.capacity {
            println!("    Capacity: {}", capacity);
        }
    }
    println!();
    println!("{} bus(es) found", found.len());
}

fn describe_query(query: &RouteQuery) -> String {
    match (query.from.trim(), query.to.trim()) {
        (from, "") => format!("Buses stopping at '{}'", from),
        ("", to) => format!("Buses stopping at '{}'", to),
        (from, to) => format!("Buses from '{}' to '{}'", from, to),
    }
}

fn print_history(history: &SearchHistory) {
    if history.is_empty() {
        println!("No recent searches. Use --from and/or --to to search.");
        return;
    }

    println!("Recent searches:");
    for query in history.entries() {
        println!("  {} → {}", query.from, query.to);
    }
}

/// Load bus rows exported from the backend.
fn load_buses(path: &Path) -> Result<Vec<BusSnapshot>, CliError> {
    read_json(path)
}
