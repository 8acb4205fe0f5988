//! Weft: reactive dataflow query engine
//!
//! Main binary with subcommands:
//! - `reach`: Transitive reachability over a JSON edge list

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weft_engine::{Mode, Options};
use weft_reactive::Request;

mod reach;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Reactive dataflow query engine", long_about = None)]
struct Cli {
    /// Worker threads for execution units (defaults to available cores)
    #[arg(long, global = true, env = "WEFT_PARALLELISM")]
    parallelism: Option<usize>,

    /// Log every pull, receive and path registration at trace level
    #[arg(long, global = true, env = "WEFT_TRACE", value_parser = parse_bool_env, default_value = "false")]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Exhaustive,
    Incremental,
    Bounded,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every node reachable from a start node
    Reach {
        /// JSON file holding an array of [from, to] edges
        #[arg(long)]
        edges: PathBuf,

        /// Start node
        #[arg(long)]
        from: String,

        /// How the query pulls its answers
        #[arg(long, value_enum, default_value = "exhaustive")]
        mode: ModeArg,

        /// Maximum number of answers in bounded mode
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "weft=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut options = Options {
        trace: cli.trace,
        ..Options::default()
    };
    if let Some(parallelism) = cli.parallelism {
        options.parallelism = parallelism;
    }
    options.validate().map_err(|e| miette::miette!("{}", e))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(options.parallelism)
        .enable_all()
        .build()
        .into_diagnostic()?;

    match cli.command {
        Commands::Reach {
            edges,
            from,
            mode,
            limit,
        } => {
            options.mode = match mode {
                ModeArg::Exhaustive => Mode::Exhaustive,
                ModeArg::Incremental => Mode::Incremental,
                ModeArg::Bounded => Mode::Bounded { limit },
            };
            runtime.block_on(run_reach(edges, from, options))
        }
    }
}

async fn run_reach(edges: PathBuf, from: String, options: Options) -> Result<()> {
    let graph = reach::Graph::load(&edges)?;
    info!(edges = graph.edge_count(), %from, mode = ?options.mode, "starting reachability query");

    let engine = reach::engine(graph);
    let answers = engine
        .collect(Request::new(reach::COMPUTATION, from), &options)
        .await
        .map_err(|e| miette::miette!("query failed: {}", e));
    engine.shutdown();

    for node in answers? {
        println!("{node}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_env() {
        assert_eq!(parse_bool_env("YES"), Ok(true));
        assert_eq!(parse_bool_env(""), Ok(false));
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn test_cli_parses_bounded_reach() {
        let cli = Cli::try_parse_from([
            "weft", "--parallelism", "2", "reach", "--edges", "edges.json", "--from", "a", "--mode", "bounded",
            "--limit", "3",
        ])
        .unwrap();

        assert_eq!(cli.parallelism, Some(2));
        let Commands::Reach { from, mode, limit, .. } = cli.command;
        assert_eq!(from, "a");
        assert!(matches!(mode, ModeArg::Bounded));
        assert_eq!(limit, 3);
    }
}
