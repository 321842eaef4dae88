use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use groundline_core::{
    local_source_paths, regenerate, regenerate_metrics, resolve, route, validate, Layout,
    Protocol,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "groundline",
    version,
    about = "Derive grounding constraints from a protocol and check responses against them"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "GROUNDLINE_ROOT",
        default_value = ".",
        help = "Repository root; data-source paths resolve against it"
    )]
    root: PathBuf,

    #[arg(
        long,
        global = true,
        help = "Protocol file; a relative path is taken from --root, not the working directory (default: protocol/protocol.json)"
    )]
    protocol: Option<PathBuf>,

    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "More logging on stderr")]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the grounding constraints for a query (baseline when omitted)
    Route { query: Option<String> },

    /// Check a candidate response; exits 1 on violations. Reads stdin when TEXT is omitted
    Validate { text: Option<String> },

    /// Print where the agent must take data from
    Sources {
        #[arg(long, help = "Also read and print local source contents")]
        load: bool,
    },

    /// Print the loaded protocol
    Dump,

    /// Rewrite the published constraints artifact
    Regenerate {
        #[arg(long, help = "Also rewrite the integrity metrics snapshot")]
        metrics: bool,
    },
}

#[derive(Serialize)]
struct SourcesOut<'a> {
    data_sources: &'a groundline_core::DataSourceSpec,
    local_paths_resolved: Vec<groundline_core::sources::LocalSourcePath>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut layout = Layout::new(&cli.root);
    if let Some(path) = &cli.protocol {
        layout = layout.with_protocol(path);
    }

    match cli.command.unwrap_or(Commands::Route { query: None }) {
        Commands::Route { query } => {
            let protocol = load(&layout)?;
            print_json(&route(&protocol, query.as_deref()))?;
        }
        Commands::Validate { text } => {
            let text = match text {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read response text from stdin")?;
                    buf
                }
            };
            let protocol = load(&layout)?;
            let constraints = groundline_core::derive(&protocol, None);
            let report = validate(&text, &constraints);
            print_json(&report)?;
            if !report.passed {
                std::process::exit(1);
            }
        }
        Commands::Sources { load: false } => {
            let protocol = load(&layout)?;
            let spec = protocol.data_sources();
            print_json(&SourcesOut {
                data_sources: spec,
                local_paths_resolved: local_source_paths(spec, &layout.root),
            })?;
        }
        Commands::Sources { load: true } => {
            let protocol = load(&layout)?;
            let resolved = resolve(protocol.data_sources(), &layout.root)?;
            print_json(&resolved)?;
        }
        Commands::Dump => {
            print_json(&load(&layout)?)?;
        }
        Commands::Regenerate { metrics } => {
            regenerate(&layout)?;
            eprintln!("Wrote {}", layout.artifact_path.display());
            if metrics {
                regenerate_metrics(&layout)?;
                eprintln!("Wrote {}", layout.metrics_path.display());
            }
        }
    }

    Ok(())
}

fn load(layout: &Layout) -> anyhow::Result<Protocol> {
    Ok(Protocol::load(&layout.protocol_path)?)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Logs go to stderr; stdout carries JSON only.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
