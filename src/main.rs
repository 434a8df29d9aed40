use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use keyspace_dispatch::config::{EngineConfig, PlannerConfig, SliceOrdering};
use keyspace_dispatch::engine::Engine;
use keyspace_dispatch::planner::{parse_keyspace, KeyspaceParams, KeyspaceSource, TaskPlanner};
use keyspace_dispatch::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "keyspace-dispatch")]
#[command(version)]
#[command(about = "Lease-based keyspace distribution for password-cracking agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a scheduler instance with its JSON API
    Serve(ServeArgs),

    /// Preview how a keyspace would be partitioned
    Plan(PlanArgs),
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Instance ID (distinguishes scheduler instances in logs)
    #[arg(long, default_value = "1")]
    instance_id: u64,

    /// Port for the JSON API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Lease time-to-live in seconds
    #[arg(long, default_value = "60")]
    lease_ttl_secs: u64,

    /// Interval between expiry sweeps in milliseconds
    #[arg(long, default_value = "5000")]
    sweep_interval_ms: u64,

    /// Wall-clock work one slice should represent, in seconds
    #[arg(long, default_value = "300")]
    target_slice_secs: u64,

    /// Failures allowed before a slice is declared dead
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Pending slice ordering: oldest-pending-first or largest-remaining-first
    #[arg(long, default_value = "oldest-pending-first")]
    ordering: SliceOrdering,
}

// =============================================================================
// Plan Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct PlanArgs {
    /// Total keyspace as a decimal integer
    #[arg(long, conflicts_with_all = ["mask", "wordlist_lines"])]
    keyspace: Option<String>,

    /// Comma-separated charset sizes, one per mask position (e.g. 26,26,10,10)
    #[arg(long, value_delimiter = ',')]
    mask: Option<Vec<u64>>,

    /// Wordlist line count (combined with --mask for a hybrid attack)
    #[arg(long)]
    wordlist_lines: Option<u64>,

    /// Rule count for a dictionary attack
    #[arg(long, default_value = "0")]
    rules: u64,

    /// Benchmark rate of an eligible agent, candidates/s (repeatable)
    #[arg(long = "rate")]
    rates: Vec<u64>,

    /// Wall-clock work one slice should represent, in seconds
    #[arg(long, default_value = "300")]
    target_slice_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SliceOutput {
    index: usize,
    start: String,
    end: String,
    size: String,
}

#[derive(Serialize)]
struct PlanOutput {
    total_keyspace: String,
    slice_size: String,
    slice_count: u64,
    slices: Vec<SliceOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn keyspace_source(args: &PlanArgs) -> Result<KeyspaceSource, Box<dyn std::error::Error>> {
    let source = match (&args.keyspace, &args.mask, args.wordlist_lines) {
        (Some(total), _, _) => KeyspaceSource::Total(parse_keyspace(total)?),
        (None, Some(mask), Some(lines)) => KeyspaceParams::Hybrid {
            wordlist_lines: lines,
            charset_sizes: mask.clone(),
        }
        .into(),
        (None, Some(mask), None) => KeyspaceParams::Mask {
            charset_sizes: mask.clone(),
        }
        .into(),
        (None, None, Some(lines)) => KeyspaceParams::Dictionary {
            wordlist_lines: lines,
            rule_count: args.rules,
        }
        .into(),
        (None, None, None) => {
            return Err("one of --keyspace, --mask or --wordlist-lines is required".into())
        }
    };
    Ok(source)
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = EngineConfig::new(args.instance_id)
        .with_lease_ttl(Duration::from_secs(args.lease_ttl_secs))
        .with_sweep_interval(Duration::from_millis(args.sweep_interval_ms))
        .with_target_slice_duration(Duration::from_secs(args.target_slice_secs))
        .with_max_attempts(args.max_attempts)
        .with_ordering(args.ordering)
        .with_api_addr(api_addr);

    tracing::info!(
        instance_id = config.instance_id,
        api_addr = %api_addr,
        lease_ttl_secs = args.lease_ttl_secs,
        ordering = %config.assignment.ordering,
        "Starting keyspace-dispatch"
    );

    let shutdown = install_shutdown_handler()?;
    let engine = Arc::new(Engine::new(config));
    engine.run(shutdown).await;
    Ok(())
}

fn handle_plan(args: PlanArgs) -> Result<(), Box<dyn std::error::Error>> {
    let total = keyspace_source(&args)?.resolve()?;
    let planner = TaskPlanner::new(PlannerConfig {
        target_slice_duration: Duration::from_secs(args.target_slice_secs),
        ..PlannerConfig::default()
    });
    let slice_size = planner.slice_size(&args.rates);
    let (plan, ranges) = planner.plan(0, total, 0, slice_size)?;

    match args.output {
        OutputFormat::Json => {
            let output = PlanOutput {
                total_keyspace: plan.total_keyspace.to_string(),
                slice_size: plan.slice_size.to_string(),
                slice_count: plan.slice_count,
                slices: ranges
                    .iter()
                    .enumerate()
                    .map(|(index, r)| SliceOutput {
                        index,
                        start: r.start.to_string(),
                        end: r.end.to_string(),
                        size: r.len().to_string(),
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Total keyspace: {}", plan.total_keyspace);
            println!("Slice size:     {}", plan.slice_size);
            println!("Slices:         {}", plan.slice_count);
            println!();
            println!("{:<8} {:<40} {:<40}", "INDEX", "START", "END");
            println!("{}", "-".repeat(88));
            for (index, r) in ranges.iter().enumerate() {
                println!("{:<8} {:<40} {:<40}", index, r.start, r.end);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await?,
        Commands::Plan(plan_args) => handle_plan(plan_args)?,
    }

    Ok(())
}
