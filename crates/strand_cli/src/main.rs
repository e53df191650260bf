//! STRAND CLI
//!
//! Validates office graphs and runs a small in-process demo office.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strand_plan::{FunctionTemplate, OfficeGraph, ResourceTemplate, TeamTemplate, ValidationError, Validator};
use strand_runtime::{ConstructSource, Failure, MetricsSnapshot, Office, ProcessOutcome, RuntimeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "STRAND - function execution runtime", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an office graph
    Validate {
        /// Path to the graph JSON file
        #[arg(short, long)]
        file: PathBuf,
        /// Upper bound on threads per dedicated team (0 = no limit)
        #[arg(long, default_value_t = 0)]
        max_team_threads: usize,
    },
    /// List the templates of an office graph
    Inspect {
        /// Path to the graph JSON file
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Run the built-in order office
    Demo {
        /// Number of orders to submit
        #[arg(short, long, default_value_t = 8)]
        orders: usize,
        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Commands::Validate { file, max_team_threads } => {
            let errors = check_graph(&file, max_team_threads)?;
            if errors.is_empty() {
                println!("{}: ok", file.display());
                return Ok(());
            }
            for error in &errors {
                println!("  {}", error);
            }
            bail!("{}: {} problem(s)", file.display(), errors.len())
        }
        Commands::Inspect { file } => {
            let graph = OfficeGraph::from_json_file(&file)?;
            print!("{}", describe(&graph));
            Ok(())
        }
        Commands::Demo { orders, config } => {
            let config = match config {
                Some(path) => RuntimeConfig::from_json_file(&path)
                    .wrap_err_with(|| format!("loading config {}", path.display()))?,
                None => RuntimeConfig::default(),
            };
            let (outcomes, metrics) = run_demo(config, &sample_orders(orders))?;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(value) => println!("{} ok     {}", outcome.process, value),
                    Err(failure) => println!("{} failed {}", outcome.process, failure),
                }
            }
            println!("{:#?}", metrics);
            Ok(())
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strand=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load a graph and return everything the validator finds
fn check_graph(path: &Path, max_team_threads: usize) -> Result<Vec<ValidationError>> {
    let graph = OfficeGraph::from_json_file(path)?;
    info!(
        functions = graph.function_count(),
        resources = graph.resource_count(),
        "validating office graph"
    );
    Ok(Validator::new()
        .with_max_team_threads(max_team_threads)
        .validate(&graph)
        .err()
        .unwrap_or_default())
}

fn describe(graph: &OfficeGraph) -> String {
    let mut out = String::new();
    for function in graph.functions() {
        out.push_str(&format!(
            "function {} team={} deps=[{}]",
            function.name,
            function.team.as_deref().unwrap_or("-"),
            function.dependencies.join(", ")
        ));
        if let Some(next) = &function.next {
            out.push_str(&format!(" next={}", next));
        }
        out.push('\n');
    }
    for resource in graph.resources() {
        out.push_str(&format!(
            "resource {} scope={} timeout={} pooled={}\n",
            resource.name,
            resource.scope,
            resource.timeout,
            resource.pool.is_some()
        ));
    }
    for team in graph.teams() {
        out.push_str(&format!("team {} {:?}\n", team.name, team.kind));
    }
    if let Some(handler) = graph.default_handler() {
        out.push_str(&format!("default handler {}\n", handler));
    }
    out
}

#[derive(Debug, Deserialize)]
struct Order {
    sku: String,
    quantity: i64,
}

fn sample_orders(count: usize) -> Vec<Value> {
    const SKUS: [&str; 3] = ["anvil", "rope", "lantern"];
    (0..count)
        .map(|i| {
            // every fourth order is rejected by `receive`
            let quantity = if i % 4 == 3 { 0 } else { i as i64 + 1 };
            json!({ "sku": SKUS[i % SKUS.len()], "quantity": quantity })
        })
        .collect()
}

fn demo_graph() -> Result<OfficeGraph> {
    Ok(OfficeGraph::builder()
        .function(FunctionTemplate::new("receive").then("price"))
        .function(FunctionTemplate::new("price").depends_on("catalog").on_team("workers").then("confirm"))
        .function(FunctionTemplate::new("confirm"))
        .function(FunctionTemplate::new("reject"))
        .resource(ResourceTemplate::new("catalog"))
        .team(TeamTemplate::dedicated("workers", 2))
        .escalation("demo.invalid_order", "reject")
        .build()?)
}

/// Submit every order to a fresh demo office and wait for all of them
fn run_demo(config: RuntimeConfig, orders: &[Value]) -> Result<(Vec<ProcessOutcome>, MetricsSnapshot)> {
    let office = Office::builder(demo_graph()?)
        .config(config)
        .source(
            "catalog",
            ConstructSource::new(|| HashMap::from([("anvil", 120_u64), ("rope", 8), ("lantern", 35)])),
        )
        .function("receive", |ctx| {
            let order: Order = ctx.parameter_as()?;
            if order.quantity <= 0 {
                return Err(Failure::raise(
                    "demo.invalid_order",
                    format!("{} x{} is not a valid quantity", order.sku, order.quantity),
                ));
            }
            Ok(ctx.parameter().clone())
        })
        .function("price", |ctx| {
            let order: Order = ctx.parameter_as()?;
            let catalog = ctx.dependency::<HashMap<&'static str, u64>>(0)?;
            let unit = catalog
                .get(order.sku.as_str())
                .copied()
                .ok_or_else(|| Failure::raise("demo.unknown_sku", order.sku.clone()))?;
            Ok(json!({ "sku": order.sku, "quantity": order.quantity, "total": unit * order.quantity as u64 }))
        })
        .function("confirm", |ctx| {
            let total = ctx.parameter()["total"].as_u64().unwrap_or_default();
            Ok(json!({ "confirmed": ctx.parameter()["sku"], "total": total }))
        })
        .function("reject", |ctx| Ok(json!({ "rejected": ctx.parameter()["message"] })))
        .build()?;

    let handles = orders
        .iter()
        .map(|order| office.submit("receive", order.clone()))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        let outcome = handle
            .wait_timeout(Duration::from_secs(10))
            .ok_or_else(|| eyre!("process {} did not finish", handle.id()))?;
        outcomes.push(outcome);
    }

    let metrics = office.metrics();
    office.shutdown();
    Ok((outcomes, metrics))
}
