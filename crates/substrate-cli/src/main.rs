mod config;
mod protocol;
mod server;
mod worker;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use substrate_core::{
    AsOf, EdgeSpec, EngineInstance, EntityId, NodeId, NodeSpec, ProposalOutcome, now_millis,
};
use substrate_store::{Store, TenantDirectory};

use crate::config::ServeConfig;
use crate::worker::TickSummary;

const DEFAULT_TENANT: &str = "default";

#[derive(Parser)]
#[command(name = "substrate", about = "Energy-based spreading-activation substrate")]
struct Cli {
    /// Tenant to operate on (repeatable for `serve` and `stats`)
    #[arg(long, global = true)]
    tenant: Vec<String>,

    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tenant tick loops with a JSON-lines interface on stdio
    Serve,

    /// Tick a random graph and print one summary line per tick
    Simulate {
        #[arg(long, default_value_t = 200)]
        nodes: usize,
        /// Outgoing edges per node
        #[arg(long, default_value_t = 4)]
        degree: usize,
        #[arg(long, default_value_t = 3)]
        entities: usize,
        #[arg(long, default_value_t = 50)]
        ticks: u64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Commit every tick to the tenant database
        #[arg(long)]
        persist: bool,
    },

    /// Point-in-time reads against a tenant database
    Inspect {
        #[command(subcommand)]
        target: InspectTarget,
    },

    /// Show tenant statistics
    Stats,

    /// Export a tenant partition to a JSON file
    Export {
        /// Output file path
        path: PathBuf,
    },

    /// Replace a tenant partition from a JSON file
    Import {
        /// Input file path
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum InspectTarget {
    /// The node bound to a key
    Node {
        key: String,
        /// Unix milliseconds; defaults to now
        #[arg(long)]
        at: Option<i64>,
    },
    /// An entity by id
    Entity {
        id: u64,
        #[arg(long)]
        at: Option<i64>,
    },
    /// Most recent lifecycle events
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Journaled deltas after a tick
    Deltas {
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

fn tenant_dir() -> TenantDirectory {
    let base_dir = std::env::var("SUBSTRATE_DATA_DIR").ok().map(PathBuf::from);
    TenantDirectory::new(base_dir.as_deref())
}

/// The one tenant a single-tenant command works on.
fn single_tenant(cli: &Cli, config: &ServeConfig) -> Result<String> {
    match (cli.tenant.as_slice(), config.tenants.as_slice()) {
        ([one], _) => Ok(one.clone()),
        ([], [one]) => Ok(one.clone()),
        ([], []) => Ok(DEFAULT_TENANT.to_string()),
        ([], _) => bail!("config lists several tenants; pick one with --tenant"),
        _ => bail!("this command takes exactly one --tenant"),
    }
}

fn open_tenant(tenant: &str) -> Result<Store> {
    tenant_dir()
        .open(tenant)
        .with_context(|| format!("failed to open tenant '{tenant}'"))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = ServeConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Serve => server::serve(tenant_dir(), config, cli.tenant.clone()).await,
        Commands::Simulate {
            nodes,
            degree,
            entities,
            ticks,
            seed,
            persist,
        } => {
            let tenant = single_tenant(&cli, &config)?;
            let params = SimParams {
                nodes: *nodes,
                degree: *degree,
                entities: *entities,
                ticks: *ticks,
                seed: *seed,
            };
            let store = if *persist { Some(open_tenant(&tenant)?) } else { None };
            cmd_simulate(&tenant, &config, params, store.as_ref())
        }
        Commands::Inspect { target } => {
            let store = open_tenant(&single_tenant(&cli, &config)?)?;
            cmd_inspect(&store, target)
        }
        Commands::Stats => cmd_stats(&cli),
        Commands::Export { path } => {
            let tenant = single_tenant(&cli, &config)?;
            cmd_export(&tenant, path)
        }
        Commands::Import { path } => {
            let tenant = single_tenant(&cli, &config)?;
            cmd_import(&tenant, path)
        }
    }
}

struct SimParams {
    nodes: usize,
    degree: usize,
    entities: usize,
    ticks: u64,
    seed: u64,
}

fn cmd_simulate(
    tenant: &str,
    config: &ServeConfig,
    params: SimParams,
    store: Option<&Store>,
) -> Result<()> {
    if params.nodes < 2 || params.entities == 0 || params.entities > params.nodes {
        bail!("need at least 2 nodes and between 1 and {} entities", params.nodes);
    }
    let mut rng = SmallRng::seed_from_u64(params.seed);
    let mut engine = match store {
        Some(store) => {
            let mut state = store.load_partition().context("failed to load partition")?;
            state.tenant = tenant.to_string();
            EngineInstance::restore(config.engine.clone(), state)
        }
        None => EngineInstance::new(tenant, config.engine.clone()),
    };

    // Simulated clock, so runs are reproducible.
    let mut now = 0;
    let ids: Vec<NodeId> = (0..params.nodes)
        .map(|i| engine.upsert_node(NodeSpec::new(format!("sim-{i}")), None, now))
        .collect::<substrate_core::Result<_>>()?;
    for &source in &ids {
        for _ in 0..params.degree {
            let target = ids[rng.random_range(0..ids.len())];
            if target != source {
                engine.upsert_edge(
                    EdgeSpec::new(source, target, rng.random_range(0.1..0.9)),
                    None,
                    now,
                )?;
            }
        }
    }
    let chunk = params.nodes / params.entities;
    for (i, members) in ids.chunks(chunk).take(params.entities).enumerate() {
        let seeds = &members[..members.len().min(8)];
        engine.propose_entity(&format!("sim-{i}"), seeds, now)?;
    }
    if let Some(store) = store {
        store.commit(&engine.state(), &engine.drain())?;
    } else {
        engine.drain();
    }

    for _ in 0..params.ticks {
        let live: Vec<EntityId> = engine.registry().live_ids();
        if !live.is_empty() && rng.random_bool(0.3) {
            let entity = live[rng.random_range(0..live.len())];
            let node = ids[rng.random_range(0..ids.len())];
            let amount = rng.random_range(0.2..0.8);
            if let Err(e) = engine.inject_energy(entity, node, amount, "simulate", now) {
                tracing::debug!(%entity, %node, error = %e, "stimulus skipped");
            }
        }

        now = engine.schedule(now).due_at;
        let report = match engine.run_tick(now) {
            Ok(report) => report,
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "tick aborted, retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(store) = store {
            store.commit(&engine.state(), &report.batch)?;
        }
        println!("{}", serde_json::to_string(&TickSummary::new(&engine, &report))?);
    }
    Ok(())
}

fn as_of(at: Option<i64>) -> AsOf {
    AsOf::at(at.unwrap_or_else(now_millis))
}

fn cmd_inspect(store: &Store, target: &InspectTarget) -> Result<()> {
    let json = match target {
        InspectTarget::Node { key, at } => {
            let node = store.get_node_by_key_as_of(key, as_of(*at))?;
            serde_json::to_string_pretty(&node)?
        }
        InspectTarget::Entity { id, at } => {
            let entity = store.get_entity_as_of(EntityId(*id), as_of(*at))?;
            serde_json::to_string_pretty(&entity)?
        }
        InspectTarget::Events { limit } => {
            serde_json::to_string_pretty(&store.recent_events(*limit)?)?
        }
        InspectTarget::Deltas { since } => {
            serde_json::to_string_pretty(&store.deltas_since(*since)?)?
        }
    };
    println!("{json}");
    Ok(())
}

fn cmd_stats(cli: &Cli) -> Result<()> {
    let dir = tenant_dir();
    let tenants = if cli.tenant.is_empty() {
        dir.list().context("failed to list tenants")?
    } else {
        cli.tenant.clone()
    };
    if tenants.is_empty() {
        println!("no tenants in {}", dir.base().display());
        return Ok(());
    }

    for (i, tenant) in tenants.iter().enumerate() {
        let store = open_tenant(tenant)?;
        let stats = store.stats().context("failed to read stats")?;
        let db_size = std::fs::metadata(dir.db_path(tenant)?)
            .map(|m| m.len())
            .unwrap_or(0);
        if i > 0 {
            println!();
        }
        println!("tenant:     {tenant}");
        println!("tick:       {}", stats.tick);
        println!(
            "nodes:      {} open, {} versions",
            stats.open_nodes, stats.node_versions
        );
        println!(
            "edges:      {} open, {} versions",
            stats.open_edges, stats.edge_versions
        );
        println!(
            "entities:   {} live, {} versions",
            stats.live_entities, stats.entity_versions
        );
        println!(
            "journal:    {} deltas, {} events",
            stats.deltas, stats.lifecycle_events
        );
        println!("db_size:    {:.1}KB", db_size as f64 / 1024.0);
    }
    Ok(())
}

fn cmd_export(tenant: &str, path: &Path) -> Result<()> {
    let store = open_tenant(tenant)?;
    store
        .export_json_file(path)
        .with_context(|| format!("failed to export to {}", path.display()))?;
    println!(
        "exported {tenant} to {} at {}",
        path.display(),
        substrate_core::time::now_iso8601()
    );
    Ok(())
}

fn cmd_import(tenant: &str, path: &Path) -> Result<()> {
    let store = open_tenant(tenant)?;
    store
        .import_json_file(path)
        .context("failed to import JSON")?;

    // The partition keeps the importing tenant's name.
    store.set_metadata("tenant", tenant)?;
    let stats = store.stats()?;
    println!(
        "imported {} into {tenant}. nodes={}, edges={}, entities={}",
        path.display(),
        stats.open_nodes,
        stats.open_edges,
        stats.live_entities
    );
    Ok(())
}
