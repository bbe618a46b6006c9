use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use churn_core::config::{config_schema_json, Config, StoreBackend, TransportKind};
use churn_core::transport::{LocalBroker, Transport};
use churn_core::{load_config, RandomStrategy, RunPlan, RunReport, Workload};
use churn_events::{ClientId, EventStore, MemoryStore};
use churn_kernel::Kernel;
use churn_topics::TopicUniverse;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "churnbench",
    about = "Pub/sub workload generator with forced connection churn"
)]
struct Args {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of workload actions; prompts when neither this nor the config sets it
    #[arg(long)]
    packets: Option<u64>,
    /// Seed for topics, client id and action choices
    #[arg(long)]
    seed: Option<u64>,
    /// Override the forced disconnect interval (seconds)
    #[arg(long)]
    churn_interval_secs: Option<u64>,
    /// Override the delay after each action (milliseconds)
    #[arg(long)]
    pacing_ms: Option<u64>,
    /// Write the run report as JSON to this path
    #[arg(long)]
    json_out: Option<PathBuf>,
    /// Print the config JSON schema and exit
    #[arg(long)]
    print_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    churn_otel::init();
    let args = Args::parse();

    if args.print_schema {
        println!("{}", serde_json::to_string_pretty(&config_schema_json()?)?);
        return Ok(());
    }

    let mut cfg = match args.config.as_deref() {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    cfg.apply_env_overrides();
    if let Some(secs) = args.churn_interval_secs {
        cfg.churn.interval_secs = Some(secs);
    }
    if let Some(ms) = args.pacing_ms {
        cfg.run.pacing_ms = Some(ms);
    }
    let seed = args.seed.or(cfg.run.seed);

    let iterations = match args.packets.or(cfg.run.iterations) {
        Some(n) => n,
        None => prompt_packets()?,
    };

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let client_id = match cfg.run.client_id.as_deref() {
        Some(id) => ClientId::new(id),
        None => ClientId::generate(&mut rng),
    };
    let universe = TopicUniverse::generate(cfg.run.topic_count(iterations), &mut rng);
    let strategy = match seed {
        Some(seed) => RandomStrategy::seeded(seed),
        None => RandomStrategy::new(),
    };

    let transport = build_transport(&cfg).await?;
    let store = build_store(&cfg)?;
    let plan = RunPlan::from_config(&cfg, Some(iterations), &client_id);

    let report = match Workload::new(plan, client_id, universe, transport, store, strategy)
        .run()
        .await
    {
        Ok(report) => report,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    print_summary(&report);
    if let Some(path) = args.json_out.as_deref() {
        let data = serde_json::to_vec_pretty(&report)?;
        fs::write(path, &data)
            .with_context(|| format!("writing JSON report to {}", path.display()))?;
        println!("- JSON report written to {}", path.display());
    }
    Ok(())
}

fn prompt_packets() -> Result<u64> {
    print!("Enter number of packets: ");
    io::stdout().flush()?;
    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line)?;
    if read == 0 {
        bail!("no packet count given");
    }
    line.trim()
        .parse()
        .map_err(|_| anyhow!("invalid packet count: {:?}", line.trim()))
}

async fn build_transport(cfg: &Config) -> Result<Arc<dyn Transport>> {
    match cfg.broker.transport() {
        TransportKind::Local => Ok(Arc::new(LocalBroker::new().transport().await)),
        #[cfg(feature = "nats")]
        TransportKind::Nats => Ok(Arc::new(churn_core::transport::NatsTransport::new(
            cfg.broker.nats_url.clone(),
        ))),
        #[cfg(not(feature = "nats"))]
        TransportKind::Nats => bail!("nats transport needs the `nats` feature"),
    }
}

fn build_store(cfg: &Config) -> Result<Arc<dyn EventStore>> {
    match cfg.store.backend() {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            let dir = cfg.store.dir();
            let kernel = Kernel::open(dir)
                .with_context(|| format!("opening audit store in {}", dir.display()))?;
            Ok(Arc::new(kernel))
        }
    }
}

fn print_summary(report: &RunReport) {
    println!();
    println!("Churn Bench Summary");
    println!("- Run: {}", report.run_id);
    println!("- Client: {}", report.client_id);
    println!("- Iterations: {}", report.iterations);
    println!("- Elapsed: {:.2}s", report.elapsed_seconds);
    println!("- Total Success Count: {}", report.metrics.success_count);
    println!("- Total Failure Count: {}", report.metrics.failure_count);
    println!(
        "- Total Disconnections: {}",
        report.metrics.disconnect_count
    );
    println!("- Churn cycles: {}", report.churn_cycles);
    println!("- Subscriptions held: {}", report.subscriptions);
    let agg = &report.aggregate;
    println!(
        "- Stored events: connect={} disconnect={} status={}",
        agg.connect_count,
        agg.disconnect_count,
        agg.current_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into())
    );
}
