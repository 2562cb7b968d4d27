mod host;

use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mnemo_core::{
    DAY_MS, FragmentSeed, MAX_TRAUMA, ManualClock, MemoryStore, Runtime, RuntimeConfig,
    SystemClock, unix_ms_to_iso8601,
};
use mnemo_store::Store;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "mnemo", about = "Event-driven memory runtime host")]
struct Cli {
    /// Configuration file (defaults to config.toml in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the persistence scope
    #[arg(long, global = true)]
    scope: Option<String>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the runtime on stdin/stdout as JSON lines
    Run,

    /// Print the stored snapshot for the scope
    Snapshot,

    /// List every scope with a stored snapshot
    Scopes,

    /// Delete the stored snapshot for the scope
    Clear,

    /// Run decay cycles against a synthetic population
    Simulate {
        /// Initial fragment count
        #[arg(long, default_value_t = 200)]
        fragments: usize,

        /// Number of decay cycles
        #[arg(long, default_value_t = 20)]
        cycles: u64,

        /// RNG seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn data_dir() -> Result<PathBuf> {
    let base = mnemo_store::default_base_dir();
    std::fs::create_dir_all(&base)
        .with_context(|| format!("failed to create data dir {}", base.display()))?;
    Ok(base)
}

fn open_store(base: &Path) -> Result<Store> {
    Store::open(&mnemo_store::database_path(base)).context("failed to open snapshot store")
}

fn load_settings(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => mnemo_store::load_config(path)?,
        None => mnemo_store::load_config_or_default(&mnemo_store::config_path(
            &mnemo_store::default_base_dir(),
        ))?,
    };
    if let Some(scope) = &cli.scope {
        config.scope = scope.clone();
    }
    Ok(config)
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

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_settings(&cli)?;

    match &cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Snapshot => cmd_snapshot(&config),
        Commands::Scopes => cmd_scopes(),
        Commands::Clear => cmd_clear(&config),
        Commands::Simulate {
            fragments,
            cycles,
            seed,
        } => cmd_simulate(config, *fragments, *cycles, *seed),
        Commands::Config => cmd_config(&config),
    }
}

async fn cmd_run(config: RuntimeConfig) -> Result<()> {
    let store = open_store(&data_dir()?)?;
    let interval = config.decay.cycle_interval_ms;
    tracing::info!(scope = %config.scope, interval, "starting runtime host");

    let runtime = Runtime::new(config, Rc::new(SystemClock), Box::new(store));
    let outbox = host::attach_output(&runtime)?;
    if let Some(resurrection) = runtime.resume() {
        tracing::info!(
            restored = resurrection.restored,
            phase = %resurrection.phase,
            "resumed from snapshot"
        );
    }

    let cancel = CancellationToken::new();
    tokio::spawn(host::watch_signals(cancel.clone()));
    host::serve(&runtime, outbox, cancel, interval).await
}

fn cmd_snapshot(config: &RuntimeConfig) -> Result<()> {
    let store = open_store(&data_dir()?)?;
    match store
        .load_snapshot(&config.scope)
        .context("failed to read snapshot")?
    {
        Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        None => println!("no snapshot for scope '{}'", config.scope),
    }
    Ok(())
}

fn cmd_scopes() -> Result<()> {
    let store = open_store(&data_dir()?)?;
    let scopes = store.scopes().context("failed to list scopes")?;
    if scopes.is_empty() {
        println!("(no snapshots)");
    }
    for entry in scopes {
        println!(
            "{:<24} {:>8}B  {}",
            entry.scope,
            entry.bytes,
            unix_ms_to_iso8601(entry.written_at)
        );
    }
    Ok(())
}

fn cmd_clear(config: &RuntimeConfig) -> Result<()> {
    let store = open_store(&data_dir()?)?;
    if store
        .clear_snapshot(&config.scope)
        .context("failed to clear snapshot")?
    {
        println!("cleared snapshot for scope '{}'", config.scope);
    } else {
        println!("no snapshot for scope '{}'", config.scope);
    }
    Ok(())
}

fn cmd_simulate(config: RuntimeConfig, fragments: usize, cycles: u64, seed: u64) -> Result<()> {
    let clock = ManualClock::new(1_000 * DAY_MS);
    let interval = config.decay.cycle_interval_ms;
    let runtime = Runtime::new(config, Rc::new(clock.clone()), Box::new(MemoryStore::new()));
    let mut rng = SmallRng::seed_from_u64(seed);

    for i in 0..fragments {
        runtime.add_fragment(&FragmentSeed::random(format!("f{i}"), &mut rng));
    }
    let mut intensity = 0.0_f64;

    for _ in 0..cycles {
        clock.advance(interval);
        runtime.poll_timers();

        intensity = (intensity + rng.random_range(-1.5..=1.5)).clamp(0.0, MAX_TRAUMA);
        runtime.set_intensity(intensity);

        // revisit a few existing memories, and let a new one surface
        for _ in 0..3 {
            let id = format!("f{}", rng.random_range(0..fragments.max(1)));
            runtime.add_fragment(&FragmentSeed::random(id, &mut rng));
        }

        let report = runtime
            .run_decay_cycle()
            .context("decay cycle did not run")?;
        let metrics = runtime.metrics();
        println!(
            "cycle {:>4}  phase={:<9} intensity={:>5.2}  active={:>5} crystallized={:>4} archives={:>3} died={:>3} evicted={:>3} stability={:.3}",
            report.cycle,
            runtime.bus().phase().to_string(),
            runtime.bus().intensity(),
            metrics.active,
            metrics.crystallized,
            metrics.archives,
            report.died,
            report.evicted,
            metrics.stability_score,
        );
    }

    let metrics = runtime.metrics();
    println!(
        "done. active={}, crystallized={}, compressed={}, mean_integrity={:.3}, transitions={}",
        metrics.active,
        metrics.crystallized,
        metrics.compressed,
        metrics.mean_integrity,
        runtime.controller().audit_log().len(),
    );
    Ok(())
}

fn cmd_config(config: &RuntimeConfig) -> Result<()> {
    let text = mnemo_store::to_toml(config).context("failed to render configuration")?;
    print!("{text}");
    Ok(())
}
