use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use itm_adapters::{FixtureCollector, PerplexityCollector, PerplexityConfig, SearchCollector};
use itm_storage::{CollectionStore, MemoryStore, PgStore};
use itm_sync::{CollectionEngine, EngineConfig, StopSignal, SystemClock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "itm-cli")]
#[command(about = "Incremental topic monitor command-line interface")]
struct Cli {
    /// Use an in-process store instead of DATABASE_URL.
    #[arg(long, global = true)]
    memory: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run collection ticks.
    Collect {
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
        #[arg(long, default_value_t = 60)]
        interval_minutes: u64,
        /// Replay fixture bundles from this directory instead of calling the provider.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Seed topics from this file before the first tick.
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Print a JSON health report.
    Health {
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },
    Migrate,
    Seed {
        #[arg(long, default_value = "topics.yaml")]
        file: PathBuf,
    },
    Topic {
        #[command(subcommand)]
        action: TopicAction,
    },
}

#[derive(Debug, Subcommand)]
enum TopicAction {
    Activate { name: String },
    Deactivate { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Collect {
        once: true,
        interval_minutes: 60,
        fixtures: None,
        seed: None,
    });

    match command {
        Commands::Collect {
            once,
            interval_minutes,
            fixtures,
            seed,
        } => {
            let store = open_store(cli.memory).await?;
            if let Some(path) = seed {
                let seeds = itm_sync::load_topic_seeds(&path)?;
                itm_sync::seed_topics(store.as_ref(), seeds, Utc::now()).await?;
            }
            let collector = build_collector(fixtures)?;
            let interval = (!once).then(|| Duration::from_secs(interval_minutes.max(1) * 60));
            collect(store, collector, interval).await?;
        }
        Commands::Health { recent } => {
            let store = open_store(cli.memory).await?;
            let engine = build_engine(store, Arc::new(FixtureCollector::new("fixtures")))?;
            let report = engine.health(recent).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let store = connect_pg().await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Seed { file } => {
            let store = open_store(cli.memory).await?;
            let seeds = itm_sync::load_topic_seeds(&file)?;
            let topics = itm_sync::seed_topics(store.as_ref(), seeds, Utc::now()).await?;
            println!("seeded {} topics from {}", topics.len(), file.display());
        }
        Commands::Topic { action } => {
            let store = open_store(cli.memory).await?;
            let (name, active) = match action {
                TopicAction::Activate { name } => (name, true),
                TopicAction::Deactivate { name } => (name, false),
            };
            let topic = store
                .set_topic_active(&name, active, Utc::now())
                .await
                .with_context(|| format!("updating topic {name}"))?;
            println!("topic {} active={}", topic.topic_name, topic.active);
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let directive = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive.to_lowercase()))
        .context("parsing log filter")?;
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn connect_pg() -> Result<PgStore> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    PgStore::connect(&url, 5)
        .await
        .context("connecting to postgres")
}

async fn open_store(memory: bool) -> Result<Arc<dyn CollectionStore>> {
    if memory {
        warn!("using in-memory store; nothing is persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(connect_pg().await?))
}

fn build_collector(fixtures: Option<PathBuf>) -> Result<Arc<dyn SearchCollector>> {
    match fixtures {
        Some(dir) => {
            info!(dir = %dir.display(), "replaying fixture bundles");
            Ok(Arc::new(FixtureCollector::new(dir)))
        }
        None => {
            let collector = PerplexityCollector::new(PerplexityConfig::from_env())
                .context("configuring perplexity collector")?;
            Ok(Arc::new(collector))
        }
    }
}

fn build_engine(
    store: Arc<dyn CollectionStore>,
    collector: Arc<dyn SearchCollector>,
) -> Result<Arc<CollectionEngine>> {
    let config = EngineConfig::from_env().context("loading engine config")?;
    let engine = CollectionEngine::new(config, store, collector, Arc::new(SystemClock))?;
    Ok(Arc::new(engine))
}

async fn collect(
    store: Arc<dyn CollectionStore>,
    collector: Arc<dyn SearchCollector>,
    interval: Option<Duration>,
) -> Result<()> {
    let engine = build_engine(store, collector)?;
    let stop = StopSignal::new();

    let first_tick = engine.run_tick(&stop);
    tokio::pin!(first_tick);
    let interrupted = tokio::select! {
        summary = &mut first_tick => {
            let summary = summary.context("running collection tick")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            false
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("shutdown requested; finishing current topic"),
                Err(err) => warn!(error = %err, "ctrl-c listener failed; stopping after current topic"),
            }
            stop.request_stop();
            let summary = first_tick.await.context("running collection tick")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            true
        }
    };
    if interrupted {
        return Ok(());
    }

    let Some(mut sched) = engine.maybe_build_scheduler(interval, stop.clone()).await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(
        interval_secs = interval.map(|d| d.as_secs()).unwrap_or_default(),
        "scheduler started; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested; finishing current topic");
    stop.request_stop();
    sched.shutdown().await.context("stopping scheduler")?;
    engine.wait_idle().await;
    info!("in-flight tick finished; exiting");
    Ok(())
}
