use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use prepper_alerts::api::audit_routes;
use prepper_alerts::artifact::ArtifactWriter;
use prepper_alerts::config::{AppPaths, LoadedConfig};
use prepper_alerts::notify::Dispatcher;
use prepper_alerts::pipeline::AlertPipeline;
use prepper_alerts::sources::InboxFileSource;
use prepper_alerts::store::{AlertStore, LibSqlBackend};

#[derive(Parser)]
#[command(name = "prepper-alerts", version, about = "Signal fusion and alert decision engine")]
struct Cli {
    /// Directory holding locations.yaml and settings.yaml
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Directory holding the database, inbox and run artifacts
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one run over the inbox
    Run {
        /// Decide alerts but only log them; state is left untouched
        #[arg(long)]
        dry_run: bool,
    },
    /// Print alert state as JSON
    State {
        /// Show the state committed by this run instead of the current one
        #[arg(long)]
        as_of: Option<String>,
    },
    /// Serve the read-only audit API
    Serve {
        #[arg(long, env = "PREPPER_API_PORT", default_value_t = 8080)]
        port: u16,
    },
    /// Load configuration and report problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let _log_guard = init_tracing()?;

    let cli = Cli::parse();
    let paths = AppPaths::from_env(cli.config_dir, cli.data_dir);

    match cli.command {
        Command::Run { dry_run } => run(&paths, dry_run).await,
        Command::State { as_of } => state(&paths, as_of).await,
        Command::Serve { port } => serve(&paths, port).await,
        Command::Validate => validate(&paths),
    }
}

/// Stderr logging, plus a daily log file when `PREPPER_LOG_DIR` is set.
fn init_tracing() -> Result<Option<WorkerGuard>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("PREPPER_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            std::fs::create_dir_all(&dir).with_context(|| format!("Creating log dir {dir}"))?;
            let appender = tracing_appender::rolling::daily(&dir, "prepper-alerts.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .with(file)
                .init();
            Ok(Some(guard))
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .init();
            Ok(None)
        }
    }
}

fn load_config(paths: &AppPaths) -> Result<LoadedConfig> {
    let config = LoadedConfig::load(paths)?;
    for problem in &config.problems {
        eprintln!("   Warning: {problem}");
    }
    Ok(config)
}

async fn open_store(paths: &AppPaths) -> Result<Arc<dyn AlertStore>> {
    let db_path = paths.database_file();
    let store = LibSqlBackend::new_local(&db_path)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    Ok(Arc::new(store))
}

// ── Subcommands ─────────────────────────────────────────────────────

async fn run(paths: &AppPaths, dry_run: bool) -> Result<()> {
    let LoadedConfig {
        registry,
        mut settings,
        ..
    } = load_config(paths)?;
    settings.dry_run |= dry_run;

    eprintln!("🛰  Prepper Alerts v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Locations: {}", registry.len());
    eprintln!("   Inbox: {}", paths.inbox_dir().display());
    if settings.dry_run {
        eprintln!("   Mode: dry run (no notifications, state untouched)");
    }

    let store = open_store(paths).await?;
    let dispatcher = Dispatcher::from_settings(&settings.dispatch, settings.dry_run);
    let sources = InboxFileSource::discover(&paths.inbox_dir());
    let pipeline = AlertPipeline::new(registry, settings, store, dispatcher)
        .with_artifacts(ArtifactWriter::new(&paths.data_dir));

    let artifact = pipeline.run(&sources).await;

    eprintln!(
        "   Run {}: {} signals, {} aggregates, {} alerts ({} undelivered)",
        artifact.run_id,
        artifact.signals.len(),
        artifact.aggregates.len(),
        artifact.alerts.len(),
        artifact.undelivered().count(),
    );
    if artifact.degraded.any() {
        eprintln!("   Degraded: {:?}", artifact.degraded);
    }
    Ok(())
}

async fn state(paths: &AppPaths, as_of: Option<String>) -> Result<()> {
    let store = open_store(paths).await?;
    let book = match as_of {
        Some(run_id) => store
            .state_as_of(&run_id)
            .await?
            .ok_or_else(|| anyhow!("No state snapshot for run {run_id}"))?,
        None => store.load_state().await?,
    };
    println!("{}", serde_json::to_string_pretty(&book)?);
    Ok(())
}

async fn serve(paths: &AppPaths, port: u16) -> Result<()> {
    let store = open_store(paths).await?;
    let app = audit_routes(store);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("Failed to bind audit API port {port}"))?;
    tracing::info!(port, "Audit API started");
    axum::serve(listener, app).await?;
    Ok(())
}

fn validate(paths: &AppPaths) -> Result<()> {
    let config = load_config(paths)?;
    let registry = &config.registry;
    for location in registry.iter() {
        let policy = config.settings.policy_for(location, registry.quake_floors());
        println!(
            "{:<16} {:<28} confirm>={} x{}  surge>={}  official>={}",
            location.id,
            location.name,
            policy.confirmation_floor,
            policy.confirmation_sources,
            policy.surge_publishers,
            policy.official_floor,
        );
    }
    println!(
        "{} locations valid, {} entries dropped",
        registry.len(),
        config.problems.len()
    );
    Ok(())
}
