//! testbay CLI - end-to-end UI test orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use testbay::executor::DriverConfig;
use testbay::http::AppState;
use testbay::queue::Queue;
use testbay::retention::Retention;
use testbay::scheduler::Scheduler;
use testbay::{config, discovery, startup, Store};

#[derive(Parser)]
#[command(name = "testbay")]
#[command(about = "End-to-end UI test orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding app.config.json, environments.json, and users.json
    #[arg(long, env = "CONFIG_PATH", default_value = ".")]
    config_dir: PathBuf,

    /// Path to the external test driver binary, invoked once per test
    #[arg(long, default_value = "node")]
    driver_path: String,

    /// Working directory the driver is spawned in
    #[arg(long, default_value = ".")]
    deploy_root: PathBuf,

    /// Environment variable the driver reads its effective config from
    #[arg(long, default_value = "TESTBAY_CONFIG")]
    config_env_var: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery once, apply any outstanding migrations, then serve the
    /// HTTP API and background workers until killed.
    Serve,

    /// Apply outstanding migrations and exit without serving.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let app_config = config::load_app_config(&cli.config_dir.join("app.config.json"))
        .with_context(|| format!("failed to load app.config.json from {}", cli.config_dir.display()))?;
    let environments = config::load_environments(&cli.config_dir.join("environments.json"))
        .with_context(|| format!("failed to load environments.json from {}", cli.config_dir.display()))?;
    let access = match std::fs::read_to_string(cli.config_dir.join("users.json")) {
        Ok(raw) => testbay::access::AccessPolicy::from_json(&raw).context("failed to parse users.json")?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => testbay::access::AccessPolicy::default(),
        Err(e) => return Err(e).context("failed to read users.json"),
    };

    let store = Arc::new(Store::open(&app_config.database_path).context("failed to open database")?);

    match cli.command {
        Commands::Migrate => {
            info!(path = %app_config.database_path.display(), "migrations applied");
            Ok(())
        }
        Commands::Serve => serve(cli, app_config, environments, access, store).await,
    }
}

async fn serve(
    cli: Cli,
    app_config: config::AppConfig,
    environments: Vec<config::Environment>,
    access: testbay::access::AccessPolicy,
    store: Arc<Store>,
) -> Result<()> {
    startup::recover(&store).await.context("startup recovery failed")?;

    let report = discovery::discover_and_sync(&store, &app_config.test_root)
        .await
        .context("initial test discovery failed")?;
    info!(
        upserted = report.upserted,
        deactivated = report.deactivated,
        skipped = report.skipped_folders,
        "initial discovery complete"
    );

    let driver =
        DriverConfig { driver_path: cli.driver_path, deploy_root: cli.deploy_root, config_env_var: cli.config_env_var };

    let queue = Arc::new(Queue::new(
        store.clone(),
        driver.clone(),
        app_config.artifact_root.clone(),
        app_config.max_concurrent_runs,
    ));
    tokio::spawn(queue.run_forever());

    let scheduler = Arc::new(Scheduler::new(store.clone()));
    tokio::spawn(scheduler.run_forever());

    let retention =
        Arc::new(Retention::new(store.clone(), app_config.artifact_root.clone(), app_config.retention_days));
    tokio::spawn(retention.run_forever());

    let state = Arc::new(AppState {
        store,
        access,
        environments,
        artifact_root: app_config.artifact_root,
        driver,
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", app_config.port))
        .await
        .with_context(|| format!("failed to bind port {}", app_config.port))?;
    info!(port = app_config.port, "testbay listening");
    axum::serve(listener, testbay::http::router(state)).await.context("http server error")?;

    Ok(())
}
