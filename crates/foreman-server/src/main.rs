mod config;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use foreman_core::bus::EventBus;
use foreman_core::rpc::{HttpWorkerClient, RpcConfig};
use foreman_core::sandbox::docker::DockerSandbox;
use foreman_core::scheduler::{Scheduler, SchedulerConfig};
use foreman_db::config::DbConfig;
use foreman_db::pool;
use foreman_db::store::TaskStore;

use config::{AuthSection, ConfigFile, DatabaseSection, ForemanConfig, SandboxSection};

#[derive(Parser)]
#[command(
    name = "foreman",
    about = "Hierarchical orchestrator for sandboxed LLM worker agents"
)]
struct Cli {
    /// Database URL (overrides FOREMAN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a foreman config file (no database required)
    Init {
        /// SQLite connection URL
        #[arg(long, default_value = DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the orchestrator server
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Listen port (overrides the PORT env var; default 8080)
        #[arg(long)]
        port: Option<u16>,
        /// Auto-approve completed phases instead of gating on a human
        #[arg(long)]
        auto_approve: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { db_url, force } => run_init(&db_url, force),
        Commands::Serve {
            bind,
            port,
            auto_approve,
        } => run_serve(cli.database_url.as_deref(), &bind, port, auto_approve).await,
    }
}

fn run_init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let file = ConfigFile {
        database: DatabaseSection {
            url: db_url.to_string(),
        },
        auth: AuthSection {
            token_secret: config::generate_token_secret(),
        },
        sandbox: SandboxSection::default(),
    };
    config::save_config(&file)?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn run_serve(
    cli_db_url: Option<&str>,
    bind: &str,
    port: Option<u16>,
    auto_approve: bool,
) -> Result<()> {
    let config = ForemanConfig::resolve(cli_db_url)?;

    let db_pool = pool::create_pool(&config.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    let store = TaskStore::new(db_pool);

    let scheduler = Scheduler::new(
        store,
        Arc::new(EventBus::default()),
        Arc::new(DockerSandbox::new(config.sandbox_config)),
        Arc::new(HttpWorkerClient::new(RpcConfig::default())),
        config.token_config,
        SchedulerConfig {
            require_approval: !auto_approve,
            ..SchedulerConfig::default()
        },
    );

    let report = scheduler.recover().await?;
    tracing::info!(
        restored = report.restored,
        failed_planning = report.failed_planning,
        recovered_running = report.recovered_running,
        "warm start complete"
    );

    let port = port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8080);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;

    let app = routes::build_router(scheduler.clone());
    tracing::info!("foreman listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cancel in-flight work and reclaim every sandbox before exiting.
    scheduler.shutdown().await;
    tracing::info!("foreman shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
