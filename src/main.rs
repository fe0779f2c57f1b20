use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cli;
mod config;
mod errors;
mod events;
mod jobs;
mod models;
mod service;
mod state;
mod store;

use events::EventBus;
use jobs::release_queue::{self, ReleaseQueue};
use models::token::POOL_SIZE;
use service::TokenService;
use state::TokenStateManager;
use store::{PgStore, TokenRepository};

/// Shared application state passed to handlers.
pub struct AppState {
    pub repo: TokenRepository,
    pub service: TokenService,
    pub cache: TokenStateManager,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tokenpool=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Seed) => run_seed(cfg).await,
        Some(cli::Commands::Clear) => run_clear(cfg).await,
        None => run_server(cfg, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: config::Config, port_override: Option<u16>) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let store = PgStore::connect(&cfg.database_url).await?;

    tracing::info!("Running migrations...");
    store.migrate().await?;

    let repo = TokenRepository::new(store.pool().clone());
    let seeded = repo.seed_pool(POOL_SIZE).await?;
    if seeded > 0 {
        tracing::info!(seeded, "topped up token pool");
    }

    let bus = EventBus::new();
    let (cache, cache_writer) = TokenStateManager::new(bus.clone(), repo.clone());
    tokio::spawn(cache_writer.run());

    let queue = ReleaseQueue::new(store.pool().clone());
    let recovered = queue.recover().await?;
    if recovered > 0 {
        tracing::info!(recovered, "requeued release jobs interrupted by shutdown");
    }

    let service = TokenService::new(repo.clone(), queue.clone(), cache.clone(), bus.clone());

    release_queue::spawn_worker(queue, service.clone(), release_queue::DEFAULT_POLL_INTERVAL);
    jobs::reconciler::spawn(cache.clone());
    cache.reload();

    let port = port_override.unwrap_or(cfg.port);
    let host = cfg.host.clone();
    let state = Arc::new(AppState {
        repo,
        service,
        cache,
    });

    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/readyz", axum::routing::get(readiness_check))
        .nest("/api", api::api_router())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("tokenpool listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn readiness_check() -> &'static str {
    "ok"
}

async fn run_seed(cfg: config::Config) -> anyhow::Result<()> {
    let store = PgStore::connect(&cfg.database_url).await?;
    store.migrate().await?;

    let repo = TokenRepository::new(store.pool().clone());
    let seeded = repo.seed_pool(POOL_SIZE).await?;
    let total = repo.count_total(repo.pool()).await?;
    println!("Seeded {} token(s); pool now holds {}.", seeded, total);
    Ok(())
}

async fn run_clear(cfg: config::Config) -> anyhow::Result<()> {
    let store = PgStore::connect(&cfg.database_url).await?;
    let repo = TokenRepository::new(store.pool().clone());

    let mut tx = repo.pool().begin().await?;
    let (token_ids, usages_closed) = repo.clear_all_active(&mut tx).await?;
    tx.commit().await?;

    println!(
        "Cleared {} active token(s); closed {} usage(s).",
        token_ids.len(),
        usages_closed
    );
    Ok(())
}
