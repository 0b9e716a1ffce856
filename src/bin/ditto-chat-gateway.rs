#[cfg(feature = "gateway")]
use std::path::PathBuf;
#[cfg(feature = "gateway")]
use std::sync::Arc;

#[cfg(feature = "gateway")]
use clap::Parser;

#[cfg(feature = "gateway")]
const DEFAULT_SQLITE_PATH: &str = "ditto-chat-gateway.sqlite";

#[cfg(feature = "gateway")]
#[derive(Debug, Parser)]
#[command(name = "ditto-chat-gateway", about = "Chat gateway in front of an OpenAI-compatible backend")]
struct Cli {
    /// Config file (.json, .toml or .yaml).
    #[arg(long, short)]
    config: PathBuf,
    /// Overrides `listen`.
    #[arg(long)]
    listen: Option<String>,
    /// Overrides `store.sqlite_path`.
    #[arg(long)]
    sqlite: Option<PathBuf>,
    /// Overrides `store.redis_url`.
    #[arg(long)]
    redis: Option<String>,
    #[arg(long)]
    json_logs: bool,
}

#[cfg(feature = "gateway")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    ditto_chat_gateway::gateway::observability::init_tracing(cli.json_logs)
        .map_err(|err| err.to_string())?;

    let mut config = ditto_chat_gateway::gateway::GatewayConfig::from_path(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(path) = cli.sqlite {
        config.store.sqlite_path = Some(path);
    }
    if let Some(url) = cli.redis {
        config.store.redis_url = Some(url);
    }

    let sqlite_path = config
        .store
        .sqlite_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH));
    let sqlite = ditto_chat_gateway::gateway::SqliteStore::new(&sqlite_path);
    sqlite.init().await?;
    tracing::info!(path = %sqlite_path.display(), "sqlite store ready");

    let backends = attach_shared_stores(&config, sqlite).await?;
    let state = ditto_chat_gateway::gateway::GatewayHttpState::new(&config, backends)?;

    let app = ditto_chat_gateway::gateway::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, backend = %config.backend.base_url, "ditto-chat-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(all(feature = "gateway", feature = "gateway-store-redis"))]
async fn attach_shared_stores(
    config: &ditto_chat_gateway::gateway::GatewayConfig,
    sqlite: ditto_chat_gateway::gateway::SqliteStore,
) -> Result<ditto_chat_gateway::gateway::GatewayBackends, Box<dyn std::error::Error>> {
    let Some(url) = config.store.redis_url.as_deref() else {
        return Ok(memory_backends(sqlite));
    };
    let mut store = ditto_chat_gateway::gateway::RedisStore::new(url)?;
    if let Some(prefix) = config.store.redis_prefix.as_ref() {
        store = store.with_prefix(prefix.clone());
    }
    store.ping().await?;
    tracing::info!("redis store ready");

    let store = Arc::new(store);
    Ok(ditto_chat_gateway::gateway::GatewayBackends {
        sqlite,
        quota: store.clone(),
        token_versions: store.clone(),
        broker: store,
    })
}

#[cfg(all(feature = "gateway", not(feature = "gateway-store-redis")))]
async fn attach_shared_stores(
    config: &ditto_chat_gateway::gateway::GatewayConfig,
    sqlite: ditto_chat_gateway::gateway::SqliteStore,
) -> Result<ditto_chat_gateway::gateway::GatewayBackends, Box<dyn std::error::Error>> {
    if config.store.redis_url.is_some() {
        return Err("redis store requires `--features gateway-store-redis`".into());
    }
    Ok(memory_backends(sqlite))
}

#[cfg(feature = "gateway")]
fn memory_backends(
    sqlite: ditto_chat_gateway::gateway::SqliteStore,
) -> ditto_chat_gateway::gateway::GatewayBackends {
    tracing::warn!("no redis configured; quota, token versions and chat fan-out stay in-process");
    ditto_chat_gateway::gateway::GatewayBackends {
        sqlite,
        quota: Arc::new(ditto_chat_gateway::gateway::MemoryQuotaStore::new()),
        token_versions: Arc::new(ditto_chat_gateway::gateway::MemoryTokenVersions::new()),
        broker: Arc::new(ditto_chat_gateway::gateway::MemoryBroker::new()),
    }
}

#[cfg(not(feature = "gateway"))]
fn main() {
    eprintln!("gateway feature disabled; rebuild with --features gateway");
}
