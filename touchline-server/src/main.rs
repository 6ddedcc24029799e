//! Touchline Server
//!
//! Chat and ticketing backend for bookmakers, scouts and supervisors
//! working on live sports matches.

mod api;
mod config;
mod server;
mod shutdown;
mod state;

use api::extractors::TokenVerifier;
use clap::Parser;
use config::{ConfigLoader, Secrets};
use redis::aio::ConnectionManager;
use server::{build_router, run_server};
use shutdown::{shutdown_signal, spawn_config_reload_handler, wait_for_shutdown};
use sqlx::postgres::PgPoolOptions;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use touchline_core::bus::{
    AmqpBroker, AmqpConnection, BusPublisher, BusRoute, EventPublisher, ExchangeKind,
    ListenerArgs, MessageHandler, QueueListener,
};
use touchline_core::cache::{Cacher, InMemoryCache, SyncCache};
use touchline_core::config::ConfigStore;
use touchline_core::controllers::Messenger;
use touchline_core::counters::{CounterPublisher, RedisCounterStore, UnreadCounters};
use touchline_core::events::counter_update_channel;
use touchline_core::framework::DatabaseProcessor;
use touchline_core::presence::RedisPresence;
use touchline_core::processors::{
    MatchStateSynchronizer, PgMatchStore, ServiceUpdatesProcessor,
};
use touchline_core::provider::HttpSportsDataProvider;
use touchline_core::streaming::{
    ConnectionRegistry, Gateway, GatewayFanout, RedisSubscriber, SubscriptionManager,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Pause before a failed queue listener is restarted.
const LISTENER_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Touchline - chat and ticketing for live match operations
#[derive(Parser, Debug)]
#[command(name = "touchline-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./touchline.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "TOUCHLINE_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    tracing::info!("Starting touchline-server v{}", env!("CARGO_PKG_VERSION"));

    let config_loader = Arc::new(ConfigLoader::new(&args.config, args.listen));
    let config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    let secrets = Secrets::from_env().map_err(|e| {
        tracing::error!("{}", e);
        e
    })?;

    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(config.server.database_max_connections)
        .connect(&secrets.database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    tracing::info!("Connecting to redis...");
    let redis_client = redis::Client::open(secrets.redis_url.as_str())?;
    let redis = ConnectionManager::new(redis_client.clone()).await.map_err(|e| {
        tracing::error!("Failed to connect to redis: {}", e);
        e
    })?;

    tracing::info!("Connecting to message bus...");
    let amqp = Arc::new(AmqpConnection::new(
        secrets.amqp_url.clone(),
        config.bus.channel_pool_size,
    ));
    amqp.start().await.map_err(|e| {
        tracing::error!("Failed to connect to message bus: {}", e);
        e
    })?;
    let publisher: Arc<dyn EventPublisher> = Arc::new(BusPublisher::new(
        Arc::new(AmqpBroker::new(amqp.clone())),
        BusRoute::new(
            config.bus.service_updates_exchange.clone(),
            config.bus.service_updates_routing_key.clone(),
        ),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let db = DatabaseProcessor::new(db_pool.clone());
    let cache = Cacher::new(
        Arc::new(InMemoryCache::new(
            config.cache.max_entries,
            config.cache.max_value_size,
        )),
        Some(config.cache.default_ttl()),
    );
    let provider = Arc::new(HttpSportsDataProvider::new(
        config.provider.url()?,
        config.provider.timeout(),
    ));
    let match_store = Arc::new(PgMatchStore::new(db.clone()));

    let counter_store = Arc::new(RedisCounterStore::new(redis.clone()));
    let (counter_tx, counter_rx) = counter_update_channel(config.counters.queue_size);
    let counters = UnreadCounters::new(
        counter_store.clone(),
        Arc::new(db.clone()),
        config.counters.ttl(),
        counter_tx,
    );
    tasks.push(tokio::spawn(
        CounterPublisher::new(counter_store, counter_rx, shutdown_rx.clone()).run(),
    ));

    let sync_settings = ConfigStore::new(config.sync.clone());
    let synchronizer = Arc::new(MatchStateSynchronizer::new(
        sync_settings.clone(),
        Arc::new(SyncCache::new(
            config.cache.matches_max_entries,
            Some(config.cache.matches_ttl()),
        )),
        SyncCache::new(config.cache.max_entries, Some(config.cache.default_ttl())),
        match_store.clone(),
        provider.clone(),
        publisher.clone(),
    ));

    let presence = Arc::new(RedisPresence::new(redis));
    let messenger = Messenger {
        db: db.clone(),
        publisher: publisher.clone(),
        counters: counters.clone(),
        presence: presence.clone(),
        cache: cache.clone(),
        provider,
        sync: synchronizer.clone(),
        sync_settings: sync_settings.clone(),
    };

    let registry = ConnectionRegistry::new();
    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        SubscriptionManager::new(
            Arc::new(RedisSubscriber::new(redis_client)),
            registry.clone(),
        ),
        presence,
        publisher,
        config.gateway.presence_ttl(),
    ));

    tasks.push(spawn_listener(
        "match-state",
        amqp.clone(),
        ListenerArgs {
            exchange: config.bus.provider_exchange.clone(),
            exchange_kind: ExchangeKind::Direct,
            queue: config.bus.provider_queue.clone(),
            routing_key: config.bus.provider_routing_key.clone(),
            prefetch: config.bus.prefetch,
        },
        synchronizer,
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_listener(
        "service-updates",
        amqp.clone(),
        ListenerArgs {
            exchange: config.bus.service_updates_exchange.clone(),
            exchange_kind: ExchangeKind::Direct,
            queue: config.bus.service_updates_queue.clone(),
            routing_key: config.bus.service_updates_routing_key.clone(),
            prefetch: config.bus.prefetch,
        },
        Arc::new(ServiceUpdatesProcessor::new(
            Arc::new(db.clone()),
            match_store,
            counters,
            cache,
            config.bus.stale_update_limit(),
        )),
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_listener(
        "gateway-fanout",
        amqp.clone(),
        ListenerArgs {
            exchange: config.bus.service_updates_exchange.clone(),
            exchange_kind: ExchangeKind::Direct,
            queue: config.bus.gateway_queue.clone(),
            routing_key: config.bus.service_updates_routing_key.clone(),
            prefetch: config.bus.prefetch,
        },
        Arc::new(GatewayFanout::new(registry, Arc::new(db))),
        shutdown_rx.clone(),
    ));

    tasks.push(spawn_config_reload_handler(
        config_loader,
        sync_settings,
        shutdown_rx.clone(),
    ));

    let state = AppState {
        messenger,
        gateway: gateway.clone(),
        tokens: Arc::new(TokenVerifier::new(
            secrets.jwt_secret.as_bytes(),
            &config.auth.service_audiences,
        )),
        bus: amqp.clone(),
        shutdown_rx: shutdown_rx.clone(),
    };
    let router = build_router(state);

    let shutdown = {
        let gateway = gateway.clone();
        async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
            gateway.shutdown().await;
        }
    };

    tracing::info!("Starting HTTP server on {}", config.server.listen);
    let result = run_server(router, config.server.listen, shutdown).await;

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Background task failed: {}", e);
        }
    }

    amqp.close().await;
    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Run a queue listener until shutdown, restarting it after failures.
fn spawn_listener<H: MessageHandler>(
    name: &'static str,
    connection: Arc<AmqpConnection>,
    args: ListenerArgs,
    handler: Arc<H>,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = QueueListener::new(connection, args, handler);
        loop {
            match listener.run(shutdown_rx.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!(listener = name, error = %e, "Queue listener failed, restarting");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(LISTENER_RESTART_DELAY) => {}
                _ = wait_for_shutdown(shutdown_rx.clone()) => break,
            }
        }
        tracing::info!(listener = name, "Queue listener stopped");
    })
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,lapin=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
