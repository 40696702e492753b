//! Rota Pool - Entry Point
//!
//! Starts the store, the background roles, the dispatcher and the API with
//! graceful shutdown support.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rota_pool::api::ApiServer;
use rota_pool::config::{Config, LogConfig, StoreBackend};
use rota_pool::database::Database;
use rota_pool::error::Result;
use rota_pool::proxy::ProxyServer;
use rota_pool::services::{ExpirySweeper, ExpirySweeperConfig, ExpirySweeperHandle, Scheduler};
use rota_pool::sources::{registry, AdmissionFilter, Crawler, GeoLookup, MaxMindGeo, UnresolvedGeo};
use rota_pool::store::{MemoryStore, PgStore, ProxyStore, StoreConfig};
use rota_pool::validator::{
    HttpProber, Prober, Validator, ValidatorConfig, ValidatorHandle, ValidatorKind,
};

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_pool={},tower_http=debug", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("pretty") {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

async fn open_store(config: &Config) -> Result<Arc<dyn ProxyStore>> {
    let store_config = StoreConfig::new(config.store.prefix.clone(), config.store.ttl_seconds);

    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new(store_config)))
        }
        StoreBackend::Postgres => {
            let db = Database::connect(&config.database).await?;
            let stats = db.pool_stats();
            info!(size = stats.size, idle = stats.idle, "Connected to database");

            db.run_migrations().await?;
            info!("Database migrations complete");

            Ok(Arc::new(PgStore::new(&db, store_config)))
        }
    }
}

fn open_geo(config: &Config) -> Result<Arc<dyn GeoLookup>> {
    match &config.admission.geoip_db_path {
        Some(path) => {
            let geo = MaxMindGeo::from_path(path)?;
            info!(path = %path, "Loaded geo-IP database");
            Ok(Arc::new(geo))
        }
        None => {
            warn!("GEOIP_DB_PATH not set, every candidate resolves to country 'unknown'");
            Ok(Arc::new(UnresolvedGeo))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Rota Pool");

    let store = open_store(&config).await?;
    let fresh_wakeup = Arc::new(Notify::new());

    // Create shutdown channels
    let (shutdown_tx, _) = watch::channel(false);
    let (validator_handle, validator_shutdown) = ValidatorHandle::new();
    let (sweeper_handle, sweeper_shutdown) = ExpirySweeperHandle::new();
    let mut tasks = Vec::new();

    if config.roles.manager {
        let admission = AdmissionFilter::new(
            open_geo(&config)?,
            &config.admission.home_country,
            config.admission.restrict_to_home_country,
        );
        let crawler = Crawler::new(
            store.clone(),
            admission,
            fresh_wakeup.clone(),
            Duration::from_secs(config.crawler.timeout),
        )?;

        let mut scheduler = Scheduler::new(crawler);
        scheduler.register_all(registry());

        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(scheduler.run(shutdown)));
    }

    if config.roles.worker {
        let settings = &config.validator;
        let prober: Arc<dyn Prober> = Arc::new(HttpProber::new(
            &settings.check_url,
            &settings.https_check_url,
            Duration::from_secs(settings.timeout),
        ));

        let fresh = Validator::new(
            ValidatorKind::Fresh,
            store.clone(),
            prober.clone(),
            ValidatorConfig::fresh(settings),
        )
        .with_wakeup(fresh_wakeup.clone());
        let periodic = Validator::new(
            ValidatorKind::Periodic,
            store.clone(),
            prober,
            ValidatorConfig::periodic(settings),
        );

        for validator in [fresh, periodic] {
            let shutdown = validator_shutdown.clone();
            tasks.push(tokio::spawn(async move { validator.run(shutdown).await }));
        }
    }

    // Start expiry sweeper
    let sweeper = ExpirySweeper::new(
        store.clone(),
        ExpirySweeperConfig {
            check_interval: config.sweep_interval,
        },
    );
    tasks.push(tokio::spawn(async move { sweeper.run(sweeper_shutdown).await }));

    // Start servers
    let proxy_server = ProxyServer::new(config.proxy.clone(), store.clone())?;
    let proxy_shutdown = shutdown_tx.subscribe();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = proxy_server.run(proxy_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    }));

    let api_server = ApiServer::new(config.api.clone(), config.roles, store.clone());
    let api_shutdown = shutdown_tx.subscribe();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    }));

    info!(
        manager = config.roles.manager,
        worker = config.roles.worker,
        "Servers started - Proxy: {}, API: {}",
        config.proxy_addr(),
        config.api_addr()
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    validator_handle.shutdown();
    sweeper_handle.shutdown();
    for task in futures::future::join_all(tasks).await {
        if let Err(e) = task {
            error!("Task panicked during shutdown: {}", e);
        }
    }

    info!("Rota Pool stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
