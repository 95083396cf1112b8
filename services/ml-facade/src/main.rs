use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use facade_core::{
    wait_until_healthy, BrokerConnector, FacadeService, HttpScorer, NatsConnector,
    RedisThresholdStore, ScoringOrchestrator, ThresholdCache,
};
use ml_facade::{config::Config, database, handlers, middleware::RateLimiter, AppState, PgRecordSink};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    info!("Starting ML Facade...");

    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;
    info!(environment = %config.server.environment, "Configuration loaded successfully");

    // Record sink
    let pool = database::create_pool(&config.database)
        .await
        .context("database connection failed")?;
    database::health_check(&pool)
        .await
        .context("database not accessible")?;
    info!("Database health check passed");

    // Threshold and counter store
    let store = Arc::new(
        RedisThresholdStore::connect(&config.redis.url)
            .await
            .context("redis connection failed")?,
    );
    store.health_check().await.context("redis not accessible")?;

    // Remote scorer must be up before we accept work
    let scorer = Arc::new(HttpScorer::new(&config.scorer)?);
    wait_until_healthy(scorer.as_ref(), &config.scorer).await?;

    let cache = Arc::new(ThresholdCache::new(store.clone(), config.cache.ttl()));
    let sink = Arc::new(PgRecordSink::new(pool));
    let orchestrator = Arc::new(
        ScoringOrchestrator::new(scorer, cache, store, sink)
            .with_per_machine_metrics(config.metrics.per_machine_counters),
    );

    let connector: Option<Arc<dyn BrokerConnector>> = if config.broker.enabled {
        Some(Arc::new(NatsConnector::new(config.broker.clone())))
    } else {
        None
    };

    let facade = Arc::new(FacadeService::new(
        orchestrator,
        connector,
        &config.intake,
        &config.broker,
    ));
    facade.start();

    let state = web::Data::new(AppState::new(facade.clone(), config.server.environment.clone()));
    let limiter = RateLimiter::from_config(&config.limiter);
    let server_config = config.server.clone();

    info!(
        "Starting HTTP server on {}:{}",
        server_config.host, server_config.port
    );

    // SIGINT/SIGTERM stop the server gracefully; the queue path is drained after it returns
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(limiter.clone())
            .wrap(middleware::Logger::default())
            .configure(handlers::configure_routes)
    })
    .workers(server_config.workers)
    .client_request_timeout(server_config.read_timeout())
    .client_disconnect_timeout(server_config.write_timeout())
    .keep_alive(server_config.idle_timeout())
    .shutdown_timeout(config.shutdown.drain_timeout_seconds)
    .bind((server_config.host.as_str(), server_config.port))?
    .run()
    .await?;

    if !facade.shutdown(config.shutdown.drain_timeout()).await {
        warn!("Shutdown drain timed out, in-flight batches abandoned");
    }

    info!("ML Facade stopped");
    Ok(())
}
