use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use folio::cache::{
    ByteCache, CdnCache, CdnConfig, LayeredCache, MemoryCache, PostgresCache, author_key, book_key,
    work_key,
};
use folio::config::{self, Settings};
use folio::controller::{CachePersister, Controller, ControllerConfig};
use folio::domain::AuthorResource;
use folio::infra::{InfraError, http, telemetry};
use folio::upstream::{BatchConfig, BatchedClient, Throttle, UpstreamGetter, UpstreamTransport};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        error!(error = %error, "application error");
        process::exit(1);
    }
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Some(config::Command::Bust(args)) => run_bust(settings, args.author_id).await,
        _ => run_serve(settings).await,
    }
}

async fn build_cache(settings: &Settings) -> Result<(Arc<LayeredCache>, Arc<PostgresCache>), InfraError> {
    let pool = PostgresCache::connect(
        &settings.database.dsn(),
        settings.database.max_connections.get(),
    )
    .await
    .map_err(|err| InfraError::database(err.to_string()))?;

    info!("ensuring database schema");
    PostgresCache::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    let postgres = Arc::new(PostgresCache::new(pool));

    // The memory tier gets half the process's cache budget; the other half
    // covers transient per-request allocations.
    let budget = config::memory_budget_bytes(settings.cache.memory_ratio);
    let memory = Arc::new(MemoryCache::new((budget / 2) as usize));

    let mut tiers: Vec<Arc<dyn ByteCache>> = vec![memory, postgres.clone()];
    if let Some(cdn) = settings.cdn.as_ref() {
        info!(domain = %cdn.domain, "CDN busting enabled");
        tiers.push(Arc::new(CdnCache::new(CdnConfig {
            token: cdn.token.clone(),
            zone_id: cdn.zone_id.clone(),
            domain: cdn.domain.clone(),
        })));
    }

    Ok((Arc::new(LayeredCache::new(tiers)), postgres))
}

fn build_controller(
    settings: &Settings,
    cache: Arc<LayeredCache>,
    postgres: Arc<PostgresCache>,
) -> Result<(Controller, Arc<BatchedClient>), InfraError> {
    let throttle = Arc::new(Throttle::per_minute(
        settings.upstream.requests_per_minute.get(),
    ));
    let transport = Arc::new(
        UpstreamTransport::new(
            settings.upstream.host.clone(),
            throttle,
            settings.upstream.cookie.as_deref(),
            settings.upstream.proxy.as_deref(),
        )
        .map_err(|err| InfraError::configuration(err.to_string()))?,
    );

    let batch = BatchedClient::new(
        settings.upstream.graphql_url.clone(),
        Arc::clone(&transport),
        BatchConfig {
            every: settings.batch.every,
            batch_size: settings.batch.size,
        },
    );

    let getter = Arc::new(UpstreamGetter::new(
        Arc::clone(&cache),
        Arc::clone(&batch),
        transport,
    ));
    let persister = Arc::new(CachePersister::new(Arc::clone(&cache), postgres));

    let controller = Controller::new(
        cache,
        getter,
        persister,
        ControllerConfig {
            unknown_authors: settings.unknown_authors.clone(),
            ..ControllerConfig::default()
        },
    );

    Ok((controller, batch))
}

async fn run_serve(settings: Settings) -> Result<(), InfraError> {
    let (cache, postgres) = build_cache(&settings).await?;
    let cache_stats = cache.spawn_stats_logger();

    let (controller, batch) = build_controller(&settings, Arc::clone(&cache), postgres)?;

    // The denormalization loop: a single consumer serializes parent writes.
    let denorm = controller.clone();
    let denorm_wait = settings.cache.denorm_wait;
    let denorm_handle = tokio::spawn(async move {
        denorm.run(denorm_wait).await;
    });

    let router = http::build_router(http::HttpState {
        controller,
        batch: Some(batch),
    });

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(addr = %settings.server.addr, "listening");

    let result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(InfraError::from);

    denorm_handle.abort();
    let _ = denorm_handle.await;
    cache_stats.abort();
    let _ = cache_stats.await;

    result
}

/// Expire an author and everything it contains, from the CLI.
async fn run_bust(settings: Settings, author_id: i64) -> Result<(), InfraError> {
    let (cache, _postgres) = build_cache(&settings).await?;

    let Some(bytes) = cache.get(&author_key(author_id)).await else {
        info!(author_id, "author not cached; nothing to bust");
        return Ok(());
    };

    let author: AuthorResource = serde_json::from_slice(&bytes)
        .map_err(|err| InfraError::configuration(format!("cached author is unreadable: {err}")))?;

    let mut expired = 0_usize;
    for work in &author.works {
        for book in &work.books {
            if cache.expire(&book_key(book.foreign_id)).await.is_ok() {
                expired += 1;
            }
        }
        if cache.expire(&work_key(work.foreign_id)).await.is_ok() {
            expired += 1;
        }
    }
    if cache.expire(&author_key(author_id)).await.is_ok() {
        expired += 1;
    }

    info!(author_id, expired, "busted author");
    Ok(())
}
