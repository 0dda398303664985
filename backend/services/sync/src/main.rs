use std::sync::Arc;

use shopmirror_common::error::{MirrorError, MirrorResult};
use shopmirror_common::types::ResourceType;
use shopmirror_config::env::{parse_bool_or, parse_csv};
use shopmirror_config::{init_tracing, AppConfig};
use shopmirror_db::mirror::pg_repository::PgMirrorRepository;
use shopmirror_db::sync::pg_repository::PgProgressRepository;
use shopmirror_sync::shopify::{ShopifyClient, ShopifyClientConfig};
use shopmirror_sync::store::StoreUpserter;
use shopmirror_sync::{StartSyncOptions, SyncDeps, SyncOrchestrator, SyncSettings};

fn start_options() -> MirrorResult<StartSyncOptions> {
    let options = match parse_csv("SYNC_RESOURCES")? {
        Some(names) => {
            let resources = names
                .iter()
                .map(|name| name.parse::<ResourceType>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(MirrorError::Config)?;
            StartSyncOptions::new(resources)
        }
        None => StartSyncOptions::all(),
    };

    Ok(options
        .with_resync(parse_bool_or("SYNC_RESYNC", false)?)
        .with_transactions(parse_bool_or("SYNC_INCLUDE_TRANSACTIONS", false)?))
}

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env().expect("invalid configuration");
    init_tracing(&config.log_level);

    tracing::info!(service = "shopmirror-sync", "starting");

    let tenants = parse_csv("SYNC_TENANTS")
        .expect("invalid SYNC_TENANTS")
        .expect("SYNC_TENANTS must list at least one shop");
    let options = start_options().expect("invalid sync options");
    let settings = SyncSettings::from_env().expect("invalid sync settings");
    let shopify_config = ShopifyClientConfig::from_env()
        .expect("invalid shopify configuration")
        .expect("SHOPIFY_ACCESS_TOKEN must be set");

    let pool = shopmirror_db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");
    shopmirror_db::migrate(&pool)
        .await
        .expect("failed to apply migrations");

    let client = Arc::new(ShopifyClient::new(shopify_config).expect("failed to create shopify client"));
    let deps = SyncDeps {
        counter: client.clone(),
        pager: client,
        upserter: Arc::new(StoreUpserter::new(Arc::new(PgMirrorRepository::new(
            pool.clone(),
        )))),
        progress: Arc::new(PgProgressRepository::new(pool)),
    };
    let orchestrator = SyncOrchestrator::new(deps, settings);

    let mut started = Vec::new();
    for tenant in &tenants {
        match orchestrator.start_sync(tenant, options.clone()).await {
            Ok(sync) => {
                tracing::info!(
                    tenant = %tenant,
                    run_id = %sync.run.id,
                    outcome = ?sync.outcome,
                    "sync started"
                );
                started.push((tenant.clone(), sync.run.id));
            }
            Err(e) => tracing::error!(tenant = %tenant, error = %e, "failed to start sync"),
        }
    }

    let shutdown = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let cancelled = shutdown.cancel_all();
            tracing::info!(runs = cancelled, "interrupt received, cancelling syncs");
        }
    });

    for (tenant, run_id) in started {
        match orchestrator.wait_for_run(&tenant, run_id).await {
            Ok(run) => tracing::info!(
                tenant = %tenant,
                run_id = %run.id,
                state = run.state.as_str(),
                error = run.last_error.as_deref().unwrap_or_default(),
                "sync finished"
            ),
            Err(e) => tracing::error!(tenant = %tenant, run_id = %run_id, error = %e, "sync lost"),
        }
    }
}
