use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use productsnap_generation::{
    FsResultPersister, GenerationAdapter, Generator, HttpGenerator, HttpGeneratorConfig,
    InMemoryResultPersister, ResultPersister, ScriptedGenerator,
};
use productsnap_infra::AdmissionGate;
use productsnap_infra::admission::{InMemoryPlanDirectory, PlanDirectory};
use productsnap_infra::dispatch::{DispatchQueue, InMemoryDispatchQueue, PostgresDispatchQueue};
use productsnap_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use productsnap_infra::quota::{InMemoryQuotaLedger, PostgresQuotaLedger, QuotaLedger};
use productsnap_infra::workers::{WorkerDeps, WorkerPool};
use productsnap_worker::{ProviderKind, ServiceConfig};

struct Stores {
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn QuotaLedger>,
    queue: Arc<dyn DispatchQueue>,
}

async fn build_stores(config: &ServiceConfig) -> anyhow::Result<Stores> {
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; using in-memory stores");
        return Ok(Stores {
            jobs: Arc::new(InMemoryJobStore::new()),
            ledger: Arc::new(InMemoryQuotaLedger::new()),
            queue: Arc::new(InMemoryDispatchQueue::new(config.queue_config())),
        });
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.worker_count as u32 * 2 + 4)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    productsnap_infra::migrate(&pool)
        .await
        .context("failed to apply schema")?;

    Ok(Stores {
        jobs: Arc::new(PostgresJobStore::new(pool.clone())),
        ledger: Arc::new(PostgresQuotaLedger::new(pool.clone())),
        queue: Arc::new(PostgresDispatchQueue::new(pool, config.queue_config())),
    })
}

fn build_generator(config: &ServiceConfig) -> anyhow::Result<Arc<dyn GenerationAdapter>> {
    let generator = match config.provider {
        ProviderKind::Http => {
            let mut http = HttpGeneratorConfig::default();
            if let Some(url) = &config.generation_api_url {
                http.base_url = url.clone();
            }
            http.api_key = config.generation_api_key.clone().unwrap_or_default();
            Generator::from(HttpGenerator::new(http).context("failed to build HTTP client")?)
        }
        ProviderKind::Stub => Generator::from(ScriptedGenerator::default()),
    };
    Ok(Arc::new(generator))
}

fn build_persister(config: &ServiceConfig) -> Arc<dyn ResultPersister> {
    match &config.results_dir {
        Some(root) => {
            tracing::info!(root = %root.display(), "storing results on the filesystem");
            Arc::new(FsResultPersister::new(root.clone()))
        }
        None => {
            tracing::warn!("RESULTS_DIR not set; stub results are kept in memory");
            Arc::new(InMemoryResultPersister::new())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("invalid configuration")?;
    productsnap_observability::tracing::init(config.log_format);

    let stores = build_stores(&config).await?;
    let plans: Arc<dyn PlanDirectory> =
        Arc::new(InMemoryPlanDirectory::new(config.plan_limits.clone()));
    let gate = Arc::new(
        AdmissionGate::new(
            stores.jobs.clone(),
            stores.ledger.clone(),
            stores.queue.clone(),
            plans,
        )
        .with_max_attempts(config.max_attempts),
    );

    let generator = build_generator(&config)?;
    let persister = build_persister(&config);

    let handle = WorkerPool::spawn(
        config.pool_config(),
        WorkerDeps {
            store: stores.jobs,
            queue: stores.queue,
            generator,
            persister,
            gate,
        },
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, draining in-flight jobs");

    let stats = handle.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        completed = stats.completed,
        failed = stats.failed,
        retried = stats.retried,
        cancelled = stats.cancelled,
        "worker pool stopped"
    );
    Ok(())
}
