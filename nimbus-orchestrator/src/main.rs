use std::sync::Arc;

use nimbus_orchestrator::config::{ProviderKind, Settings, StoreBackend};
use nimbus_orchestrator::store::{MemoryStore, PgStore, RedisStore, StateStore};
use nimbus_orchestrator::{autoscaler_job, routes, ControlPlane};
use nimbus_providers::monitoring::HttpMetricSource;
use nimbus_providers::spider::SpiderClient;
use nimbus_providers::ssh::SshCommandRunner;
use nimbus_providers::{CloudAdapter, CommandRunner, MetricSource};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env().expect("invalid configuration");

    let store: Arc<dyn StateStore> = match &settings.store {
        StoreBackend::Memory => {
            tracing::warn!("⚠️ Using the in-memory state store; nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .expect("Failed to connect to Redis"),
        ),
        StoreBackend::Postgres(url) => Arc::new(
            PgStore::connect(url)
                .await
                .expect("Failed to connect to Postgres"),
        ),
    };
    tracing::info!("✅ State store ready ({})", store_name(&settings.store));

    let cloud = cloud_adapter(&settings);
    let metrics: Arc<dyn MetricSource> = Arc::new(
        HttpMetricSource::new(&settings.monitoring_url, settings.monitoring_timeout)
            .expect("Failed to build monitoring client"),
    );
    let commands: Arc<dyn CommandRunner> = Arc::new(SshCommandRunner::new(
        settings.ssh_key_file.clone(),
        settings.ssh_timeout,
    ));

    let cp = ControlPlane::new(store, cloud, metrics, commands).with_tuning(settings.tuning.clone());

    // job-autoscaler (AutoPolicy state machine)
    let cp_autoscaler = cp.clone();
    let every = settings.autoscaler_interval;
    tokio::spawn(async move {
        autoscaler_job::run(cp_autoscaler, every).await;
    });

    let app = routes::router(cp);
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .expect("Failed to bind");
    tracing::info!("🚀 Nimbus control plane listening on {}", settings.bind_addr);
    axum::serve(listener, app).await.expect("server error");
}

fn store_name(store: &StoreBackend) -> &'static str {
    match store {
        StoreBackend::Memory => "memory",
        StoreBackend::Redis(_) => "redis",
        StoreBackend::Postgres(_) => "postgres",
    }
}

fn cloud_adapter(settings: &Settings) -> Arc<dyn CloudAdapter> {
    match settings.provider {
        ProviderKind::Spider => Arc::new(
            SpiderClient::new(&settings.spider_url, settings.spider_timeouts)
                .expect("Failed to build cloud adapter client"),
        ),
        #[cfg(feature = "provider-mock")]
        ProviderKind::Mock => {
            tracing::warn!("⚠️ PROVIDER=mock: VMs are simulated in memory");
            Arc::new(nimbus_providers::mock::MockCloudAdapter::new())
        }
        #[cfg(not(feature = "provider-mock"))]
        ProviderKind::Mock => {
            panic!("PROVIDER=mock requires the provider-mock feature")
        }
    }
}
