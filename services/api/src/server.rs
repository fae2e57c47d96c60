use crate::cli::{ServeArgs, SweepArgs};
use crate::infra::{document_storage, open_store, stripe_gateway, AppState, ConfiguredStore};
use crate::routes::with_admissions_routes;
use admissions::config::AppConfig;
use admissions::error::AppError;
use admissions::telemetry;
use admissions::workflows::admissions::store::run_blocking;
use admissions::workflows::admissions::{
    AdmissionsService, AdmissionsStore, PaymentGateway, RetentionSweeper, SandboxGateway,
    SystemClock,
};
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    match open_store(&config)? {
        ConfiguredStore::Memory(store) => with_gateway(config, store).await,
        ConfiguredStore::Sqlite(store) => with_gateway(config, store).await,
    }
}

async fn with_gateway<S>(config: AppConfig, store: Arc<S>) -> Result<(), AppError>
where
    S: AdmissionsStore + 'static,
{
    match stripe_gateway(&config)? {
        Some(gateway) => serve(config, store, gateway).await,
        None => {
            warn!("PAYMENT_API_KEY is unset; checkout uses the in-process sandbox gateway");
            serve(config, store, Arc::new(SandboxGateway::new())).await
        }
    }
}

async fn serve<S, G>(config: AppConfig, store: Arc<S>, gateway: Arc<G>) -> Result<(), AppError>
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
{
    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let service = Arc::new(AdmissionsService::new(
        store,
        gateway,
        document_storage(&config),
        Arc::new(SystemClock),
        config.admissions_settings(),
    ));
    let retention = service.retention.settings();
    let sweeper = Arc::clone(&service.retention).spawn();

    let app = with_admissions_routes(service)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        grace_period_days = retention.grace_period_days,
        sweep_interval_secs = retention.sweep_interval.as_secs(),
        "admissions orchestrator ready"
    );

    let served = axum::serve(listener, app).await;
    sweeper.abort();
    served?;
    Ok(())
}

/// One-off retention sweep for cron-style deployments.
pub(crate) async fn sweep_once(args: SweepArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    match open_store(&config)? {
        ConfiguredStore::Memory(store) => sweep_store(&config, store, args).await,
        ConfiguredStore::Sqlite(store) => sweep_store(&config, store, args).await,
    }
}

async fn sweep_store<S>(config: &AppConfig, store: Arc<S>, args: SweepArgs) -> Result<(), AppError>
where
    S: AdmissionsStore + 'static,
{
    let sweeper = RetentionSweeper::new(
        store,
        document_storage(config),
        Arc::new(SystemClock),
        config.retention,
    );
    let grace_days = args
        .grace_days
        .unwrap_or(config.retention.grace_period_days);

    let report = run_blocking(move || sweeper.sweep_with_grace(grace_days)).await?;

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => println!("sweep report unavailable: {err}"),
    }
    Ok(())
}
