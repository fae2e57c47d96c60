use admissions::config::AppConfig;
use admissions::error::AppError;
use admissions::workflows::admissions::{
    AdmissionsError, LocalDocumentStorage, MemoryStore, SqliteStore, StripeGateway,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Store selected by configuration.
pub(crate) enum ConfiguredStore {
    Memory(Arc<MemoryStore>),
    Sqlite(Arc<SqliteStore>),
}

pub(crate) fn open_store(config: &AppConfig) -> Result<ConfiguredStore, AppError> {
    match &config.storage.database_path {
        Some(path) => {
            let store = SqliteStore::open(path)?;
            info!(path = %path.display(), "using sqlite store");
            Ok(ConfiguredStore::Sqlite(Arc::new(store)))
        }
        None => {
            warn!("ADMISSIONS_DATABASE_PATH is unset; records live in memory only");
            Ok(ConfiguredStore::Memory(Arc::new(MemoryStore::new())))
        }
    }
}

pub(crate) fn document_storage(config: &AppConfig) -> Arc<LocalDocumentStorage> {
    Arc::new(LocalDocumentStorage::new(&config.storage.document_root))
}

/// The live gateway, when credentials are configured.
pub(crate) fn stripe_gateway(config: &AppConfig) -> Result<Option<Arc<StripeGateway>>, AppError> {
    match config.payments.stripe() {
        Some(stripe) => {
            let gateway = StripeGateway::new(stripe).map_err(AdmissionsError::from)?;
            Ok(Some(Arc::new(gateway)))
        }
        None => Ok(None),
    }
}
