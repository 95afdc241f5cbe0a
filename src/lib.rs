pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod event_store;
pub mod handlers;
pub mod ingestion;
pub mod migrations;
pub mod models;
pub mod oltp_store;
pub mod rate_limit;
pub mod reconstruction;
pub mod scrubbing;
pub mod signal_generator;
pub mod supervisor;
pub mod validation;

use std::sync::Arc;

use clickhouse::Client;

use config::WideConfig;
use dispatcher::Dispatcher;
use event_store::EventStore;
use oltp_store::OltpStore;
use supervisor::TaskSupervisor;

/// Shared collaborators for the HTTP process (§5 "constructor injection, not globals").
/// The worker binary builds its own, smaller `WorkerState` instead of reusing this one —
/// it has no HTTP surface and no ingestion-side config.
#[derive(Clone)]
pub struct AppState {
    pub ch: Client,
    pub event_store: Arc<EventStore>,
    pub oltp: Arc<OltpStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub supervisor: Arc<TaskSupervisor>,
    pub config: Arc<WideConfig>,
    pub credential_secret: Arc<String>,
    /// Used only by `/health/detailed`'s round trip; the worker owns the client that actually
    /// submits analysis jobs (§4.5 "own HTTP client").
    pub analysis_service_url: Option<Arc<String>>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn ingestion_deps(&self) -> ingestion::IngestionDeps {
        ingestion::IngestionDeps {
            event_store: self.event_store.clone(),
            oltp: self.oltp.clone(),
            dispatcher: self.dispatcher.clone(),
            ingestion_cfg: self.config.ingestion.clone(),
            rate_limit_cfg: self.config.rate_limit.clone(),
            quota_cfg: self.config.quota.clone(),
            scrubbing_cfg: self.config.scrubbing.clone(),
            supervisor: self.supervisor.clone(),
        }
    }
}
