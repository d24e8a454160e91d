use axum::{routing::get, Router};
use sitewarden_core::config::SitewardenConfig;
use sitewarden_scheduler::{
    db::Db, CronEvaluator, HandlerRegistry, JobStore, Runner, RunnerOptions, SettingsStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: SitewardenConfig,
    pub store: JobStore,
    pub settings: SettingsStore,
    pub registry: Arc<dyn HandlerRegistry>,
    /// Fired on Ctrl-C / SIGTERM; aborts running handlers with `TIMEOUT`.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: SitewardenConfig, db: Db, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let cron = CronEvaluator::from_timezone(&config.scheduler.timezone)?;
        let store = JobStore::new(db.clone(), cron);
        let settings = SettingsStore::new(db);
        let registry = Arc::new(sitewarden_tasks::default_registry(&config, settings.clone()));
        Ok(Self {
            config,
            store,
            settings,
            registry,
            shutdown,
        })
    }

    /// A fresh runner; each invocation takes its own lock identity.
    pub fn runner(&self) -> Runner {
        Runner::new(
            self.store.clone(),
            self.registry.clone(),
            Arc::new(self.settings.clone()),
            RunnerOptions::from_config(&self.config.scheduler),
        )
        .with_shutdown(self.shutdown.clone())
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/cron", get(crate::http::cron::cron_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
