//! Web-triggered cron — GET /cron?key=…&loop=bool.
//!
//! For hosts without a system cron: an external pinger hits this URL and
//! the request runs the task runner for one time budget. Any outcome of the
//! run itself is reported in the body with 200; only a wrong key is refused.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct CronQuery {
    pub key: Option<String>,
    #[serde(default, rename = "loop")]
    pub loop_if_idle: bool,
}

pub async fn cron_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CronQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if let Some(expected) = state.config.webcron.key.as_deref() {
        if query.key.as_deref() != Some(expected) {
            warn!("web cron request with a wrong key");
            return Err((StatusCode::FORBIDDEN, Json(json!({"error": "invalid key"}))));
        }
    }

    info!(loop_if_idle = query.loop_if_idle, "web cron triggered");
    let budget = state.config.scheduler.time_budget();
    match state.runner().run(budget, query.loop_if_idle).await {
        Ok(summary) => Ok(Json(json!({"status": "ok", "summary": summary}))),
        Err(e) => {
            error!(error = %e, "web cron run failed");
            Ok(Json(json!({"status": "error", "error": e.to_string()})))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{build_router, AppState};
    use axum::body::Body;
    use axum::http::Request;
    use sitewarden_core::config::SitewardenConfig;
    use sitewarden_scheduler::{db, NewJob, Status};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn state(key: Option<&str>) -> Arc<AppState> {
        let mut config = SitewardenConfig::default();
        config.webcron.key = key.map(String::from);
        config.scheduler.lock_jitter_ms = 0;
        config.scheduler.safety_margin_secs = 0;
        let db = db::open_in_memory().unwrap();
        Arc::new(AppState::new(config, db, CancellationToken::new()).unwrap())
    }

    async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
        let res = build_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn wrong_key_is_forbidden() {
        let (status, body) = get(state(Some("s3cret")), "/cron?key=nope").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "invalid key");

        let (status, _) = get(state(Some("s3cret")), "/cron").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn matching_key_runs_due_jobs() {
        let state = state(Some("s3cret"));
        let job = state
            .store
            .create(&NewJob::system("heartbeat", "*/5 * * * *"))
            .unwrap();
        state
            .store
            .reschedule(job.id, chrono::Utc::now() - chrono::Duration::minutes(1))
            .unwrap();

        let (status, body) = get(state.clone(), "/cron?key=s3cret").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["summary"]["jobs_run"], 1);
        assert_eq!(body["summary"]["stop_reason"], "idle");
        assert_eq!(state.store.require(job.id).unwrap().last_exit_code, Status::Ok);
    }

    #[tokio::test]
    async fn failing_job_still_answers_200() {
        let state = state(None);
        let job = state
            .store
            .create(&NewJob::system("no_such_handler", "@daily"))
            .unwrap();
        state
            .store
            .reschedule(job.id, chrono::Utc::now() - chrono::Duration::minutes(1))
            .unwrap();

        let (status, body) = get(state, "/cron").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["by_status"]["no_routine"], 1);
    }

    #[tokio::test]
    async fn health_reports_pause_state() {
        use sitewarden_scheduler::PauseFlag;
        let state = state(None);
        state.settings.set_paused(true).unwrap();

        let (status, body) = get(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["paused"], true);
    }
}
