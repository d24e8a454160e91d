//! `maxexec`: probes how long a single invocation survives on this host.
//!
//! Each step sleeps `step_secs` and adds it to `storage.elapsed`. The job
//! resumes until `limit_secs` has been accumulated, then stores the total
//! under [`MAXEXEC_RESULT_KEY`]. A step that is killed by the host or by the
//! executor's time budget ends the probe with `TIMEOUT`, so the last stored
//! value is the longest survived run.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sitewarden_scheduler::{Handler, HandlerResult, JobContext, SettingsStore, Status};
use tracing::info;

use crate::params::u64_param;

pub const MAXEXEC_RESULT_KEY: &str = "tasks.maxexec_secs";

pub struct MaxExec {
    settings: SettingsStore,
}

impl MaxExec {
    pub fn new(settings: SettingsStore) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Handler for MaxExec {
    async fn run(&self, ctx: &mut JobContext<'_>) -> HandlerResult {
        let step = u64_param(ctx.params(), "step_secs", 1)?.max(1);
        let limit = u64_param(ctx.params(), "limit_secs", 10)?;

        tokio::time::sleep(Duration::from_secs(step)).await;

        let elapsed = ctx.storage.get("elapsed").and_then(|v| v.as_u64()).unwrap_or(0) + step;
        ctx.storage.insert("elapsed".to_string(), json!(elapsed));
        self.settings.set(MAXEXEC_RESULT_KEY, &elapsed.to_string())?;
        ctx.progress(&format!("survived {elapsed}s of {limit}s"));

        if elapsed < limit {
            return Status::WillResume.exit();
        }
        info!(parent: &ctx.span, elapsed_secs = elapsed, "max execution probe complete");
        Status::Ok.exit()
    }
}
