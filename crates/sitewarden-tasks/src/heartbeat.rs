//! `heartbeat`: proves the scheduler is being triggered.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sitewarden_scheduler::{Handler, HandlerResult, JobContext, SettingsStore, Status};

pub const HEARTBEAT_KEY: &str = "tasks.heartbeat";

pub struct Heartbeat {
    settings: SettingsStore,
}

impl Heartbeat {
    pub fn new(settings: SettingsStore) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Handler for Heartbeat {
    async fn run(&self, _ctx: &mut JobContext<'_>) -> HandlerResult {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.settings.set(HEARTBEAT_KEY, &now)?;
        Status::Ok.exit()
    }
}
