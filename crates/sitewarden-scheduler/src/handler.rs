//! The contract between the scheduler and the code that does the work.
//!
//! A [`Handler`] is looked up by the job's `type` through a
//! [`HandlerRegistry`]. It receives the job, its mutable `storage` and a
//! `resumed` flag, and returns an exit code. Multi-step work persists its
//! progress in `storage` and returns [`Status::WillResume`]; the next runner
//! invocation calls it again with that storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Span;

use crate::types::{Job, JobParams, Status, Storage};

/// `Ok(None)`: the handler returned nothing. `Ok(Some(code))`: an exit code,
/// normally [`Status::code`]. `Err`: an unhandled failure.
pub type HandlerResult = anyhow::Result<Option<i64>>;

impl Status {
    /// Return this status from a handler.
    pub fn exit(self) -> HandlerResult {
        Ok(Some(self.code()))
    }
}

/// Interactive progress output (e.g. a CLI run with `--verbose`).
pub trait OutputSink: Send + Sync {
    fn line(&self, text: &str);
}

/// Writes progress lines to stdout.
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn line(&self, text: &str) {
        println!("{text}");
    }
}

/// What a handler sees of the job it is running.
pub struct JobContext<'a> {
    pub job: &'a Job,
    /// Scratch space kept across resumed steps; cleared otherwise.
    pub storage: &'a mut Storage,
    /// True when this invocation continues a previous `WILL_RESUME`.
    pub resumed: bool,
    /// Span carrying `job_id`/`job_type`; enter it or use it as a parent.
    pub span: Span,
    pub output: Option<&'a dyn OutputSink>,
}

impl JobContext<'_> {
    pub fn params(&self) -> &JobParams {
        &self.job.params
    }

    /// Emit a progress line to the interactive sink, if any, and the log.
    pub fn progress(&self, text: &str) {
        tracing::debug!(parent: &self.span, "{text}");
        if let Some(out) = self.output {
            out.line(text);
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, ctx: &mut JobContext<'_>) -> HandlerResult;
}

/// Resolves job types to handlers.
pub trait HandlerRegistry: Send + Sync {
    fn resolve(&self, job_type: &str) -> Option<Arc<dyn Handler>>;
}

/// `HashMap`-backed registry.
#[derive(Default, Clone)]
pub struct MapRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl MapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl HandlerRegistry for MapRegistry {
    fn resolve(&self, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(job_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn run(&self, _ctx: &mut JobContext<'_>) -> HandlerResult {
            Status::Ok.exit()
        }
    }

    #[test]
    fn registry_resolves_registered_types_only() {
        let mut registry = MapRegistry::new();
        registry.register("noop", Noop);
        assert!(registry.resolve("noop").is_some());
        assert!(registry.resolve("nope").is_none());
        assert_eq!(registry.job_types().collect::<Vec<_>>(), vec!["noop"]);
    }

    #[test]
    fn exit_wraps_the_code() {
        assert_eq!(Status::WillResume.exit().unwrap(), Some(1));
    }
}
