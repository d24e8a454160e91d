//! Typed access to job `params`.

use serde_json::Value;
use sitewarden_scheduler::JobParams;

use crate::error::{Result, TaskError};

/// A non-negative integer parameter, `default` when absent or null.
pub(crate) fn u64_param(params: &JobParams, name: &str, default: u64) -> Result<u64> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| TaskError::InvalidParam {
            name: name.to_string(),
            reason: format!("expected a non-negative integer, got {v}"),
        }),
    }
}

pub(crate) fn str_param<'a>(params: &'a JobParams, name: &str) -> Result<Option<&'a str>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(v) => Err(TaskError::InvalidParam {
            name: name.to_string(),
            reason: format!("expected a string, got {v}"),
        }),
    }
}
