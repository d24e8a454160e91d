use sitewarden_scheduler::SchedulerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// A job parameter has the wrong type or an unusable value.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
