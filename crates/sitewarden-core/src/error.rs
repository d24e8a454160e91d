use thiserror::Error;

#[derive(Debug, Error)]
pub enum SitewardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid site id: {0}")]
    InvalidSiteId(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SitewardenError {
    /// Short error code string used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SitewardenError::Config(_) => "CONFIG_ERROR",
            SitewardenError::Database(_) => "DATABASE_ERROR",
            SitewardenError::InvalidSiteId(_) => "INVALID_SITE_ID",
            SitewardenError::Serialization(_) => "SERIALIZATION_ERROR",
            SitewardenError::Io(_) => "IO_ERROR",
            SitewardenError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SitewardenError>;
