//! `sitewarden-core` — configuration, shared identifiers and the base error
//! type used by every other sitewarden crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::SitewardenConfig;
pub use error::{Result, SitewardenError};
pub use types::SiteId;
