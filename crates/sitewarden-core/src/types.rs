use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SitewardenError;

/// Identifier of a monitored site.
///
/// Sites are owned by the surrounding application; the scheduler only
/// references them to bind jobs and to cascade deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub i64);

impl SiteId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SiteId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for SiteId {
    type Err = SitewardenError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().parse::<i64>() {
            Ok(id) if id > 0 => Ok(SiteId(id)),
            _ => Err(SitewardenError::InvalidSiteId(s.to_string())),
        }
    }
}
