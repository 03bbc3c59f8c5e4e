//! Identifiers for pipeline runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Time-ordered identifier of one pipeline run, displayed as `run_<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    const PREFIX: &'static str = "run_";

    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex digits, enough to tell runs apart in logs.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let uuid_str = s.strip_prefix(Self::PREFIX).unwrap_or(s);
        Ok(Self(Uuid::parse_str(uuid_str)?))
    }
}
