//! Identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the region every host starts with
pub const ROOT_REGION: &str = "root";

/// Numeric identity of an installed unit, assigned by the host runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub u64);

impl UnitId {
    /// The always-present system unit
    pub const SYSTEM: UnitId = UnitId(0);

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for UnitId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
