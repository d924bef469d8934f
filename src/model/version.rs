//! Four-part schema version

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version of a persisted store's schema, ordered component by component
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub sub1: u32,
    pub sub2: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32, sub1: u32, sub2: u32) -> Self {
        SchemaVersion {
            major,
            minor,
            sub1,
            sub2,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.sub1, self.sub2)
    }
}

impl fmt::Debug for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaVersion({})", self)
    }
}

impl FromStr for SchemaVersion {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 4 {
            return Err(crate::Error::Config(format!(
                "Schema version must have four parts: {}",
                s
            )));
        }
        let mut values = [0u32; 4];
        for (slot, part) in values.iter_mut().zip(parts) {
            *slot = part
                .parse()
                .map_err(|_| crate::Error::Config(format!("Invalid version component: {}", part)))?;
        }
        Ok(SchemaVersion::new(values[0], values[1], values[2], values[3]))
    }
}
