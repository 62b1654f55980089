//! Node identity
//!
//! A node is keyed by its primary network hardware address, normalized to six
//! lowercase hex pairs separated by `:`. The key survives hostname and IP
//! churn, which is why the master never keys nodes by address.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("no usable network hardware address found")]
    NoHardwareAddress,
    #[error("malformed hardware address: {0:?}")]
    Malformed(String),
    #[error("all-zero hardware address is not a valid node identity")]
    AllZero,
    #[error("broadcast hardware address is not a valid node identity")]
    Broadcast,
}

/// Normalized node identifier (`aa:bb:cc:dd:ee:ff`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Normalize a raw hardware address: `-` separators become `:`, hex digits
    /// are lowercased, degenerate values are rejected.
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let normalized = raw.trim().replace('-', ":").to_ascii_lowercase();

        let groups: Vec<&str> = normalized.split(':').collect();
        let well_formed = groups.len() == 6
            && groups
                .iter()
                .all(|g| g.len() == 2 && g.bytes().all(|b| b.is_ascii_hexdigit()));
        if !well_formed {
            return Err(IdentityError::Malformed(raw.to_string()));
        }

        match normalized.as_str() {
            "00:00:00:00:00:00" => Err(IdentityError::AllZero),
            "ff:ff:ff:ff:ff:ff" => Err(IdentityError::Broadcast),
            _ => Ok(NodeId(normalized)),
        }
    }

    pub fn from_bytes(bytes: [u8; 6]) -> Result<Self, IdentityError> {
        let raw = bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        Self::parse(&raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}
