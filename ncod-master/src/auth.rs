use ncod_protocol::{NodeId, RegisterPayload};
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("node {0} is not in the allow list")]
    NotAllowed(NodeId),
}

pub trait NodeAuthenticator: Send + Sync {
    fn authenticate(&self, node_id: &NodeId, registration: &RegisterPayload) -> Result<(), AuthError>;
}

/// Accepts every valid node id unless a list is configured
#[derive(Debug, Default)]
pub struct AllowList {
    allowed: Option<HashSet<NodeId>>,
}

impl AllowList {
    pub fn open() -> Self {
        Self::default()
    }

    /// Unparsable entries are skipped with a warning
    pub fn from_config(entries: &[String]) -> Self {
        if entries.is_empty() {
            return Self::open();
        }
        let allowed = entries
            .iter()
            .filter_map(|raw| match NodeId::parse(raw) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!("Ignoring allow list entry {raw:?}: {e}");
                    None
                }
            })
            .collect();
        Self { allowed: Some(allowed) }
    }
}

impl NodeAuthenticator for AllowList {
    fn authenticate(&self, node_id: &NodeId, _registration: &RegisterPayload) -> Result<(), AuthError> {
        match &self.allowed {
            Some(allowed) if !allowed.contains(node_id) => Err(AuthError::NotAllowed(node_id.clone())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> RegisterPayload {
        RegisterPayload {
            hostname: "bench".into(),
            address: "10.0.0.7".into(),
            port: 7575,
            metadata: Default::default(),
            version: "0.1.0".into(),
        }
    }

    #[test]
    fn test_open_list_accepts_everyone() {
        let id = NodeId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        assert!(AllowList::from_config(&[]).authenticate(&id, &registration()).is_ok());
    }

    #[test]
    fn test_configured_list_is_normalized() {
        let list = AllowList::from_config(&["AA-BB-CC-DD-EE-FF".to_string(), "garbage".to_string()]);
        let allowed = NodeId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let other = NodeId::parse("02:00:00:00:00:01").unwrap();

        assert!(list.authenticate(&allowed, &registration()).is_ok());
        assert_eq!(
            list.authenticate(&other, &registration()),
            Err(AuthError::NotAllowed(other.clone()))
        );
    }

    #[test]
    fn test_all_invalid_entries_deny_everyone() {
        let list = AllowList::from_config(&["garbage".to_string()]);
        let id = NodeId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        assert!(list.authenticate(&id, &registration()).is_err());
    }
}
