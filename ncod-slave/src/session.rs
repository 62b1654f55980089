//! Registration state of this node towards the master
//!
//! `Unknown -> Registering -> Online -> Offline -> Registering -> ...`
//!
//! `Offline` means the link dropped and the master is expected to time this
//! node out; the session token is discarded with it.

use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    Registering,
    Online { token: String },
    Offline,
}

#[derive(Debug)]
pub struct NodeSession {
    state: SessionState,
    registrations: u32,
}

impl Default for NodeSession {
    fn default() -> Self {
        Self {
            state: SessionState::Unknown,
            registrations: 0,
        }
    }
}

impl NodeSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn token(&self) -> Option<&str> {
        match &self.state {
            SessionState::Online { token } => Some(token),
            _ => None,
        }
    }

    pub fn is_registering(&self) -> bool {
        self.state == SessionState::Registering
    }

    /// Link is up: a new session has to be negotiated
    pub fn link_up(&mut self) {
        self.state = SessionState::Registering;
    }

    pub fn link_down(&mut self) {
        if self.state != SessionState::Unknown {
            self.state = SessionState::Offline;
        }
    }

    /// Returns false when no registration was outstanding
    pub fn acknowledged(&mut self, token: String) -> bool {
        if self.state != SessionState::Registering {
            warn!("Ignoring register_ack outside of registration ({:?})", self.state);
            return false;
        }
        self.registrations += 1;
        info!(registrations = self.registrations, "Registered with master");
        self.state = SessionState::Online { token };
        true
    }

    /// Master no longer knows our session
    pub fn registration_required(&mut self) {
        if matches!(self.state, SessionState::Online { .. }) {
            warn!("Master dropped our session, registering again");
        }
        if self.state != SessionState::Unknown && self.state != SessionState::Offline {
            self.state = SessionState::Registering;
        }
    }
}
