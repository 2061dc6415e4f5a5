//! Session lifecycle states and diagnostics

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle of one publish.
///
/// `Idle -> Negotiating -> Connected -> Closing -> Closed`, with `Failed`
/// reachable from `Negotiating` and `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No peer connection exists.
    Idle,
    /// Offer created and sent, waiting for the answer and ICE.
    Negotiating,
    /// Answer applied and ICE reports a usable path.
    Connected,
    /// Teardown signaling in flight.
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, to),
            (Idle | Closed | Failed, Negotiating)
                | (Negotiating, Connected)
                | (Negotiating | Connected, Failed)
                | (Negotiating | Connected | Failed, Closing)
                | (Closing, Closed)
        )
    }

    /// A session in this state owns a peer connection or a server resource.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Negotiating | SessionState::Connected | SessionState::Closing
        )
    }

    /// `publish` may start a new session from this state.
    pub fn accepts_publish(self) -> bool {
        self.can_transition_to(SessionState::Negotiating)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of a session for diagnostic inspection.
///
/// Stays readable after the session reached `Closed` or `Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub state: SessionState,
    pub target_url: String,
    pub resource_url: Option<String>,
    /// Offer as it was POSTed.
    pub local_sdp: Option<String>,
    pub remote_sdp: Option<String>,
    pub trickle: bool,
    pub candidates_sent: usize,
    pub connected_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl SessionInfo {
    pub(crate) fn idle(target_url: &str) -> SessionInfo {
        SessionInfo {
            state: SessionState::Idle,
            target_url: target_url.to_string(),
            resource_url: None,
            local_sdp: None,
            remote_sdp: None,
            trickle: false,
            candidates_sent: 0,
            connected_at: None,
            failure: None,
        }
    }

    /// Resets the snapshot for a new publish attempt.
    pub(crate) fn restart(&mut self, trickle: bool) {
        *self = SessionInfo {
            state: SessionState::Negotiating,
            trickle,
            ..SessionInfo::idle(&self.target_url)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn connected_is_reached_only_from_negotiating() {
        for from in [Idle, Connected, Closing, Closed, Failed] {
            assert!(!from.can_transition_to(Connected), "{from} -> connected");
        }
        assert!(Negotiating.can_transition_to(Connected));
    }

    #[test]
    fn publish_is_rejected_while_a_session_is_open() {
        assert!(Idle.accepts_publish());
        assert!(Closed.accepts_publish());
        assert!(Failed.accepts_publish());
        assert!(!Negotiating.accepts_publish());
        assert!(!Connected.accepts_publish());
        assert!(!Closing.accepts_publish());
    }

    #[test]
    fn restart_clears_previous_attempt() {
        let mut info = super::SessionInfo::idle("http://localhost/whip");
        info.state = Failed;
        info.failure = Some("boom".into());
        info.candidates_sent = 3;
        info.local_sdp = Some("v=0".into());

        info.restart(true);
        assert_eq!(info.state, Negotiating);
        assert!(info.trickle);
        assert_eq!(info.candidates_sent, 0);
        assert!(info.failure.is_none());
        assert!(info.local_sdp.is_none());
        assert_eq!(info.target_url, "http://localhost/whip");
    }

    #[test]
    fn failed_only_from_live_states() {
        assert!(Negotiating.can_transition_to(Failed));
        assert!(Connected.can_transition_to(Failed));
        assert!(!Closing.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Failed));
    }
}
