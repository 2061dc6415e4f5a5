//! Events propagated from a peer connection to its session
//!
//! The peer driver runs in its own task. Everything the session needs to know
//! about it arrives as a [`PeerEvent`] on one ordered channel.

use std::fmt;

use tokio::sync::mpsc;

/// Receiving end of a peer connection's event channel.
pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// Sending end of a peer connection's event channel.
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate was found after the offer was created, so it is not
    /// part of the offer and must be trickled. Carries the SDP attribute value
    /// (`candidate:...`).
    LocalCandidate(String),

    /// No further local candidates will be produced.
    GatheringComplete,

    /// The transport changed connection state.
    StateChange(ConnectionState),
}

/// Connection state as reported by the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// The transport has a usable path.
    pub fn is_usable(self) -> bool {
        self == ConnectionState::Connected
    }

    /// The transport lost its path and will not recover on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
