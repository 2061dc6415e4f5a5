//! Peer connection seam
//!
//! The session drives a peer connection through [`PeerConnection`] and learns
//! about candidates and connectivity from the [`PeerEvents`] channel returned
//! by [`PeerFactory::create`]. [`Str0mPeerFactory`] is the production
//! implementation.

mod gather;
mod rtc;

use std::{sync::Arc, time::Duration};

use crate::config::IceServer;
use crate::model::{
    event::PeerEvents,
    tracks::{CodecConfig, LocalTrack},
};

pub use rtc::{Str0mPeer, Str0mPeerFactory};

/// Errors that can occur during peer connection operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// No interface to bind the media socket to
    #[error("found no routable IPv4 interface for the media socket")]
    NoHostAddress,

    #[error("media socket: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rtc(#[from] str0m::RtcError),

    #[error("invalid candidate: {0}")]
    Candidate(String),

    /// Error related to SDP negotiation
    #[error("invalid SDP: {0}")]
    Sdp(String),

    #[error("track {0} is already attached")]
    DuplicateTrack(String),

    #[error("there is no media to offer")]
    NothingToOffer,

    #[error("no offer is waiting for an answer")]
    NoPendingOffer,

    #[error("peer connection is closed")]
    Closed,
}

/// Settings for one peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub codecs: CodecConfig,
    /// Upper bound for server-reflexive gathering.
    pub gather_timeout: Duration,
}

/// The track-consuming side of a publish.
///
/// Implementations are driven from a single task; events flow back through
/// the channel handed out with the connection.
pub trait PeerConnection: Send + 'static {
    /// Binds a local track to a new send-only transceiver.
    fn add_track(&mut self, stream_id: &str, track: Arc<LocalTrack>) -> Result<(), PeerError>;

    /// Creates the offer and sets it as local description. Candidates known
    /// at this point are part of the returned SDP.
    fn create_offer(&mut self) -> Result<String, PeerError>;

    /// Applies the remote answer to the pending offer.
    fn accept_answer(&mut self, sdp: &str) -> Result<(), PeerError>;

    /// Releases transceivers and stops ICE. Calling it twice is harmless.
    fn close(&mut self);
}

/// Builds peer connections for a client.
pub trait PeerFactory: Send + Sync + 'static {
    type Peer: PeerConnection;

    fn create(&self, config: &PeerConfig) -> Result<(Self::Peer, PeerEvents), PeerError>;
}
