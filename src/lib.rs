//! WHIP publishing client
//!
//! Publishes a local [`MediaStream`] to a WHIP ingestion endpoint: the SDP
//! offer is POSTed, trickled candidates are PATCHed to the returned session
//! resource and the resource is DELETEd when the client closes.

pub mod client;
pub mod config;
pub mod error;
pub mod ivf;
pub mod model;
pub mod peer;
mod session;
pub mod signaling;
pub mod silence;
pub mod util;

pub use client::WhipClient;
pub use config::{IceServer, WhipConfig};
pub use error::{NegotiationStage, Result, SignalingError, WhipError};
pub use model::{
    event::{ConnectionState, PeerEvent, PeerEvents},
    state::{SessionInfo, SessionState},
    tracks::{Codec, CodecConfig, EncodedFrame, LocalTrack, MediaStream, TrackWriter},
};
pub use peer::{PeerConfig, PeerConnection, PeerError, PeerFactory};
