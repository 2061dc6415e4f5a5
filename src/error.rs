//! Error types for the WHIP publisher
//!
//! [`WhipError`] is the caller-visible taxonomy. [`SignalingError`] is what the
//! HTTP transport produces; the session decides per phase whether it is fatal.

use std::fmt;

use reqwest::{Method, StatusCode};

use crate::model::state::SessionState;

/// Result type alias using [`WhipError`].
pub type Result<T> = std::result::Result<T, WhipError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by [`crate::client::WhipClient`].
#[derive(Debug, thiserror::Error)]
pub enum WhipError {
    /// Invalid codec, ICE server, URL or track setup. No session was created.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The session could not be established and has been torn down.
    #[error("negotiation failed while {stage}: {source}")]
    Negotiation {
        stage: NegotiationStage,
        #[source]
        source: BoxError,
    },

    /// The WHIP endpoint answered with something unexpected.
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// The operation is not allowed in the current session state.
    #[error("cannot {operation} while session is {state}")]
    SessionState {
        operation: &'static str,
        state: SessionState,
    },
}

impl WhipError {
    pub(crate) fn negotiation(
        stage: NegotiationStage,
        source: impl Into<BoxError>,
    ) -> WhipError {
        WhipError::Negotiation {
            stage,
            source: source.into(),
        }
    }

    pub fn is_negotiation(&self) -> bool {
        matches!(self, WhipError::Negotiation { .. })
    }

    pub fn is_session_state(&self) -> bool {
        matches!(self, WhipError::SessionState { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, WhipError::Configuration(_))
    }
}

/// Where in `publish` a negotiation failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    PeerSetup,
    AttachTrack,
    IceGathering,
    CreateOffer,
    OfferExchange,
    ApplyAnswer,
    IceConnectivity,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationStage::PeerSetup => "creating the peer connection",
            NegotiationStage::AttachTrack => "attaching tracks",
            NegotiationStage::IceGathering => "gathering ICE candidates",
            NegotiationStage::CreateOffer => "creating the offer",
            NegotiationStage::OfferExchange => "exchanging offer and answer",
            NegotiationStage::ApplyAnswer => "applying the answer",
            NegotiationStage::IceConnectivity => "establishing ICE connectivity",
        };
        f.write_str(s)
    }
}

/// Errors from a single HTTP exchange with the WHIP endpoint.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("{method} {url} failed: {source}")]
    Http {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("offer response has no Location header")]
    MissingLocation,

    #[error("offer response has an invalid Location {location:?}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("offer response carries no SDP answer")]
    MissingAnswer,

    #[error("offer response body is not an SDP answer")]
    MalformedAnswer,
}

impl SignalingError {
    /// HTTP status of the response, if one was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            SignalingError::Status { status, .. } => Some(*status),
            SignalingError::Http { source, .. } => source.status(),
            _ => None,
        }
    }
}
