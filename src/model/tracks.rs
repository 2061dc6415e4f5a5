//! Media track management
//!
//! Local tracks are produced by the capture side and consumed by the peer
//! connection. A [`LocalTrack`] is shared by reference; its frames flow through
//! a channel fed by the matching [`TrackWriter`].

use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use str0m::format::PayloadParams;
use str0m::media::{MediaKind, MediaTime, Mid, Pt};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{Result, WhipError};

const FRAME_QUEUE: usize = 64;

/// Codecs the publisher knows how to negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Opus,
    Vp8,
    H264,
}

impl Codec {
    pub const ALL: [Codec; 3] = [Codec::Opus, Codec::Vp8, Codec::H264];

    pub fn kind(self) -> MediaKind {
        match self {
            Codec::Opus => MediaKind::Audio,
            Codec::Vp8 | Codec::H264 => MediaKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Opus => "opus",
            Codec::Vp8 => "vp8",
            Codec::H264 => "h264",
        }
    }

    pub(crate) fn matches(self, params: &PayloadParams) -> bool {
        let codec = match self {
            Codec::Opus => str0m::format::Codec::Opus,
            Codec::Vp8 => str0m::format::Codec::Vp8,
            Codec::H264 => str0m::format::Codec::H264,
        };
        params.spec().codec == codec
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = WhipError;

    fn from_str(s: &str) -> Result<Codec> {
        match s.to_ascii_lowercase().as_str() {
            "opus" => Ok(Codec::Opus),
            "vp8" => Ok(Codec::Vp8),
            "h264" => Ok(Codec::H264),
            other => Err(WhipError::Configuration(format!(
                "unsupported codec {other:?}, expected one of opus, vp8, h264"
            ))),
        }
    }
}

/// Codec preference list. For each media kind the first listed codec is
/// preferred when the server could negotiate several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    codecs: Vec<Codec>,
}

impl CodecConfig {
    pub fn new(codecs: impl IntoIterator<Item = Codec>) -> CodecConfig {
        CodecConfig {
            codecs: codecs.into_iter().collect(),
        }
    }

    pub fn codecs(&self) -> &[Codec] {
        &self.codecs
    }

    pub fn preferred(&self, kind: MediaKind) -> Option<Codec> {
        self.codecs.iter().copied().find(|c| c.kind() == kind)
    }

    pub fn supports(&self, codec: Codec) -> bool {
        self.codecs.contains(&codec)
    }

    /// Checks the list itself and that every track of `stream` can be sent.
    pub fn validate_for(&self, stream: &MediaStream) -> Result<()> {
        if self.codecs.is_empty() {
            return Err(WhipError::Configuration("codec list is empty".into()));
        }

        for (i, codec) in self.codecs.iter().enumerate() {
            if self.codecs[..i].contains(codec) {
                return Err(WhipError::Configuration(format!(
                    "codec {codec} listed twice"
                )));
            }
        }

        for track in stream.tracks() {
            if !self.supports(track.codec()) {
                return Err(WhipError::Configuration(format!(
                    "track {} is encoded as {} which is not in the codec list",
                    track.id(),
                    track.codec()
                )));
            }
        }

        Ok(())
    }
}

impl Default for CodecConfig {
    fn default() -> CodecConfig {
        CodecConfig::new([Codec::H264, Codec::Opus])
    }
}

/// One encoded frame ready for packetization.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    /// Presentation time in the codec's RTP clock.
    pub rtp_time: MediaTime,
    pub captured_at: Instant,
}

/// A locally captured track, already bound to an encoder.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    codec: Codec,
    frames: Mutex<Option<mpsc::Receiver<EncodedFrame>>>,
}

impl LocalTrack {
    /// Creates a track and the writer the capture side pushes frames into.
    pub fn new(id: impl Into<String>, codec: Codec) -> (Arc<LocalTrack>, TrackWriter) {
        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        let track = Arc::new(LocalTrack {
            id: id.into(),
            codec,
            frames: Mutex::new(Some(rx)),
        });
        (track, TrackWriter { tx })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.codec.kind()
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Hands the frame receiver to the peer connection. Only the first
    /// binding of a track receives it.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<EncodedFrame>> {
        self.frames.lock().ok().and_then(|mut f| f.take())
    }
}

/// Capture-side handle of a [`LocalTrack`].
#[derive(Debug, Clone)]
pub struct TrackWriter {
    tx: mpsc::Sender<EncodedFrame>,
}

#[derive(Debug, thiserror::Error)]
#[error("track is no longer bound to a session")]
pub struct TrackClosed;

impl TrackWriter {
    /// Queues a frame, waiting while the queue is full.
    pub async fn write(&self, frame: EncodedFrame) -> std::result::Result<(), TrackClosed> {
        self.tx.send(frame).await.map_err(|_| TrackClosed)
    }

    /// Queues a frame without waiting. Returns `false` when the queue was
    /// full and the frame got dropped.
    pub fn try_write(&self, frame: EncodedFrame) -> std::result::Result<bool, TrackClosed> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(TrackClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The set of tracks to publish.
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> MediaStream {
        MediaStream {
            id: id.into(),
            tracks: vec![],
        }
    }

    pub fn with_track(mut self, track: Arc<LocalTrack>) -> MediaStream {
        self.tracks.push(track);
        self
    }

    pub fn add_track(&mut self, track: Arc<LocalTrack>) {
        self.tracks.push(track);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// An outgoing track attached to a peer connection.
#[derive(Debug)]
pub struct TrackBinding {
    pub(crate) track: Arc<LocalTrack>,
    pub(crate) state: TrackBindingState,
    /// Payload type picked once the answer is applied.
    pub(crate) pt: Option<Pt>,
}

/// The negotiation state of an outgoing track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackBindingState {
    /// Track needs a transceiver in the next offer
    ToOpen,
    /// Offer with the given Mid is pending
    Negotiating(Mid),
    /// Answer accepted, media may flow
    Open(Mid),
}

impl TrackBinding {
    pub fn new(track: Arc<LocalTrack>) -> TrackBinding {
        TrackBinding {
            track,
            state: TrackBindingState::ToOpen,
            pt: None,
        }
    }

    /// Gets the media ID (Mid) for this track, if assigned.
    pub fn mid(&self) -> Option<Mid> {
        match self.state {
            TrackBindingState::ToOpen => None,
            TrackBindingState::Negotiating(m) | TrackBindingState::Open(m) => Some(m),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, TrackBindingState::Open(_))
    }
}
