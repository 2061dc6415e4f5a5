//! IVF file source
//!
//! Reads VP8 or H.264 frames from an IVF container and feeds them to a track
//! at the pace given by their timestamps, looping at end of file.

use std::{
    path::Path,
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes};
use str0m::media::{Frequency, MediaTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::tracks::{Codec, EncodedFrame, TrackWriter};

const SIGNATURE: &[u8; 4] = b"DKIF";
const FILE_HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum IvfError {
    #[error("reading IVF file: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an IVF file")]
    Signature,

    #[error("unsupported IVF fourcc {0:?}")]
    FourCc(String),

    #[error("IVF timebase {0}/{1} is invalid")]
    Timebase(u32, u32),

    #[error("IVF data ends inside a frame")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfHeader {
    pub codec: Codec,
    pub width: u16,
    pub height: u16,
    /// Timestamp units per second.
    pub rate: u32,
    pub scale: u32,
    pub frame_count: u32,
}

impl IvfHeader {
    /// Wall clock offset of a frame timestamp.
    pub fn offset_of(&self, timestamp: u64) -> Duration {
        let micros = timestamp as u128 * self.scale as u128 * 1_000_000 / self.rate as u128;
        Duration::from_micros(micros as u64)
    }

    /// Duration of one timestamp unit.
    pub fn tick(&self) -> Duration {
        self.offset_of(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfFrame {
    pub timestamp: u64,
    pub data: Bytes,
}

/// In-memory IVF reader.
#[derive(Debug, Clone)]
pub struct IvfReader {
    header: IvfHeader,
    frames: Bytes,
    cursor: Bytes,
}

impl IvfReader {
    pub fn open(path: impl AsRef<Path>) -> Result<IvfReader, IvfError> {
        let data = std::fs::read(path)?;
        IvfReader::parse(Bytes::from(data))
    }

    pub fn parse(mut data: Bytes) -> Result<IvfReader, IvfError> {
        if data.len() < FILE_HEADER_LEN || &data[..4] != SIGNATURE {
            return Err(IvfError::Signature);
        }

        let mut header = data.split_to(FILE_HEADER_LEN);
        header.advance(4);
        let _version = header.get_u16_le();
        let header_len = header.get_u16_le() as usize;

        let mut fourcc = [0u8; 4];
        header.copy_to_slice(&mut fourcc);
        let codec = match &fourcc {
            b"VP80" => Codec::Vp8,
            b"H264" => Codec::H264,
            other => return Err(IvfError::FourCc(String::from_utf8_lossy(other).into_owned())),
        };

        let width = header.get_u16_le();
        let height = header.get_u16_le();
        let rate = header.get_u32_le();
        let scale = header.get_u32_le();
        let frame_count = header.get_u32_le();

        if rate == 0 || scale == 0 {
            return Err(IvfError::Timebase(scale, rate));
        }

        // Some writers declare a longer header than the fixed 32 bytes.
        if header_len > FILE_HEADER_LEN {
            let extra = header_len - FILE_HEADER_LEN;
            if data.len() < extra {
                return Err(IvfError::Truncated);
            }
            data.advance(extra);
        }

        Ok(IvfReader {
            header: IvfHeader {
                codec,
                width,
                height,
                rate,
                scale,
                frame_count,
            },
            cursor: data.clone(),
            frames: data,
        })
    }

    pub fn header(&self) -> &IvfHeader {
        &self.header
    }

    pub fn next_frame(&mut self) -> Result<Option<IvfFrame>, IvfError> {
        if self.cursor.is_empty() {
            return Ok(None);
        }
        if self.cursor.len() < FRAME_HEADER_LEN {
            return Err(IvfError::Truncated);
        }

        let size = self.cursor.get_u32_le() as usize;
        let timestamp = self.cursor.get_u64_le();
        if self.cursor.len() < size {
            return Err(IvfError::Truncated);
        }

        Ok(Some(IvfFrame {
            timestamp,
            data: self.cursor.split_to(size),
        }))
    }

    /// Starts over at the first frame.
    pub fn rewind(&mut self) {
        self.cursor = self.frames.clone();
    }
}

/// Plays `reader` into `writer` in real time until the track is released.
///
/// Frames the track cannot take right away are dropped, like a live camera
/// would.
pub fn spawn_source(mut reader: IvfReader, writer: TrackWriter) -> JoinHandle<()> {
    tokio::spawn(async move {
        let header = *reader.header();
        info!(
            "Playing {}x{} {} IVF ({} frames)",
            header.width, header.height, header.codec, header.frame_count
        );

        let start = Instant::now();
        let mut pass_offset = Duration::ZERO;
        let mut last = Duration::ZERO;
        let mut frames_in_pass = 0usize;

        loop {
            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) if frames_in_pass == 0 => {
                    warn!("IVF file holds no frames");
                    return;
                }
                Ok(None) => {
                    debug!("Looping IVF file after {} frames", frames_in_pass);
                    pass_offset = last + header.tick();
                    frames_in_pass = 0;
                    reader.rewind();
                    continue;
                }
                Err(e) => {
                    warn!("Stopping IVF source: {}", e);
                    return;
                }
            };
            frames_in_pass += 1;

            let at = pass_offset + header.offset_of(frame.timestamp);
            tokio::time::sleep_until((start + at).into()).await;
            last = at;

            let encoded = EncodedFrame {
                data: frame.data.to_vec(),
                rtp_time: rtp_time(at),
                captured_at: Instant::now(),
            };

            match writer.try_write(encoded) {
                Ok(true) => {}
                Ok(false) => debug!("Track queue full, dropped frame at {:?}", at),
                Err(_) => {
                    debug!("Track released, stopping IVF source");
                    return;
                }
            }
        }
    })
}

fn rtp_time(offset: Duration) -> MediaTime {
    let ticks = offset.as_micros() * 90 / 1000;
    MediaTime::new(ticks as u64, Frequency::NINETY_KHZ)
}
