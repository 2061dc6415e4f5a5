//! Silent Opus source
//!
//! Fills an audio track with Opus silence frames so the published stream
//! carries audio even without a capture device.

use std::time::{Duration, Instant};

use str0m::media::{Frequency, MediaTime};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

use crate::model::tracks::{EncodedFrame, TrackWriter};

/// One 20 ms Opus packet (CELT, fullband, mono) that decodes to silence.
pub const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Samples per frame at 48 kHz.
const FRAME_TICKS: u64 = 960;

/// RTP time of the `n`th frame.
pub fn frame_time(n: u64) -> MediaTime {
    MediaTime::new(n * FRAME_TICKS, Frequency::FORTY_EIGHT_KHZ)
}

/// Writes a silence frame every 20 ms until the track is released.
pub fn spawn_source(writer: TrackWriter) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        for n in 0u64.. {
            ticker.tick().await;

            let frame = EncodedFrame {
                data: OPUS_SILENCE.to_vec(),
                rtp_time: frame_time(n),
                captured_at: Instant::now(),
            };

            match writer.try_write(frame) {
                Ok(_) => {}
                Err(_) => {
                    debug!("Track released, stopping silence after {} frames", n);
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tracks::{Codec, LocalTrack};

    #[test]
    fn frames_advance_by_twenty_milliseconds() {
        assert_eq!(frame_time(0), MediaTime::new(0, Frequency::FORTY_EIGHT_KHZ));
        assert_eq!(frame_time(50), MediaTime::new(48_000, Frequency::FORTY_EIGHT_KHZ));
    }

    #[tokio::test]
    async fn writes_silence_in_order() {
        let (track, writer) = LocalTrack::new("audio0", Codec::Opus);
        let mut frames = track.take_frames().unwrap();
        let source = spawn_source(writer);

        let first = frames.recv().await.unwrap();
        let second = frames.recv().await.unwrap();
        assert_eq!(first.data, OPUS_SILENCE);
        assert_eq!(first.rtp_time, frame_time(0));
        assert_eq!(second.rtp_time, frame_time(1));

        source.abort();
    }

    #[tokio::test]
    async fn stops_once_the_track_is_gone() {
        let (track, writer) = LocalTrack::new("audio0", Codec::Opus);
        let source = spawn_source(writer);

        drop(track);
        tokio::time::timeout(Duration::from_secs(1), source)
            .await
            .expect("source stopped")
            .unwrap();
    }
}
