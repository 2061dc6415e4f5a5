use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use whip_rtc::{
    config::DEFAULT_ICE_SERVER,
    ivf::{self, IvfReader},
    silence, util, Codec, CodecConfig, IceServer, LocalTrack, MediaStream, SessionState, TrackWriter,
    WhipClient, WhipConfig,
};

const STREAM_ID: &str = "whip-rtc";

/// Publish media to a WHIP endpoint.
#[derive(Debug, Parser)]
#[command(name = "whip-rtc", version)]
struct Args {
    /// WHIP endpoint to publish to
    #[arg(required_unless_present = "list_codecs")]
    url: Option<String>,

    /// Bearer token for the endpoint
    #[arg(short, long, default_value = "")]
    token: String,

    /// STUN/TURN server URL, may be repeated
    #[arg(short = 'i', long = "ice-server", default_value = DEFAULT_ICE_SERVER)]
    ice_servers: Vec<String>,

    /// Advertised video bitrate in bits per second
    #[arg(short = 'b', long, default_value_t = 1_000_000)]
    video_bitrate: u32,

    /// Video codec to offer (vp8 or h264)
    #[arg(long = "video-codec", visible_alias = "vc", default_value = "h264")]
    video_codec: Codec,

    /// IVF file played as the video source
    #[arg(long)]
    video: Option<PathBuf>,

    /// Send every candidate in the offer instead of trickling
    #[arg(long)]
    no_trickle: bool,

    /// Publish video only, without the silent Opus track
    #[arg(long)]
    no_audio: bool,

    /// Print the codecs that can be negotiated and exit
    #[arg(long)]
    list_codecs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    util::init_log();

    if args.list_codecs {
        for codec in Codec::ALL {
            println!("{}\t{:?}", codec, codec.kind());
        }
        return Ok(());
    }

    let url = args.url.clone().context("missing WHIP endpoint URL")?;
    let ice_servers = IceServer::parse_all(&args.ice_servers)?;

    let source = match &args.video {
        Some(path) => Some(
            IvfReader::open(path).with_context(|| format!("opening {}", path.display()))?,
        ),
        None => None,
    };

    let video_codec = match &source {
        Some(reader) if reader.header().codec != args.video_codec => {
            warn!(
                "Video file holds {}, offering that instead of {}",
                reader.header().codec,
                args.video_codec
            );
            reader.header().codec
        }
        _ => args.video_codec,
    };

    let (track, writer) = LocalTrack::new("video0", video_codec);
    let mut stream = MediaStream::new(STREAM_ID).with_track(track);
    let audio = if args.no_audio {
        None
    } else {
        let (track, writer) = LocalTrack::new("audio0", Codec::Opus);
        stream = stream.with_track(track);
        Some(writer)
    };
    let codecs = CodecConfig::new([video_codec, Codec::Opus]);

    let config = WhipConfig::new(url, args.token).with_video_bitrate(args.video_bitrate);
    let client = WhipClient::new(config)?;

    if let Err(e) = client
        .publish(&stream, &codecs, &ice_servers, !args.no_trickle)
        .await
    {
        println!("{}", serde_json::to_string_pretty(&client.info())?);
        return Err(e).context("publishing failed");
    }

    let player = start_source(source, writer.clone());
    let audio_source = audio.map(silence::spawn_source);

    info!("Press Enter or Ctrl-C to stop");
    wait_for_stop(&client).await;

    client.close(true).await?;
    for task in player.into_iter().chain(audio_source) {
        task.abort();
    }
    drop(writer);

    println!("{}", serde_json::to_string_pretty(&client.info())?);

    Ok(())
}

fn start_source(
    source: Option<IvfReader>,
    writer: TrackWriter,
) -> Option<tokio::task::JoinHandle<()>> {
    match source {
        Some(reader) => Some(ivf::spawn_source(reader, writer)),
        None => {
            warn!("No --video given, the video track stays empty");
            None
        }
    }
}

async fn wait_for_stop(client: &WhipClient) {
    let mut failed = client.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = String::new();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = stdin.read_line(&mut line) => {}
        _ = failed.wait_for(|s| *s == SessionState::Failed) => warn!("Session failed"),
    }
}
