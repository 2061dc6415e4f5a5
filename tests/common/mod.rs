//! Test doubles: a rouille WHIP endpoint that records every request and a
//! scripted peer connection.

#![allow(dead_code)]

use std::{
    io::Read,
    sync::{mpsc::Sender, Arc, Mutex},
    time::Duration,
};

use rouille::{Request, Response, Server};
use whip_rtc::{
    model::event::PeerEventSender, ConnectionState, LocalTrack, MediaStream, PeerConfig,
    PeerConnection, PeerError, PeerEvent, PeerEvents, PeerFactory,
};

pub const ANSWER: &str = "v=0\r\n\
    o=- 4 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=mid:0\r\n\
    a=recvonly\r\n";

pub const OFFER: &str = "v=0\r\n\
    o=- 1 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    a=group:BUNDLE 0\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=ice-ufrag:fakeufrag\r\n\
    a=ice-pwd:fakepasswordfakepassword\r\n\
    a=mid:0\r\n\
    a=sendonly\r\n\
    a=rtpmap:96 VP8/90000\r\n\
    a=candidate:1 1 udp 2130706431 192.0.2.10 50000 typ host\r\n";

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub if_match: Option<String>,
    pub body: String,
}

/// How the endpoint answers.
#[derive(Debug, Clone)]
pub struct Behavior {
    pub post_status: u16,
    pub location: String,
    pub etag: Option<String>,
    pub patch_status: u16,
    pub delete_status: u16,
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior {
            post_status: 201,
            location: "/whip/res1".to_string(),
            etag: Some("\"etag-1\"".to_string()),
            patch_status: 204,
            delete_status: 200,
        }
    }
}

pub struct MockWhip {
    pub base: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    stop: Option<Sender<()>>,
}

impl MockWhip {
    pub fn start(behavior: Behavior) -> MockWhip {
        let requests = Arc::new(Mutex::new(vec![]));
        let recorded = requests.clone();

        let server = Server::new("127.0.0.1:0", move |request| {
            handle(request, &behavior, &recorded)
        })
        .expect("starting the mock WHIP server");

        let base = format!("http://{}", server.server_addr());
        let (_handle, stop) = server.stoppable();

        MockWhip {
            base,
            requests,
            stop: Some(stop),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.method).collect()
    }

    /// Polls until a request with `method` arrived.
    pub async fn wait_for(&self, method: &str) -> Option<Recorded> {
        for _ in 0..100 {
            if let Some(r) = self.requests().into_iter().find(|r| r.method == method) {
                return Some(r);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }
}

impl Drop for MockWhip {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn handle(request: &Request, behavior: &Behavior, recorded: &Mutex<Vec<Recorded>>) -> Response {
    let mut body = String::new();
    if let Some(mut data) = request.data() {
        let _ = data.read_to_string(&mut body);
    }

    recorded.lock().unwrap().push(Recorded {
        method: request.method().to_string(),
        path: request.url(),
        authorization: request.header("Authorization").map(str::to_string),
        content_type: request.header("Content-Type").map(str::to_string),
        if_match: request.header("If-Match").map(str::to_string),
        body,
    });

    match request.method() {
        "POST" if behavior.post_status == 201 => {
            let mut response = Response::from_data("application/sdp", ANSWER)
                .with_status_code(201)
                .with_additional_header("Location", behavior.location.clone());
            if let Some(etag) = &behavior.etag {
                response = response.with_additional_header("ETag", etag.clone());
            }
            response
        }
        "POST" => Response::text("no capacity").with_status_code(behavior.post_status),
        "PATCH" => Response::text("").with_status_code(behavior.patch_status),
        "DELETE" => Response::text("").with_status_code(behavior.delete_status),
        _ => Response::empty_404(),
    }
}

/// What a [`FakePeer`] reports and when.
#[derive(Debug, Clone)]
pub struct Script {
    /// Reported right after the offer was created.
    pub offer_candidates: Vec<String>,
    /// Reported while the answer is applied, before the state change.
    pub answer_candidates: Vec<String>,
    /// State reported once the answer was applied.
    pub connect: Option<ConnectionState>,
    pub fail_create: bool,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            offer_candidates: vec![],
            answer_candidates: vec![],
            connect: Some(ConnectionState::Connected),
            fail_create: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerLog {
    pub created: usize,
    pub tracks: Vec<(String, String)>,
    pub offers: usize,
    pub answers: Vec<String>,
    pub closed: usize,
    pub senders: Vec<PeerEventSender>,
}

#[derive(Clone, Default)]
pub struct FakePeerFactory {
    pub script: Script,
    pub log: Arc<Mutex<PeerLog>>,
}

impl FakePeerFactory {
    pub fn new(script: Script) -> FakePeerFactory {
        FakePeerFactory {
            script,
            log: Arc::default(),
        }
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, PeerLog> {
        self.log.lock().unwrap()
    }

    /// Pushes an event into the most recent peer's channel.
    pub fn inject(&self, event: PeerEvent) {
        let log = self.log();
        let sender = log.senders.last().expect("a peer was created");
        sender.send(event).expect("session listens for peer events");
    }
}

impl PeerFactory for FakePeerFactory {
    type Peer = FakePeer;

    fn create(&self, _config: &PeerConfig) -> Result<(FakePeer, PeerEvents), PeerError> {
        if self.script.fail_create {
            return Err(PeerError::NoHostAddress);
        }

        let (events, rx) = tokio::sync::mpsc::unbounded_channel();
        // Host candidates are known up front and end up in the offer.
        events.send(PeerEvent::GatheringComplete).unwrap();

        let mut log = self.log();
        log.created += 1;
        log.senders.push(events.clone());

        let peer = FakePeer {
            script: self.script.clone(),
            log: self.log.clone(),
            events,
        };
        Ok((peer, rx))
    }
}

pub struct FakePeer {
    script: Script,
    log: Arc<Mutex<PeerLog>>,
    events: PeerEventSender,
}

impl PeerConnection for FakePeer {
    fn add_track(&mut self, stream_id: &str, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        self.log
            .lock()
            .unwrap()
            .tracks
            .push((stream_id.to_string(), track.id().to_string()));
        Ok(())
    }

    fn create_offer(&mut self) -> Result<String, PeerError> {
        self.log.lock().unwrap().offers += 1;
        for c in &self.script.offer_candidates {
            let _ = self.events.send(PeerEvent::LocalCandidate(c.clone()));
        }
        Ok(OFFER.to_string())
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<(), PeerError> {
        self.log.lock().unwrap().answers.push(sdp.to_string());
        for c in &self.script.answer_candidates {
            let _ = self.events.send(PeerEvent::LocalCandidate(c.clone()));
        }
        if let Some(state) = self.script.connect {
            let _ = self.events.send(PeerEvent::StateChange(state));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed += 1;
    }
}

pub fn video_stream() -> MediaStream {
    let (track, _writer) = LocalTrack::new("video0", whip_rtc::Codec::Vp8);
    MediaStream::new("stream0").with_track(track)
}
