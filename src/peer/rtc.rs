//! str0m backed peer connection
//!
//! str0m is sans-IO, so every [`Str0mPeer`] comes with a driver task that owns
//! the UDP socket. The driver:
//! 1. Feeds inbound datagrams and timeouts into the [`Rtc`] instance
//! 2. Transmits whatever the [`Rtc`] wants to send
//! 3. Gathers server-reflexive candidates from the configured STUN servers
//! 4. Writes frames of bound tracks once ICE is connected
//! 5. Reports candidates and ICE state changes on the peer event channel

use std::{
    net::{SocketAddr, UdpSocket as StdUdpSocket},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use str0m::{
    change::{SdpAnswer, SdpPendingOffer},
    media::{Direction, Mid},
    net::{Protocol, Receive},
    Candidate, Event, IceConnectionState, Input, Output, Rtc,
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{gather::Gatherer, PeerConfig, PeerConnection, PeerError, PeerFactory};
use crate::model::{
    event::{ConnectionState, PeerEvent, PeerEventSender, PeerEvents},
    tracks::{Codec, EncodedFrame, LocalTrack, TrackBinding, TrackBindingState},
};
use crate::util::select_host_address;

const MEDIA_QUEUE: usize = 256;

/// Creates [`Str0mPeer`]s bound to the host's routable IPv4 address.
#[derive(Debug, Clone, Copy, Default)]
pub struct Str0mPeerFactory;

impl PeerFactory for Str0mPeerFactory {
    type Peer = Str0mPeer;

    fn create(&self, config: &PeerConfig) -> Result<(Str0mPeer, PeerEvents), PeerError> {
        Str0mPeer::new(config)
    }
}

/// State shared between the [`Str0mPeer`] handle and its driver.
struct Inner {
    rtc: Rtc,
    stream_id: String,
    bindings: Vec<TrackBinding>,
    pending: Option<SdpPendingOffer>,
    /// Candidates added after this is set must be trickled.
    offered: bool,
    ice_state: Option<ConnectionState>,
    events: PeerEventSender,
    media_tx: mpsc::Sender<(Mid, EncodedFrame)>,
}

impl Inner {
    fn emit(&self, event: PeerEvent) {
        // The session may already be gone during teardown.
        let _ = self.events.send(event);
    }

    fn is_connected(&self) -> bool {
        self.ice_state == Some(ConnectionState::Connected)
    }

    fn add_candidate(&mut self, candidate: Candidate) {
        let Some(added) = self.rtc.add_local_candidate(candidate) else {
            debug!("Local candidate is redundant, dropped");
            return;
        };
        let line = added.to_sdp_string();
        info!("Discovered local candidate {}", line.trim());

        if self.offered {
            self.emit(PeerEvent::LocalCandidate(line));
        }
    }

    fn set_ice_state(&mut self, state: ConnectionState) {
        if self.ice_state == Some(state) {
            return;
        }
        self.ice_state = Some(state);
        self.emit(PeerEvent::StateChange(state));
    }

    /// Poll all the output from the rtc until it returns a timeout.
    /// Transmits are collected into `out`.
    fn poll_until_timeout(&mut self, out: &mut Vec<(SocketAddr, Vec<u8>)>) -> Instant {
        loop {
            if !self.rtc.is_alive() {
                return Instant::now();
            }

            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => return t,
                Ok(Output::Transmit(transmit)) => {
                    out.push((transmit.destination, transmit.contents.to_vec()));
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    warn!("Peer poll_output failed: {:?}", e);
                    self.rtc.disconnect();
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("🔌 ICE Connection State: {:?}", state);
                let state = match state {
                    IceConnectionState::New => ConnectionState::New,
                    IceConnectionState::Checking => ConnectionState::Checking,
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        ConnectionState::Connected
                    }
                    IceConnectionState::Disconnected => ConnectionState::Disconnected,
                };
                self.set_ice_state(state);
            }
            Event::Connected => info!("DTLS handshake complete, media can flow"),
            Event::PeerStats(stats) => debug!("{:?}", stats),
            Event::MediaEgressStats(stats) => debug!("{:?}", stats),
            other => debug!("Event (other): {:?}", other),
        }
    }

    fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }

        if let Err(e) = self.rtc.handle_input(input) {
            warn!("Peer disconnected: {:?}", e);
            self.rtc.disconnect();
        }
    }

    fn write_frame(&mut self, mid: Mid, frame: EncodedFrame) {
        if !self.is_connected() {
            // Nobody is listening yet; the encoder produces a fresh frame soon.
            return;
        }

        let Some(binding) = self
            .bindings
            .iter_mut()
            .find(|b| b.is_open() && b.mid() == Some(mid))
        else {
            return;
        };

        let Some(writer) = self.rtc.writer(mid) else {
            return;
        };

        let pt = match binding.pt {
            Some(pt) => pt,
            None => {
                let codec = binding.track.codec();
                let Some(pt) = writer
                    .payload_params()
                    .find(|p| codec.matches(p))
                    .map(|p| p.pt())
                else {
                    warn!(
                        "Answer did not accept {} for track {}, dropping its media",
                        codec,
                        binding.track.id()
                    );
                    return;
                };
                binding.pt = Some(pt);
                pt
            }
        };

        if let Err(e) = writer.write(pt, frame.captured_at, frame.rtp_time, frame.data) {
            warn!("Writing to track {} failed: {:?}", binding.track.id(), e);
        }
    }
}

/// A peer connection backed by [`str0m::Rtc`].
pub struct Str0mPeer {
    inner: Arc<Mutex<Inner>>,
    wake: Arc<Notify>,
    shutdown: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Str0mPeer {
    /// Binds the media socket and spawns the driver. Must be called from
    /// within a tokio runtime.
    pub fn new(config: &PeerConfig) -> Result<(Str0mPeer, PeerEvents), PeerError> {
        let host = select_host_address().ok_or(PeerError::NoHostAddress)?;

        let socket = StdUdpSocket::bind(SocketAddr::new(host, 0))?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        info!("Bound UDP port: {}", local_addr);

        let mut builder = Rtc::builder().clear_codecs();
        for codec in config.codecs.codecs() {
            builder = match codec {
                Codec::Opus => builder.enable_opus(true),
                Codec::Vp8 => builder.enable_vp8(true),
                Codec::H264 => builder.enable_h264(true),
            };
        }
        let rtc = builder.build();

        let (events, events_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::channel(MEDIA_QUEUE);

        let mut inner = Inner {
            rtc,
            stream_id: "whip-rtc".to_string(),
            bindings: vec![],
            pending: None,
            offered: false,
            ice_state: None,
            events,
            media_tx,
        };

        let host_candidate = Candidate::host(local_addr, Protocol::Udp)
            .map_err(|e| PeerError::Candidate(e.to_string()))?;
        inner.add_candidate(host_candidate);

        let stun_servers: Vec<(String, String)> = config
            .ice_servers
            .iter()
            .filter(|s| {
                if s.scheme().is_turn() {
                    warn!("Skipping TURN server {}, relaying is not supported", s);
                }
                !s.scheme().is_turn()
            })
            .map(|s| (s.url().to_string(), s.authority()))
            .collect();

        let inner = Arc::new(Mutex::new(inner));
        let wake = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = oneshot::channel();

        let driver = Driver {
            inner: inner.clone(),
            socket: UdpSocket::from_std(socket)?,
            local_addr,
            wake: wake.clone(),
            media_rx,
            shutdown: shutdown_rx,
            gatherer: Gatherer::new(Instant::now() + config.gather_timeout),
        };
        let driver = tokio::spawn(driver.run(stun_servers));

        let peer = Str0mPeer {
            inner,
            wake,
            shutdown: Some(shutdown),
            driver: Some(driver),
            local_addr,
        };

        Ok((peer, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, PeerError> {
        self.inner.lock().map_err(|_| PeerError::Closed)
    }
}

impl PeerConnection for Str0mPeer {
    fn add_track(&mut self, stream_id: &str, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        let mut inner = self.lock()?;

        if inner.offered {
            return Err(PeerError::Sdp("tracks must be attached before the offer".into()));
        }
        if inner.bindings.iter().any(|b| b.track.id() == track.id()) {
            return Err(PeerError::DuplicateTrack(track.id().to_string()));
        }

        debug!(
            "Attaching {:?} track {} ({}) to stream {}",
            track.kind(),
            track.id(),
            track.codec(),
            stream_id
        );

        inner.stream_id = stream_id.to_string();
        inner.bindings.push(TrackBinding::new(track));

        Ok(())
    }

    fn create_offer(&mut self) -> Result<String, PeerError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        if inner.offered {
            return Err(PeerError::Sdp("offer already created".into()));
        }

        let mut change = inner.rtc.sdp_api();
        for binding in inner.bindings.iter_mut() {
            if let TrackBindingState::ToOpen = binding.state {
                let mid = change.add_media(
                    binding.track.kind(),
                    Direction::SendOnly,
                    Some(inner.stream_id.clone()),
                    Some(binding.track.id().to_string()),
                    None,
                );
                binding.state = TrackBindingState::Negotiating(mid);
            }
        }

        if !change.has_changes() {
            return Err(PeerError::NothingToOffer);
        }

        let (offer, pending) = change.apply().ok_or(PeerError::NothingToOffer)?;

        inner.pending = Some(pending);
        inner.offered = true;

        Ok(offer.to_sdp_string())
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<(), PeerError> {
        let answer = SdpAnswer::from_sdp_string(sdp).map_err(|e| PeerError::Sdp(e.to_string()))?;

        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let pending = inner.pending.take().ok_or(PeerError::NoPendingOffer)?;
        inner.rtc.sdp_api().accept_answer(pending, answer)?;

        for binding in inner.bindings.iter_mut() {
            if let TrackBindingState::Negotiating(mid) = binding.state {
                binding.state = TrackBindingState::Open(mid);

                if let Some(mut frames) = binding.track.take_frames() {
                    let media_tx = inner.media_tx.clone();
                    tokio::spawn(async move {
                        while let Some(frame) = frames.recv().await {
                            if media_tx.send((mid, frame)).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            }
        }

        drop(guard);
        self.wake.notify_one();

        Ok(())
    }

    fn close(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.rtc.disconnect();
            inner.bindings.clear();
        }

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            info!("Peer connection on {} closed", self.local_addr);
        }

        self.driver.take();
    }
}

impl Drop for Str0mPeer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the socket and moves the [`Rtc`] forward.
struct Driver {
    inner: Arc<Mutex<Inner>>,
    socket: UdpSocket,
    local_addr: SocketAddr,
    wake: Arc<Notify>,
    media_rx: mpsc::Receiver<(Mid, EncodedFrame)>,
    shutdown: oneshot::Receiver<()>,
    gatherer: Gatherer,
}

impl Driver {
    async fn run(mut self, stun_servers: Vec<(String, String)>) {
        self.start_gathering(stun_servers).await;

        let mut buf = vec![0; 2000];
        let mut transmits = vec![];

        loop {
            let timeout = {
                let Ok(mut inner) = self.inner.lock() else {
                    break;
                };
                if !inner.rtc.is_alive() {
                    info!("Peer is no longer alive");
                    inner.set_ice_state(ConnectionState::Closed);
                    break;
                }
                inner.poll_until_timeout(&mut transmits)
            };

            for (destination, contents) in transmits.drain(..) {
                if let Err(e) = self.socket.send_to(&contents, destination).await {
                    debug!("Sending to {} failed: {}", destination, e);
                }
            }

            let deadline = match self.gatherer.poll_timeout() {
                Some(g) => timeout.min(g),
                None => timeout,
            };

            tokio::select! {
                _ = &mut self.shutdown => break,

                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, source)) => self.handle_datagram(&buf[..n], source),
                    // ICMP errors surface here on some platforms.
                    Err(e) => debug!("UDP receive failed: {}", e),
                },

                Some((mid, frame)) = self.media_rx.recv() => {
                    if let Ok(mut inner) = self.inner.lock() {
                        inner.write_frame(mid, frame);
                    }
                }

                _ = self.wake.notified() => {}

                _ = tokio::time::sleep_until(deadline.into()) => {
                    let now = Instant::now();
                    self.gatherer.handle_timeout(now);
                    self.report_gathering();
                    if let Ok(mut inner) = self.inner.lock() {
                        inner.handle_input(Input::Timeout(now));
                    }
                }
            }
        }

        debug!("Peer driver for {} stopped", self.local_addr);
    }

    async fn start_gathering(&mut self, stun_servers: Vec<(String, String)>) {
        let remaining = self
            .gatherer
            .poll_timeout()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO);

        for (url, authority) in stun_servers {
            let resolved =
                tokio::time::timeout(remaining, tokio::net::lookup_host(authority.as_str())).await;

            let server = match resolved {
                Ok(Ok(mut addrs)) => addrs.find(|a| a.is_ipv4()),
                Ok(Err(e)) => {
                    warn!("Resolving STUN server {} failed: {}", url, e);
                    None
                }
                Err(_) => {
                    warn!("Resolving STUN server {} timed out", url);
                    None
                }
            };

            let Some(server) = server else {
                continue;
            };

            let request = self.gatherer.request(&url, server);
            if let Err(e) = self.socket.send_to(&request, server).await {
                warn!("Sending STUN request to {} failed: {}", url, e);
            }
        }

        self.gatherer.start();
        self.report_gathering();
    }

    fn handle_datagram(&mut self, datagram: &[u8], source: SocketAddr) {
        if let Some(mapped) = self.gatherer.handle(datagram, source) {
            if let Some(mapped) = mapped {
                match Candidate::server_reflexive(mapped, self.local_addr, Protocol::Udp) {
                    Ok(candidate) => {
                        if let Ok(mut inner) = self.inner.lock() {
                            inner.add_candidate(candidate);
                        }
                    }
                    Err(e) => warn!("Reflexive address {} unusable: {:?}", mapped, e),
                }
            }
            self.report_gathering();
            return;
        }

        // Parse data to a DatagramRecv, which help preparse network data to
        // figure out the multiplexing of all protocols on one UDP port.
        let Ok(contents) = datagram.try_into() else {
            return;
        };

        let input = Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination: self.local_addr,
                contents,
            },
        );

        if let Ok(mut inner) = self.inner.lock() {
            inner.handle_input(input);
        }
    }

    fn report_gathering(&mut self) {
        if self.gatherer.poll_complete() {
            info!("ICE gathering complete");
            if let Ok(inner) = self.inner.lock() {
                inner.emit(PeerEvent::GatheringComplete);
            }
        }
    }
}
