//! WHIP session state machine
//!
//! A [`Session`] owns one peer connection for the lifetime of a publish.
//! Negotiation runs on the caller's task; once connected the session moves
//! into its own task and becomes the only writer of session state. Peer
//! events and close commands are handled there in arrival order.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use reqwest::Url;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    error::{NegotiationStage, Result, SignalingError, WhipError},
    model::{
        candidates::{CandidateQueue, IceFragment},
        event::{ConnectionState, PeerEvent, PeerEvents},
        state::{SessionInfo, SessionState},
        tracks::MediaStream,
    },
    peer::PeerConnection,
    signaling::{Answer, Signaling},
};

/// Commands accepted by a running session.
#[derive(Debug)]
pub(crate) enum Command {
    Close { wait: bool, done: oneshot::Sender<()> },
}

/// Everything a session needs besides the peer connection.
pub(crate) struct SessionParams {
    pub target: Url,
    pub token: Option<String>,
    pub trickle: bool,
    pub connect_timeout: Duration,
    pub video_bitrate: Option<u32>,
    pub signaling: Arc<Signaling>,
    pub status: Arc<watch::Sender<SessionState>>,
    pub info: Arc<Mutex<SessionInfo>>,
}

pub(crate) struct Session<P> {
    params: SessionParams,
    peer: P,
    events: PeerEvents,
    peer_open: bool,
    queue: CandidateQueue,
    fragment: Option<IceFragment>,
    /// Set once from the offer response, released on teardown.
    resource: Option<Url>,
    etag: Option<String>,
    ice_state: Option<ConnectionState>,
}

impl<P: PeerConnection> Session<P> {
    pub fn new(params: SessionParams, peer: P, events: PeerEvents) -> Session<P> {
        Session {
            params,
            peer,
            events,
            peer_open: true,
            queue: CandidateQueue::new(),
            fragment: None,
            resource: None,
            etag: None,
            ice_state: None,
        }
    }

    fn state(&self) -> SessionState {
        *self.params.status.borrow()
    }

    fn transition(&self, to: SessionState) -> bool {
        let changed = self.params.status.send_if_modified(|state| {
            if !state.can_transition_to(to) {
                return false;
            }
            debug!("Session {} -> {}", state, to);
            *state = to;
            true
        });

        if changed {
            self.update_info(|info| info.state = to);
        } else {
            debug!("Ignoring transition to {} from {}", to, self.state());
        }
        changed
    }

    fn update_info(&self, f: impl FnOnce(&mut SessionInfo)) {
        let mut info = self
            .params
            .info
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut info);
    }

    /// Runs the negotiation. On failure the peer connection and any server
    /// resource are released and the session ends in `Failed`.
    pub async fn establish(mut self, stream: &MediaStream) -> Result<Session<P>> {
        match self.negotiate(stream).await {
            Ok(()) => Ok(self),
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn negotiate(&mut self, stream: &MediaStream) -> Result<()> {
        for track in stream.tracks() {
            self.peer
                .add_track(stream.id(), track.clone())
                .map_err(|e| WhipError::negotiation(NegotiationStage::AttachTrack, e))?;
        }

        if !self.params.trickle {
            self.wait_for_gathering().await?;
        }

        let offer = self
            .peer
            .create_offer()
            .map_err(|e| WhipError::negotiation(NegotiationStage::CreateOffer, e))?;
        debug!("Offer SDP:\n{}", offer);

        self.fragment = IceFragment::from_offer(&offer);
        if self.params.trickle && self.fragment.is_none() {
            warn!("Offer lacks ICE credentials, late candidates will not be trickled");
        }

        let body = match self.params.video_bitrate {
            Some(bps) => with_bandwidth(&offer, bps),
            None => offer,
        };
        let sent = body.clone();
        self.update_info(|info| info.local_sdp = Some(sent));

        let answer = self
            .exchange(body)
            .await
            .map_err(|e| WhipError::negotiation(NegotiationStage::OfferExchange, e))?;
        debug!("Answer SDP:\n{}", answer.sdp);

        // Recorded before applying so an unusable answer still releases the
        // server side allocation.
        self.resource = Some(answer.resource_url.clone());
        self.etag = answer.etag;
        self.update_info(|info| info.resource_url = Some(answer.resource_url.to_string()));

        self.peer
            .accept_answer(&answer.sdp)
            .map_err(|e| WhipError::negotiation(NegotiationStage::ApplyAnswer, e))?;
        self.update_info(|info| info.remote_sdp = Some(answer.sdp));
        info!("Answer accepted, waiting for ICE connection");

        self.flush_candidates().await;
        self.wait_connected().await
    }

    async fn wait_for_gathering(&mut self) -> Result<()> {
        loop {
            match self.events.recv().await {
                Some(PeerEvent::GatheringComplete) => return Ok(()),
                Some(PeerEvent::StateChange(s)) if s.is_terminal() => {
                    return Err(WhipError::negotiation(
                        NegotiationStage::IceGathering,
                        format!("peer connection became {s} while gathering"),
                    ));
                }
                Some(event) => debug!("Event while gathering: {:?}", event),
                None => {
                    return Err(WhipError::negotiation(
                        NegotiationStage::IceGathering,
                        "peer connection went away",
                    ))
                }
            }
        }
    }

    /// POSTs the offer while buffering whatever the peer reports meanwhile.
    async fn exchange(&mut self, body: String) -> std::result::Result<Answer, SignalingError> {
        let signaling = self.params.signaling.clone();
        let target = self.params.target.clone();
        let token = self.params.token.clone();

        let send = async move { signaling.send_offer(&target, &body, token.as_deref()).await };
        tokio::pin!(send);

        loop {
            tokio::select! {
                res = &mut send => return res,
                Some(event) = self.events.recv() => self.buffer_event(event),
            }
        }
    }

    fn buffer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(c) if self.params.trickle => {
                debug!("Queueing candidate until the resource URL is known");
                self.queue.push(c);
            }
            PeerEvent::LocalCandidate(c) => debug!("Ignoring late candidate {}", c.trim()),
            PeerEvent::GatheringComplete => {}
            PeerEvent::StateChange(s) => self.ice_state = Some(s),
        }
    }

    async fn flush_candidates(&mut self) {
        let queued: Vec<String> = self.queue.drain().collect();
        if !queued.is_empty() {
            debug!("Flushing {} queued candidates", queued.len());
        }
        for candidate in queued {
            self.send_candidate(&candidate).await;
        }
    }

    async fn on_local_candidate(&mut self, candidate: String) {
        if !self.params.trickle {
            debug!("Ignoring late candidate {}", candidate.trim());
            return;
        }
        if self.resource.is_none() {
            self.queue.push(candidate);
            return;
        }
        self.send_candidate(&candidate).await;
    }

    /// Trickles one candidate. Failures are logged and otherwise ignored.
    async fn send_candidate(&mut self, candidate: &str) {
        let (Some(resource), Some(fragment)) = (&self.resource, &self.fragment) else {
            return;
        };

        let body = fragment.body(candidate);
        let result = self
            .params
            .signaling
            .send_candidate(
                resource,
                &body,
                self.params.token.as_deref(),
                self.etag.as_deref(),
            )
            .await;

        match result {
            Ok(()) => self.update_info(|info| info.candidates_sent += 1),
            Err(e) => warn!("Trickle ICE candidate was not accepted: {}", e),
        }
    }

    async fn wait_connected(&mut self) -> Result<()> {
        if let Some(state) = self.ice_state {
            if let Some(result) = self.on_negotiating_state(state) {
                return result;
            }
        }

        let timeout = tokio::time::sleep(self.params.connect_timeout);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => {
                    return Err(WhipError::negotiation(
                        NegotiationStage::IceConnectivity,
                        format!("no ICE connection after {:?}", self.params.connect_timeout),
                    ));
                }
                event = self.events.recv() => match event {
                    Some(PeerEvent::LocalCandidate(c)) => self.on_local_candidate(c).await,
                    Some(PeerEvent::GatheringComplete) => {}
                    Some(PeerEvent::StateChange(state)) => {
                        if let Some(result) = self.on_negotiating_state(state) {
                            return result;
                        }
                    }
                    None => {
                        return Err(WhipError::negotiation(
                            NegotiationStage::IceConnectivity,
                            "peer connection went away",
                        ));
                    }
                },
            }
        }
    }

    fn on_negotiating_state(&mut self, state: ConnectionState) -> Option<Result<()>> {
        self.ice_state = Some(state);

        if state.is_usable() {
            if self.transition(SessionState::Connected) {
                self.update_info(|info| info.connected_at = Some(Utc::now()));
                info!("✅ Publishing to {}", self.params.target);
            }
            return Some(Ok(()));
        }

        if state.is_terminal() {
            return Some(Err(WhipError::negotiation(
                NegotiationStage::IceConnectivity,
                format!("ICE connection {state}"),
            )));
        }

        debug!("ICE is {}", state);
        None
    }

    async fn abort(&mut self, error: &WhipError) {
        warn!("Publishing to {} failed: {}", self.params.target, error);

        self.peer.close();
        self.peer_open = false;

        if let Some(resource) = self.resource.take() {
            if let Err(e) = self
                .params
                .signaling
                .terminate(&resource, self.params.token.as_deref())
                .await
            {
                warn!("Releasing {} failed: {}", resource, e);
            }
        }

        self.transition(SessionState::Failed);
        let failure = error.to_string();
        self.update_info(|info| info.failure = Some(failure));
    }

    /// Session actor loop. Returns once the session is closed.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close { wait, done }) => {
                        self.teardown(wait).await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        // The client was dropped without closing.
                        self.teardown(false).await;
                        return;
                    }
                },
                event = self.events.recv(), if self.peer_open => match event {
                    Some(PeerEvent::LocalCandidate(c)) => self.on_local_candidate(c).await,
                    Some(PeerEvent::GatheringComplete) => {}
                    Some(PeerEvent::StateChange(state)) if state.is_terminal() => {
                        self.fail(format!("ICE connection {state}"));
                    }
                    Some(PeerEvent::StateChange(state)) => debug!("ICE is {}", state),
                    None => self.fail("peer connection went away".to_string()),
                },
            }
        }
    }

    /// The connection broke while publishing. The server resource stays
    /// recorded so `close` can still release it.
    fn fail(&mut self, reason: String) {
        warn!("Session to {} failed: {}", self.params.target, reason);
        self.peer.close();
        self.peer_open = false;
        self.transition(SessionState::Failed);
        self.update_info(|info| info.failure = Some(reason));
    }

    async fn teardown(&mut self, wait: bool) {
        if !self.transition(SessionState::Closing) {
            return;
        }

        if let Some(resource) = self.resource.take() {
            let signaling = self.params.signaling.clone();
            let token = self.params.token.clone();
            let delete = async move {
                match signaling.terminate(&resource, token.as_deref()).await {
                    Ok(()) => info!("Released {}", resource),
                    Err(e) => warn!("Releasing {} failed: {}", resource, e),
                }
            };

            if wait {
                delete.await;
            } else {
                tokio::spawn(delete);
            }
        }

        self.peer.close();
        self.peer_open = false;
        self.transition(SessionState::Closed);
    }
}

/// Adds `b=AS`/`b=TIAS` lines to every video section of an SDP.
pub fn with_bandwidth(sdp: &str, video_bps: u32) -> String {
    fn push_bandwidth(out: &mut String, bps: u32) {
        out.push_str(&format!("b=AS:{}\r\nb=TIAS:{}\r\n", bps / 1000, bps));
    }

    let mut out = String::with_capacity(sdp.len() + 64);
    let mut pending = false;

    for line in sdp.lines() {
        // b= goes after the optional i= and c= lines of a media section.
        if pending && !(line.starts_with("i=") || line.starts_with("c=")) {
            if !line.starts_with("b=") {
                push_bandwidth(&mut out, video_bps);
            }
            pending = false;
        }
        if line.starts_with("m=") {
            pending = line.starts_with("m=video");
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    if pending {
        push_bandwidth(&mut out, video_bps);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::with_bandwidth;

    #[test]
    fn bandwidth_follows_connection_line_of_video_only() {
        let sdp = "v=0\r\n\
            m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
            c=IN IP4 0.0.0.0\r\n\
            a=mid:0\r\n\
            m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
            c=IN IP4 0.0.0.0\r\n\
            a=mid:1\r\n";

        let out = with_bandwidth(sdp, 1_000_000);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "v=0",
                "m=audio 9 UDP/TLS/RTP/SAVPF 111",
                "c=IN IP4 0.0.0.0",
                "a=mid:0",
                "m=video 9 UDP/TLS/RTP/SAVPF 96",
                "c=IN IP4 0.0.0.0",
                "b=AS:1000",
                "b=TIAS:1000000",
                "a=mid:1",
            ]
        );
    }

    #[test]
    fn bandwidth_on_trailing_video_section() {
        let out = with_bandwidth("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n", 500_000);
        assert!(out.ends_with("m=video 9 UDP/TLS/RTP/SAVPF 96\r\nb=AS:500\r\nb=TIAS:500000\r\n"));
    }

    #[test]
    fn existing_bandwidth_is_kept() {
        let sdp = "m=video 9 UDP/TLS/RTP/SAVPF 96\r\nb=AS:200\r\na=mid:0\r\n";
        let out = with_bandwidth(sdp, 1_000_000);
        assert_eq!(out, sdp);
    }
}
