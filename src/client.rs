//! Publishing client facade
//!
//! A [`WhipClient`] publishes one media stream to one WHIP endpoint at a time.
//! `publish` negotiates on the caller's task; once the session is connected a
//! background task owns it until `close` is called or the client is dropped.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use reqwest::Url;
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, MutexGuard},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    config::{IceServer, WhipConfig},
    error::{NegotiationStage, Result, WhipError},
    model::{
        state::{SessionInfo, SessionState},
        tracks::{CodecConfig, MediaStream},
    },
    peer::{PeerConfig, PeerFactory, Str0mPeerFactory},
    session::{Command, Session, SessionParams},
    signaling::Signaling,
};

/// Handle to a session that reached `Connected`. It stays in the slot after
/// a failure so the resource can still be released.
struct SessionHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    async fn close(self, wait: bool) {
        let (done, ack) = oneshot::channel();
        if self.commands.send(Command::Close { wait, done }).await.is_ok() {
            let _ = ack.await;
        }
        if wait {
            let _ = self.task.await;
        }
    }
}

pub struct WhipClient<F: PeerFactory = Str0mPeerFactory> {
    config: WhipConfig,
    target: Url,
    signaling: Arc<Signaling>,
    factory: F,
    status: Arc<watch::Sender<SessionState>>,
    info: Arc<Mutex<SessionInfo>>,
    /// Held by `publish` from start to finish.
    session: AsyncMutex<Option<SessionHandle>>,
}

impl<F: PeerFactory> fmt::Debug for WhipClient<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhipClient")
            .field("target", &self.target.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WhipClient<Str0mPeerFactory> {
    /// Creates a client publishing through str0m peer connections.
    pub fn new(config: WhipConfig) -> Result<WhipClient<Str0mPeerFactory>> {
        WhipClient::with_peer_factory(config, Str0mPeerFactory)
    }
}

impl<F: PeerFactory> WhipClient<F> {
    pub fn with_peer_factory(config: WhipConfig, factory: F) -> Result<WhipClient<F>> {
        let target = config.publish_url()?;
        let signaling = Arc::new(Signaling::new(config.request_timeout())?);
        let (status, _) = watch::channel(SessionState::Idle);

        Ok(WhipClient {
            info: Arc::new(Mutex::new(SessionInfo::idle(target.as_str()))),
            config,
            target,
            signaling,
            factory,
            status: Arc::new(status),
            session: AsyncMutex::new(None),
        })
    }

    pub fn config(&self) -> &WhipConfig {
        &self.config
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.status.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.status.subscribe()
    }

    /// Diagnostic snapshot of the current or last session.
    pub fn info(&self) -> SessionInfo {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_publish(&self) -> Result<()> {
        let state = self.state();
        if state.accepts_publish() {
            Ok(())
        } else {
            Err(WhipError::SessionState {
                operation: "publish",
                state,
            })
        }
    }

    /// Publishes `stream` and returns once media can flow.
    ///
    /// With `trickle` set the offer is sent as soon as it exists and later
    /// candidates are PATCHed to the session resource. Without it gathering
    /// completes first and every candidate travels in the offer.
    pub async fn publish(
        &self,
        stream: &MediaStream,
        codecs: &CodecConfig,
        ice_servers: &[IceServer],
        trickle: bool,
    ) -> Result<()> {
        self.check_publish()?;

        if stream.is_empty() {
            return Err(WhipError::Configuration(format!(
                "media stream {} has no tracks",
                stream.id()
            )));
        }
        codecs.validate_for(stream)?;

        // Another publish or close owns the slot.
        let Ok(mut slot) = self.session.try_lock() else {
            return Err(WhipError::SessionState {
                operation: "publish",
                state: self.state(),
            });
        };

        // A session that failed after connecting still has its actor and
        // possibly a server resource.
        if let Some(previous) = slot.take() {
            debug!("Releasing the failed session before publishing again");
            previous.close(true).await;
        }

        let mut rejected = None;
        let accepted = self.status.send_if_modified(|state| {
            if state.accepts_publish() {
                *state = SessionState::Negotiating;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        if let Some(state) = rejected.filter(|_| !accepted) {
            return Err(WhipError::SessionState {
                operation: "publish",
                state,
            });
        }

        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .restart(trickle);
        info!(
            "Publishing stream {} to {} ({} tracks, trickle {})",
            stream.id(),
            self.target,
            stream.tracks().len(),
            trickle
        );

        let peer_config = PeerConfig {
            ice_servers: ice_servers.to_vec(),
            codecs: codecs.clone(),
            gather_timeout: self.config.gather_timeout(),
        };

        let (peer, events) = match self.factory.create(&peer_config) {
            Ok(created) => created,
            Err(e) => {
                let error = WhipError::negotiation(NegotiationStage::PeerSetup, e);
                self.status.send_replace(SessionState::Failed);
                let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
                info.state = SessionState::Failed;
                info.failure = Some(error.to_string());
                return Err(error);
            }
        };

        let params = SessionParams {
            target: self.target.clone(),
            token: self.config.bearer().map(str::to_string),
            trickle,
            connect_timeout: self.config.connect_timeout(),
            video_bitrate: self.config.video_bitrate,
            signaling: self.signaling.clone(),
            status: self.status.clone(),
            info: self.info.clone(),
        };

        let session = Session::new(params, peer, events).establish(stream).await?;

        let (commands, rx) = mpsc::channel(4);
        let task = tokio::spawn(session.run(rx));
        *slot = Some(SessionHandle { commands, task });

        Ok(())
    }

    /// Ends the session and releases the server resource.
    ///
    /// With `wait` the call returns after the DELETE completed; otherwise it
    /// returns after local cleanup. Closing an idle or closed client does
    /// nothing.
    pub async fn close(&self, wait: bool) -> Result<()> {
        let handle = self.lock_for_close().await?.take();

        match handle {
            Some(handle) => {
                handle.close(wait).await;
                Ok(())
            }
            None => {
                debug!("Nothing to close, session is {}", self.state());
                Ok(())
            }
        }
    }

    /// Locks the session slot. While `publish` is negotiating there is
    /// nothing to close yet; once it got past negotiation the slot is filled
    /// shortly, so wait for it.
    async fn lock_for_close(&self) -> Result<MutexGuard<'_, Option<SessionHandle>>> {
        if let Ok(slot) = self.session.try_lock() {
            return Ok(slot);
        }

        let state = self.state();
        if state == SessionState::Negotiating {
            return Err(WhipError::SessionState {
                operation: "close",
                state,
            });
        }

        Ok(self.session.lock().await)
    }
}
