use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use wavecast_protocol::{ClientConfig, Envelope, Payload};

use crate::error::SessionError;
use crate::media::{LocalMedia, MediaConstraints, MediaSource};
use crate::registry::PeerRegistry;
use crate::router::{self, SessionEvent};
use crate::signaling::{self, ConnectRequest, SignalingHandle};
use crate::state::{ConnectionState, Role, SessionAction, SessionState};

/// Who we are toward the relay. The token is opaque here; the relay or a
/// fronting proxy validates it.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub token: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Options for going live.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub title: Option<String>,
    pub constraints: MediaConstraints,
}

/// State owned jointly by the session facade and its router task.
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) registry: tokio::sync::Mutex<PeerRegistry>,
    pub(crate) events_tx: mpsc::Sender<SessionEvent>,
    state: RwLock<SessionState>,
    signaling: Mutex<Option<SignalingHandle>>,
    /// Incremented on every teardown; events from older incarnations are
    /// dropped by the router.
    generation: AtomicU64,
}

impl Shared {
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn apply(&self, action: SessionAction) {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply(action);
    }

    pub(crate) fn snapshot(&self) -> SessionState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn current_stream_id(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .session_id
            .clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_connected
    }

    /// Queue an envelope on the signaling channel, if one is open.
    pub(crate) fn send_envelope(&self, envelope: Envelope) {
        let guard = self
            .signaling
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(handle) => handle.send(envelope),
            None => debug!(
                kind = envelope.payload.kind(),
                "Dropping outbound envelope, no signaling channel"
            ),
        }
    }

    /// Swap in a new signaling handle, returning the previous one.
    pub(crate) fn set_signaling(&self, handle: Option<SignalingHandle>) -> Option<SignalingHandle> {
        let mut guard = self
            .signaling
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, handle)
    }
}

/// Tear down whatever session is active: invalidate in-flight continuations,
/// close the signaling channel, close every peer link, optionally release
/// local media, and reset the state. Idempotent.
pub(crate) async fn shutdown(shared: &Arc<Shared>, stop_media: bool) {
    shared.bump_generation();
    if let Some(mut handle) = shared.set_signaling(None) {
        handle.disconnect();
    }
    let links = shared.registry.lock().await.drain();
    for link in links {
        link.close().await;
    }
    if stop_media {
        if let Some(media) = shared.snapshot().local_media {
            media.stop();
        }
        shared.apply(SessionAction::SetLocalMedia(None));
    }
    shared.apply(SessionAction::Reset);
}

/// One streaming session: the signaling channel, the peer links, and a
/// snapshot-readable state store, driven by a single event-processing task.
///
/// Must be created inside a Tokio runtime.
pub struct Session {
    shared: Arc<Shared>,
    media_source: Arc<dyn MediaSource>,
    router: JoinHandle<()>,
}

impl Session {
    pub fn new(config: ClientConfig, media_source: Arc<dyn MediaSource>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let chat_limit = config.chat.history_limit;
        let shared = Arc::new(Shared {
            config,
            registry: tokio::sync::Mutex::new(PeerRegistry::new()),
            events_tx,
            state: RwLock::new(SessionState::new(chat_limit)),
            signaling: Mutex::new(None),
            generation: AtomicU64::new(0),
        });
        let router = tokio::spawn(router::run(Arc::clone(&shared), events_rx));
        Self {
            shared,
            media_source,
            router,
        }
    }

    /// Acquire local capture ahead of going live, so the first viewer does
    /// not wait on device setup. The acquisition survives stop/start cycles.
    pub async fn initialize_camera(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMedia, SessionError> {
        match self.open_media(constraints).await {
            Ok(media) => {
                self.shared
                    .apply(SessionAction::SetLocalMedia(Some(media.clone())));
                Ok(media)
            }
            Err(e) => {
                self.shared.apply(SessionAction::SetError(Some(e.clone())));
                Err(e)
            }
        }
    }

    /// Go live on `stream_id`. Any active session is torn down first. On
    /// media or connect failure the session stays unstarted and the error is
    /// both returned and recorded on the state. A stop issued while this
    /// call is suspended cancels it: the continuation re-checks the session
    /// generation after every await and backs out without touching state.
    pub async fn start_streaming(
        &self,
        stream_id: &str,
        identity: &Identity,
        options: StreamOptions,
    ) -> Result<(), SessionError> {
        validate_ids(stream_id, identity)?;
        shutdown(&self.shared, false).await;
        let generation = self.shared.generation();

        // Media first: without capture there is nothing to stream. A camera
        // already acquired through `initialize_camera` is reused as-is.
        let (media, fresh_media) = match self.shared.snapshot().local_media {
            Some(media) if !media.is_stopped() => (media, false),
            _ => match self.open_media(options.constraints).await {
                Ok(media) => (media, true),
                Err(e) => {
                    self.shared.apply(SessionAction::SetError(Some(e.clone())));
                    return Err(e);
                }
            },
        };
        if self.shared.generation() != generation {
            if fresh_media {
                media.stop();
            }
            return Err(superseded());
        }

        self.shared.apply(SessionAction::SetCurrentSession {
            session_id: Some(stream_id.to_string()),
            role: Some(Role::Streamer),
        });
        self.shared.apply(SessionAction::SetConnectionState(
            ConnectionState::Connecting,
        ));

        match self.connect_signaling(stream_id, identity, generation).await {
            Ok(mut handle) => {
                if self.shared.generation() != generation {
                    handle.disconnect();
                    if fresh_media {
                        media.stop();
                    }
                    return Err(superseded());
                }
                if let Some(mut old) = self.shared.set_signaling(Some(handle)) {
                    old.disconnect();
                }
                self.shared
                    .apply(SessionAction::SetLocalMedia(Some(media)));
                self.shared.apply(SessionAction::SetConnected(true));
                self.shared.apply(SessionAction::SetConnectionState(
                    ConnectionState::Connected,
                ));
                self.shared.apply(SessionAction::SetConnectionState(
                    ConnectionState::Streaming,
                ));
                self.shared.apply(SessionAction::SetStreaming(true));
                self.shared.send_envelope(Envelope::new(
                    Payload::StreamStarted {
                        title: options.title,
                    },
                    stream_id,
                ));
                info!(%stream_id, "Streaming started");
                Ok(())
            }
            Err(e) => {
                if fresh_media {
                    // Acquired for this start only.
                    media.stop();
                }
                if self.shared.generation() == generation {
                    self.shared.apply(SessionAction::SetCurrentSession {
                        session_id: None,
                        role: None,
                    });
                    self.shared.apply(SessionAction::SetConnectionState(
                        ConnectionState::Disconnected,
                    ));
                    self.shared.apply(SessionAction::SetError(Some(e.clone())));
                }
                Err(e)
            }
        }
    }

    /// Join `stream_id` as a viewer. No local media is acquired; the chat
    /// log from any previous session is cleared. Like `start_streaming`, a
    /// stop issued while the connect is in flight cancels the join.
    pub async fn join_stream(
        &self,
        stream_id: &str,
        identity: &Identity,
    ) -> Result<(), SessionError> {
        validate_ids(stream_id, identity)?;
        shutdown(&self.shared, false).await;
        let generation = self.shared.generation();

        self.shared.apply(SessionAction::ClearChat);
        self.shared.apply(SessionAction::SetCurrentSession {
            session_id: Some(stream_id.to_string()),
            role: Some(Role::Viewer),
        });
        self.shared.apply(SessionAction::SetConnectionState(
            ConnectionState::Connecting,
        ));

        match self.connect_signaling(stream_id, identity, generation).await {
            Ok(mut handle) => {
                if self.shared.generation() != generation {
                    handle.disconnect();
                    return Err(superseded());
                }
                if let Some(mut old) = self.shared.set_signaling(Some(handle)) {
                    old.disconnect();
                }
                self.shared.apply(SessionAction::SetConnected(true));
                self.shared.apply(SessionAction::SetConnectionState(
                    ConnectionState::Connected,
                ));
                self.shared
                    .apply(SessionAction::SetConnectionState(ConnectionState::Viewing));
                self.shared.apply(SessionAction::SetViewing(true));
                info!(%stream_id, "Joined stream");
                Ok(())
            }
            Err(e) => {
                if self.shared.generation() == generation {
                    self.shared.apply(SessionAction::SetCurrentSession {
                        session_id: None,
                        role: None,
                    });
                    self.shared.apply(SessionAction::SetConnectionState(
                        ConnectionState::Disconnected,
                    ));
                    self.shared.apply(SessionAction::SetError(Some(e.clone())));
                }
                Err(e)
            }
        }
    }

    /// Stop broadcasting: announce the end of the stream, tear everything
    /// down, and release local media. Safe to call when not streaming.
    pub async fn stop_streaming(&self) {
        if let Some(stream_id) = self.shared.current_stream_id() {
            if self.shared.snapshot().is_streaming {
                self.shared
                    .send_envelope(Envelope::new(Payload::StreamEnded {}, stream_id));
            }
        }
        shutdown(&self.shared, true).await;
    }

    /// Leave a viewed stream. Local media, if any was initialized, is kept.
    pub async fn stop_viewing(&self) {
        shutdown(&self.shared, false).await;
    }

    /// Send a chat line. Fire-and-forget: silently ignored when not
    /// connected, whitespace-only content is dropped. The message appears in
    /// the local chat log only when the server echoes it back.
    pub fn send_chat_message(&self, text: &str) {
        if !self.shared.is_connected() {
            debug!("Ignoring chat message, not connected");
            return;
        }
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let Some(stream_id) = self.shared.current_stream_id() else {
            return;
        };
        self.shared.send_envelope(Envelope::chat(trimmed, stream_id));
    }

    /// Point-in-time copy of the session state.
    pub fn snapshot(&self) -> SessionState {
        self.shared.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    async fn open_media(&self, constraints: MediaConstraints) -> Result<LocalMedia, SessionError> {
        let source = Arc::clone(&self.media_source);
        tokio::task::spawn_blocking(move || source.open(&constraints))
            .await
            .map_err(|e| SessionError::MediaAccess(format!("capture task failed: {e}")))?
    }

    async fn connect_signaling(
        &self,
        stream_id: &str,
        identity: &Identity,
        generation: u64,
    ) -> Result<SignalingHandle, SessionError> {
        signaling::connect(
            ConnectRequest {
                server_url: &self.shared.config.server_url,
                stream_id,
                user_id: &identity.user_id,
                token: identity.token.as_deref(),
            },
            &self.shared.config.signaling,
            self.shared.events_tx.clone(),
            generation,
        )
        .await
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.router.abort();
        if let Some(mut handle) = self.shared.set_signaling(None) {
            handle.disconnect();
        }
    }
}

/// A newer stop or start invalidated this one mid-flight.
fn superseded() -> SessionError {
    SessionError::SignalingConnect("session was stopped during startup".to_string())
}

fn validate_ids(stream_id: &str, identity: &Identity) -> Result<(), SessionError> {
    if stream_id.trim().is_empty() {
        return Err(SessionError::SignalingConnect(
            "stream id must not be empty".to_string(),
        ));
    }
    if identity.user_id.trim().is_empty() {
        return Err(SessionError::SignalingConnect(
            "user id must not be empty".to_string(),
        ));
    }
    Ok(())
}
