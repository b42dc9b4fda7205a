use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};
use wavecast_protocol::{Envelope, SignalingConfig};

use crate::error::SessionError;
use crate::router::SessionEvent;

static CRYPTO_PROVIDER: Once = Once::new();

/// Open signaling channel toward the relay. Owns the reader/writer tasks;
/// dropping or disconnecting the handle tears the transport down. There is
/// deliberately no automatic reconnect: a lost transport surfaces as a
/// `TransportClosed` event and the caller decides what to do.
pub(crate) struct SignalingHandle {
    outbound: mpsc::Sender<Envelope>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    reader: Option<JoinHandle<()>>,
}

pub(crate) struct ConnectRequest<'a> {
    pub server_url: &'a str,
    pub stream_id: &'a str,
    pub user_id: &'a str,
    pub token: Option<&'a str>,
}

impl SignalingHandle {
    /// Queue an envelope for the relay. Fire-and-forget: a full queue or a
    /// closed transport drops the message with a log line.
    pub(crate) fn send(&self, envelope: Envelope) {
        if !self.is_connected() {
            debug!(
                kind = envelope.payload.kind(),
                "Dropping outbound envelope, signaling not connected"
            );
            return;
        }
        if let Err(e) = self.outbound.try_send(envelope) {
            warn!("Failed to queue signaling message: {e}");
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Close the transport. The writer task sends a Close frame and exits on
    /// its own; the reader is aborted so no further events are produced.
    pub(crate) fn disconnect(&mut self) {
        self.connected.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Handle with no transport behind it, for exercising routing without a
    /// relay. Messages queue into the provided channel.
    #[cfg(test)]
    pub(crate) fn stub(outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            outbound,
            connected: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
            reader: None,
        }
    }
}

impl Drop for SignalingHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Dial the relay and spawn the transport tasks. Inbound frames and the
/// transport close both arrive on the session event queue tagged with
/// `generation`.
pub(crate) async fn connect(
    request: ConnectRequest<'_>,
    config: &SignalingConfig,
    events: mpsc::Sender<SessionEvent>,
    generation: u64,
) -> Result<SignalingHandle, SessionError> {
    let mut url = format!(
        "{}/ws/stream/{}?user_id={}",
        request.server_url.trim_end_matches('/'),
        urlencoding::encode(request.stream_id),
        urlencoding::encode(request.user_id),
    );
    if let Some(token) = request.token {
        url.push_str("&token=");
        url.push_str(&urlencoding::encode(token));
    }

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);

    let connector = if url.starts_with("wss://") {
        Some(tls_connector()?)
    } else {
        None
    };

    let (ws_stream, _) =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), Some(ws_config), false, connector)
            .await
            .map_err(|e| SessionError::SignalingConnect(e.to_string()))?;
    info!(stream_id = request.stream_id, "Signaling channel connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(64);
    let connected = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::new(Notify::new());

    // Writer: serialize outbound envelopes; on shutdown, say goodbye.
    {
        let connected = Arc::clone(&connected);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    maybe = out_rx.recv() => {
                        let Some(envelope) = maybe else { break };
                        let text = match serde_json::to_string(&envelope) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to serialize envelope: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            debug!("Signaling send failed: {e}");
                            connected.store(false, Ordering::Release);
                            break;
                        }
                    }
                }
            }
        });
    }

    // Reader: raw frames go onto the session event queue; parsing and
    // routing happen there, in order with everything else.
    let reader = {
        let connected = Arc::clone(&connected);
        tokio::spawn(async move {
            let reason = loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let event = SessionEvent::Frame {
                            generation,
                            text: text.to_string(),
                        };
                        if events.send(event).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Err(e)) => break Some(e.to_string()),
                    Some(Ok(_)) => {}
                }
            };
            connected.store(false, Ordering::Release);
            let _ = events
                .send(SessionEvent::TransportClosed { generation, reason })
                .await;
        })
    };

    Ok(SignalingHandle {
        outbound: out_tx,
        connected,
        shutdown,
        reader: Some(reader),
    })
}

fn tls_connector() -> Result<tokio_tungstenite::Connector, SessionError> {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });

    let mut root_store = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!("Platform certificate store: {error}");
    }
    if native.certs.is_empty() {
        return Err(SessionError::SignalingConnect(
            "no platform root certificates available".to_string(),
        ));
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(tokio_tungstenite::Connector::Rustls(Arc::new(tls_config)))
}
