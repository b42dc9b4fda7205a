//! End-to-end session tests against an in-process WebSocket relay stand-in.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use wavecast_client::{
    ConnectionState, Identity, MediaConstraints, SampleTrackSource, Session, SessionError,
    SessionState, StreamOptions,
};
use wavecast_protocol::{ChatMessage, ClientConfig, Envelope, Payload};

async fn relay_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.server_url = format!("ws://{addr}");
    config.ice.stun_urls = Vec::new();
    config
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no connection within 5s")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn next_envelope(ws: &mut WebSocketStream<TcpStream>) -> Envelope {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame within 5s")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_envelope(ws: &mut WebSocketStream<TcpStream>, envelope: &Envelope) {
    let text = serde_json::to_string(envelope).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn wait_for(session: &Session, predicate: impl Fn(&SessionState) -> bool) -> SessionState {
    for _ in 0..100 {
        let state = session.snapshot();
        if predicate(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

fn new_session(addr: SocketAddr) -> Session {
    Session::new(client_config(addr), Arc::new(SampleTrackSource))
}

#[tokio::test]
async fn viewer_joins_and_stops_cleanly() {
    let (listener, addr) = relay_listener().await;
    let session = new_session(addr);

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        // Hold the connection open until the client closes it.
        while let Some(Ok(message)) = ws.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    session
        .join_stream("s1", &Identity::new("alice"))
        .await
        .unwrap();
    let state = session.snapshot();
    assert!(state.is_connected);
    assert!(state.is_viewing);
    assert!(!state.is_streaming);
    assert_eq!(state.connection_state, ConnectionState::Viewing);
    assert_eq!(state.session_id.as_deref(), Some("s1"));

    session.stop_viewing().await;
    let state = session.snapshot();
    assert!(!state.is_connected);
    assert!(!state.is_viewing);
    assert_eq!(state.connection_state, ConnectionState::Disconnected);
    assert!(state.session_id.is_none());

    // Stopping again must be harmless.
    session.stop_viewing().await;

    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn chat_round_trip_through_the_relay() {
    let (listener, addr) = relay_listener().await;
    let session = new_session(addr);

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;

        // Client chat line arrives trimmed, content only.
        let envelope = next_envelope(&mut ws).await;
        match &envelope.payload {
            Payload::ChatMessage(msg) => {
                assert_eq!(msg.content, "hello room");
                assert!(msg.user_id.is_none());
                assert!(msg.message_id.is_none());
            }
            other => panic!("Expected chat, got {}", other.kind()),
        }
        assert_eq!(envelope.stream_id, "s1");

        // Echo it back stamped, the way the relay does.
        let mut stamped = Envelope::new(
            Payload::ChatMessage(ChatMessage {
                message_id: Some("m1".into()),
                user_id: Some("alice".into()),
                content: "hello room".into(),
                timestamp: Some(Utc::now()),
            }),
            "s1",
        );
        stamped.sender_id = Some("alice".into());
        send_envelope(&mut ws, &stamped).await;

        while let Some(Ok(message)) = ws.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    session
        .join_stream("s1", &Identity::new("alice"))
        .await
        .unwrap();
    session.send_chat_message("  hello room  ");

    // Nothing local until the echo lands.
    let state = wait_for(&session, |s| !s.chat_log.is_empty()).await;
    assert_eq!(state.chat_log.len(), 1);
    assert_eq!(state.chat_log[0].content, "hello room");
    assert_eq!(state.chat_log[0].user_id.as_deref(), Some("alice"));
    assert!(state.chat_log[0].timestamp.is_some());

    session.stop_viewing().await;
    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn server_stream_ended_stops_viewing() {
    let (listener, addr) = relay_listener().await;
    let session = new_session(addr);

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send_envelope(&mut ws, &Envelope::new(Payload::StreamEnded {}, "s1")).await;
        while let Some(Ok(message)) = ws.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    session
        .join_stream("s1", &Identity::new("bob"))
        .await
        .unwrap();
    let state = wait_for(&session, |s| !s.is_viewing).await;
    assert!(!state.is_connected);
    assert_eq!(state.connection_state, ConnectionState::Disconnected);
    assert!(state.session_id.is_none());

    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn restart_closes_the_previous_signaling_channel() {
    let (listener, addr) = relay_listener().await;
    let session = new_session(addr);

    // Hand accepted connections over as they arrive, so the client's
    // handshake never waits on the test body.
    let (conn_tx, mut conn_rx) = tokio::sync::mpsc::channel(2);
    tokio::spawn(async move {
        for _ in 0..2 {
            let ws = accept(&listener).await;
            if conn_tx.send(ws).await.is_err() {
                return;
            }
        }
    });

    session
        .start_streaming("s1", &Identity::new("carol"), StreamOptions::default())
        .await
        .unwrap();
    let mut first = conn_rx.recv().await.unwrap();

    // Going live announces the stream.
    let envelope = next_envelope(&mut first).await;
    assert!(matches!(envelope.payload, Payload::StreamStarted { .. }));
    assert_eq!(envelope.stream_id, "s1");
    assert_eq!(session.snapshot().connection_state, ConnectionState::Streaming);

    // Starting again supersedes the first incarnation entirely.
    session
        .start_streaming(
            "s2",
            &Identity::new("carol"),
            StreamOptions {
                title: Some("take two".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut second = conn_rx.recv().await.unwrap();

    // The first channel sees a close, not more traffic.
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "first connection was not closed");

    let envelope = next_envelope(&mut second).await;
    match envelope.payload {
        Payload::StreamStarted { title } => assert_eq!(title.as_deref(), Some("take two")),
        other => panic!("Expected stream_started, got {}", other.kind()),
    }
    assert_eq!(session.snapshot().session_id.as_deref(), Some("s2"));

    session.stop_streaming().await;
}

#[tokio::test]
async fn stop_during_connect_cancels_the_join() {
    let (listener, addr) = relay_listener().await;
    let session = Arc::new(new_session(addr));

    // Accept the TCP connection but hold the WebSocket handshake until
    // released, so the join stays suspended in its connect.
    let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = accepted_tx.send(());
        let _ = release_rx.await;
        if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        }
    });

    let join = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.join_stream("s1", &Identity::new("zoe")).await })
    };
    timeout(Duration::from_secs(5), accepted_rx)
        .await
        .unwrap()
        .unwrap();

    // The stop lands while the join is still waiting on the handshake.
    session.stop_viewing().await;
    release_tx.send(()).unwrap();

    let result = timeout(Duration::from_secs(5), join).await.unwrap().unwrap();
    assert!(result.is_err(), "a superseded join must not report success");

    // The late continuation must not resurrect the session.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = session.snapshot();
    assert!(!state.is_connected);
    assert!(!state.is_viewing);
    assert!(state.session_id.is_none());
    assert_eq!(state.connection_state, ConnectionState::Disconnected);
    assert!(state.last_error.is_none());

    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn start_streaming_reuses_an_initialized_camera() {
    let (listener, addr) = relay_listener().await;
    let session = new_session(addr);

    let camera = session
        .initialize_camera(MediaConstraints::default())
        .await
        .unwrap();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        while let Some(Ok(message)) = ws.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    session
        .start_streaming("s1", &Identity::new("carol"), StreamOptions::default())
        .await
        .unwrap();

    // The pre-acquired capture is still live and is the one being streamed.
    assert!(!camera.is_stopped());
    let state = session.snapshot();
    assert!(state.local_media.as_ref().unwrap().same_handle(&camera));

    session.stop_streaming().await;
    assert!(camera.is_stopped());
    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn connect_failure_leaves_the_session_unstarted() {
    // Bind and immediately drop to get an address nobody listens on.
    let (listener, addr) = relay_listener().await;
    drop(listener);

    let session = new_session(addr);
    let result = session.join_stream("s1", &Identity::new("dave")).await;
    assert!(matches!(result, Err(SessionError::SignalingConnect(_))));

    let state = session.snapshot();
    assert!(state.session_id.is_none());
    assert_eq!(state.connection_state, ConnectionState::Disconnected);
    assert!(!state.is_connected);
    assert!(matches!(
        state.last_error,
        Some(SessionError::SignalingConnect(_))
    ));
}

#[tokio::test]
async fn lost_transport_is_surfaced_without_killing_the_session_object() {
    let (listener, addr) = relay_listener().await;
    let session = new_session(addr);

    let server = tokio::spawn(async move {
        let ws = accept(&listener).await;
        // Drop without a close handshake: abnormal loss.
        drop(ws);
    });

    session
        .join_stream("s1", &Identity::new("erin"))
        .await
        .unwrap();
    let state = wait_for(&session, |s| !s.is_connected).await;
    assert_eq!(state.connection_state, ConnectionState::Disconnected);

    // The session object is still usable for a fresh join attempt.
    session.stop_viewing().await;
    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}
