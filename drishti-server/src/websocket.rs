// WebSocket endpoints: viewers out, phone camera frames in

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::encoding::decode_base64_image;
use crate::http::{injection_disabled, AppState};
use crate::transport::{Channel, StreamTransport};
use drishti_core::WireMessage;
use drishti_eye::FrameInjector;

/// `GET /ws/stream`: processed results and system notices
pub async fn stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.transport, Channel::Processed))
}

/// `GET /ws/raw_feed`: raw frames only
pub async fn raw_feed_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.transport, Channel::Raw))
}

/// `GET /ws/upload`: a phone camera sends `{"frame": "<base64 JPEG>"}`
/// messages that feed the injected source.
pub async fn upload_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Some(injector) = state.injector else {
        return injection_disabled();
    };
    ws.on_upgrade(move |socket| handle_upload(socket, injector))
}

async fn handle_socket(socket: WebSocket, transport: Arc<StreamTransport>, channel: Channel) {
    let (session_id, mut rx) = match transport.register_session(&[channel]) {
        Ok(registered) => registered,
        Err(e) => {
            warn!("Rejecting {} stream connection: {}", channel.as_str(), e);
            let _ = socket.close().await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    // Forward queued messages until the transport drops this session.
    let send_id = session_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sender.send(Message::Text(text.to_string())).await {
                debug!("Send to {} failed: {}", send_id, e);
                break;
            }
        }
        let _ = sender.close().await;
    });

    let recv_id = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => handle_message(&text, &recv_id),
                Ok(Message::Binary(_)) => {
                    warn!("Received binary message from {}, ignoring", recv_id);
                }
                Ok(Message::Close(_)) => {
                    debug!("Stream session {} closed by viewer", recv_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Err(e) => {
                    error!("WebSocket error from {}: {}", recv_id, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            debug!("Send task completed for session {}", session_id);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!("Receive task completed for session {}", session_id);
            send_task.abort();
        }
    }

    transport.unregister_session(&session_id);
    info!("Stream connection closed: {}", session_id);
}

#[derive(Debug, Deserialize)]
struct UploadMessage {
    #[serde(default)]
    frame: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upload {
    Accepted,
    /// Decoded, but the frame queue was full
    Dropped,
    Skipped,
}

async fn handle_upload(mut socket: WebSocket, injector: FrameInjector) {
    info!("Phone camera connected");
    let mut received = 0u64;

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                let outcome = ingest_upload(&text, &injector);
                if outcome != Upload::Skipped {
                    received += 1;
                    if received % 30 == 0 {
                        debug!("Received {} uploaded frames (last {:?})", received, outcome);
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!("Received binary upload message, expected JSON text");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                warn!("Upload socket error: {}", e);
                break;
            }
        }
    }

    info!("Phone camera disconnected after {} frames", received);
}

/// Decode one upload message and queue its frame. Bad input is logged and
/// skipped so one broken frame never ends the upload.
fn ingest_upload(text: &str, injector: &FrameInjector) -> Upload {
    let message: UploadMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Malformed upload message: {}", e);
            return Upload::Skipped;
        }
    };
    // heartbeat
    let Some(frame) = message.frame else {
        return Upload::Skipped;
    };

    match decode_base64_image(&frame) {
        Ok(pixels) => {
            if injector.push(pixels) {
                Upload::Accepted
            } else {
                Upload::Dropped
            }
        }
        Err(e) => {
            warn!("Skipping uploaded frame: {}", e);
            Upload::Skipped
        }
    }
}

/// Viewers have nothing to say on these sockets; inbound text is decoded
/// only so that garbage shows up in the logs.
fn handle_message(text: &str, session_id: &str) {
    match WireMessage::from_json(text) {
        Ok(WireMessage::Unknown) => {
            debug!("Ignoring message of unknown type from {}", session_id);
        }
        Ok(message) => {
            debug!("Ignoring inbound {} message from {}", message.kind(), session_id);
        }
        Err(e) => {
            warn!("Malformed message from {}: {}", session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::create_router;
    use crate::transport::TransportConfig;
    use crate::encoding::ImageEncoder;
    use drishti_core::{ChannelOrder, PixelBuffer, SystemStatus};
    use drishti_eye::{FrameSource, InjectedSource, SchedulerStats};
    use std::time::Duration;
    use tokio_test::assert_ok;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    async fn serve(transport: Arc<StreamTransport>) -> String {
        serve_with(transport, None).await
    }

    async fn serve_with(transport: Arc<StreamTransport>, injector: Option<FrameInjector>) -> String {
        let state = AppState::new(transport, Arc::new(SchedulerStats::default()), injector);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, create_router(state)).await;
        });
        format!("ws://{}", addr)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_socket() {
        let transport = Arc::new(StreamTransport::new(TransportConfig::default()));
        let base = serve(transport.clone()).await;

        let (mut socket, _) = assert_ok!(connect_async(format!("{}/ws/stream", base)).await);
        let first = socket.next().await.unwrap().unwrap();
        let WsMessage::Text(text) = first else {
            panic!("expected text, got {:?}", first);
        };
        assert!(matches!(
            WireMessage::from_json(&text).unwrap(),
            WireMessage::System { status: SystemStatus::Connected, .. }
        ));
        assert_eq!(transport.subscriber_count(Channel::Processed), 1);
        assert_eq!(transport.subscriber_count(Channel::Raw), 0);

        // garbage from a viewer is logged, not fatal
        assert_ok!(socket.send(WsMessage::Text("{not json".to_string())).await);
        assert_ok!(socket.send(WsMessage::Text(r#"{"type":"subscribe"}"#.to_string())).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.session_count(), 1);

        assert_ok!(socket.close(None).await);
        wait_until(|| transport.session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_session_limit_closes_socket() {
        let transport = Arc::new(StreamTransport::new(TransportConfig {
            session_buffer: 8,
            max_sessions: 1,
            jpeg_quality: 80,
        }));
        let base = serve(transport.clone()).await;

        let (_first, _) = assert_ok!(connect_async(format!("{}/ws/raw_feed", base)).await);
        wait_until(|| transport.session_count() == 1).await;

        let (mut second, _) = assert_ok!(connect_async(format!("{}/ws/raw_feed", base)).await);
        match second.next().await {
            None | Some(Ok(WsMessage::Close(_))) | Some(Err(_)) => {}
            Some(Ok(other)) => panic!("expected close, got {:?}", other),
        }
        assert_eq!(transport.session_count(), 1);
    }

    fn frame_message(width: usize, height: usize) -> String {
        let pixels =
            PixelBuffer::from_hwc(height, width, vec![90; height * width * 3], ChannelOrder::Rgb)
                .unwrap();
        let encoded = ImageEncoder::default().encode_pixels(&pixels).unwrap();
        serde_json::json!({ "frame": encoded }).to_string()
    }

    #[test]
    fn test_ingest_upload_skips_bad_input() {
        let (injector, _source) = InjectedSource::channel(10);

        assert_eq!(ingest_upload("{not json", &injector), Upload::Skipped);
        assert_eq!(ingest_upload(r#"{"ping":true}"#, &injector), Upload::Skipped);
        assert_eq!(ingest_upload(r#"{"frame":"@@@"}"#, &injector), Upload::Skipped);
        // valid base64 that is not an image
        assert_eq!(ingest_upload(r#"{"frame":"aGVsbG8="}"#, &injector), Upload::Skipped);
        assert_eq!(injector.accepted(), 0);

        assert_eq!(ingest_upload(&frame_message(8, 6), &injector), Upload::Accepted);
        assert_eq!(injector.accepted(), 1);
    }

    #[test]
    fn test_ingest_upload_drops_when_queue_full() {
        let (injector, _source) = InjectedSource::channel(1);
        let message = frame_message(4, 4);
        assert_eq!(ingest_upload(&message, &injector), Upload::Accepted);
        assert_eq!(ingest_upload(&message, &injector), Upload::Dropped);
        assert_eq!(injector.dropped(), 1);
    }

    #[tokio::test]
    async fn test_upload_socket_feeds_injected_source() {
        let transport = Arc::new(StreamTransport::new(TransportConfig::default()));
        let (injector, mut source) = InjectedSource::channel(10);
        let base = serve_with(transport, Some(injector.clone())).await;

        let (mut socket, _) = assert_ok!(connect_async(format!("{}/ws/upload", base)).await);
        // garbage first; the connection survives it
        assert_ok!(socket.send(WsMessage::Text("{not json".to_string())).await);
        assert_ok!(socket.send(WsMessage::Text(frame_message(12, 10))).await);

        let frame = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::task::spawn_blocking(move || source.next_frame()),
        )
        .await
        .expect("uploaded frame not injected")
        .unwrap()
        .unwrap();
        assert_eq!(frame.id, 0);
        assert_eq!(frame.resolution(), Some((10, 12)));
        assert_eq!(injector.accepted(), 1);

        assert_ok!(socket.close(None).await);
    }

    #[tokio::test]
    async fn test_upload_socket_disabled_without_injector() {
        let transport = Arc::new(StreamTransport::new(TransportConfig::default()));
        let base = serve(transport).await;

        match connect_async(format!("{}/ws/upload", base)).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 404);
            }
            Err(e) => panic!("unexpected error {:?}", e),
            Ok(_) => panic!("upload socket accepted without an injector"),
        }
    }
}
