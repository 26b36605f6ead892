// Stream transport
// Tracks viewer sessions and fans each published message out to them

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::encoding::ImageEncoder;
use crate::error::{Result, TransportError};
use drishti_core::{
    DataPayload, Frame, ProcessedFrame, ServerConfig, SystemEvent, WireMessage,
};
use drishti_eye::FrameSink;

pub type SessionId = String;

/// Fan-out channel a session subscribes to.
///
/// `system` notices travel with the processed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Raw,
    Processed,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Raw => "raw",
            Channel::Processed => "processed",
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Outbound messages buffered per session before it is disconnected
    pub session_buffer: usize,
    pub max_sessions: usize,
    pub jpeg_quality: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for TransportConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            session_buffer: config.session_buffer,
            max_sessions: config.max_sessions,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

#[derive(Debug)]
struct Session {
    channels: HashSet<Channel>,
    sender: mpsc::Sender<Arc<str>>,
    // Dropped with the session; the receiving end watches for it.
    _closer: oneshot::Sender<()>,
    connected_at: DateTime<Utc>,
}

/// Receiving end of one session's queue.
///
/// Once the transport drops the session, anything still buffered is
/// discarded and both `recv` and `try_recv` report the end of the queue.
#[derive(Debug)]
pub struct SessionReceiver {
    messages: mpsc::Receiver<Arc<str>>,
    closed: oneshot::Receiver<()>,
    done: bool,
}

impl SessionReceiver {
    fn new(messages: mpsc::Receiver<Arc<str>>, closed: oneshot::Receiver<()>) -> Self {
        Self {
            messages,
            closed,
            done: false,
        }
    }

    /// Next queued message, or `None` once the session is closed.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        if self.done {
            return None;
        }
        let next = tokio::select! {
            biased;
            _ = &mut self.closed => None,
            message = self.messages.recv() => Some(message),
        };
        match next {
            Some(message) => message,
            None => {
                self.release();
                None
            }
        }
    }

    pub fn try_recv(&mut self) -> std::result::Result<Arc<str>, mpsc::error::TryRecvError> {
        if self.is_closed() {
            return Err(mpsc::error::TryRecvError::Disconnected);
        }
        self.messages.try_recv()
    }

    pub fn is_closed(&mut self) -> bool {
        if self.done {
            return true;
        }
        match self.closed.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => false,
            _ => {
                self.release();
                true
            }
        }
    }

    fn release(&mut self) {
        self.done = true;
        self.messages.close();
        while self.messages.try_recv().is_ok() {}
    }
}

/// Counters for `/health` and `/metrics`.
#[derive(Debug, Default)]
pub struct TransportStats {
    raw_sent: AtomicU64,
    processed_sent: AtomicU64,
    system_sent: AtomicU64,
    evicted: AtomicU64,
    encode_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub raw_sent: u64,
    pub processed_sent: u64,
    pub system_sent: u64,
    pub evicted: u64,
    pub encode_failures: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            raw_sent: self.raw_sent.load(Ordering::Relaxed),
            processed_sent: self.processed_sent.load(Ordering::Relaxed),
            system_sent: self.system_sent.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Server-side fan-out of the raw and processed channels.
///
/// Publishing never blocks: each session has a bounded queue drained by its
/// own socket task, and a session whose queue is full or closed is dropped
/// from the registry on the spot. Dropping a session ends its socket task
/// without flushing what was still queued.
pub struct StreamTransport {
    sessions: RwLock<HashMap<SessionId, Session>>,
    encoder: ImageEncoder,
    config: TransportConfig,
    stats: TransportStats,
}

impl StreamTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            encoder: ImageEncoder::new(config.jpeg_quality),
            config,
            stats: TransportStats::default(),
        }
    }

    /// Register a new session and queue its `connected` notice.
    pub fn register_session(
        &self,
        channels: &[Channel],
    ) -> Result<(SessionId, SessionReceiver)> {
        let notice: Arc<str> = WireMessage::system(&SystemEvent::connected()).to_json()?.into();
        let (tx, rx) = mpsc::channel(self.config.session_buffer.max(1));
        let (closer, closed) = oneshot::channel();
        let session_id = Uuid::new_v4().to_string();

        let mut sessions = self.sessions.write();
        if sessions.len() >= self.config.max_sessions {
            return Err(TransportError::SessionLimit(self.config.max_sessions));
        }

        // Fresh queue, so this cannot be full.
        let _ = tx.try_send(notice);
        sessions.insert(
            session_id.clone(),
            Session {
                channels: channels.iter().copied().collect(),
                sender: tx,
                _closer: closer,
                connected_at: Utc::now(),
            },
        );
        let active = sessions.len();
        drop(sessions);

        gauge!("drishti_sessions_active").set(active as f64);
        info!(
            "Stream session registered: {} (channels: {:?}, active: {})",
            session_id, channels, active
        );
        Ok((session_id, SessionReceiver::new(rx, closed)))
    }

    /// Remove a session. Returns `false` when it was already gone.
    pub fn unregister_session(&self, session_id: &str) -> bool {
        let (removed, active) = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(session_id);
            (removed, sessions.len())
        };

        match removed {
            Some(session) => {
                gauge!("drishti_sessions_active").set(active as f64);
                let connected_for = Utc::now() - session.connected_at;
                info!(
                    "Stream session unregistered: {} (after {}s)",
                    session_id,
                    connected_for.num_seconds()
                );
                true
            }
            None => false,
        }
    }

    /// Drop every session, which closes their sockets. Messages still
    /// queued for them are discarded.
    pub fn close_all(&self) -> usize {
        let closed = {
            let mut sessions = self.sessions.write();
            let n = sessions.len();
            sessions.clear();
            n
        };
        gauge!("drishti_sessions_active").set(0.0);
        if closed > 0 {
            info!("Closed {} stream sessions", closed);
        }
        closed
    }

    /// Send to one session, with the same eviction rules as a broadcast.
    pub fn send_to_session(&self, session_id: &str, message: &WireMessage) -> Result<()> {
        let text: Arc<str> = message.to_json()?.into();
        let outcome = {
            let sessions = self.sessions.read();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| TransportError::SessionNotFound(session_id.to_string()))?;
            session.sender.try_send(text)
        };
        if let Err(e) = outcome {
            self.evict(&[(session_id.to_string(), eviction_reason(&e))]);
        }
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| s.channels.contains(&channel))
            .count()
    }

    pub fn stats(&self) -> TransportSnapshot {
        self.stats.snapshot()
    }

    /// Deliver one serialized message to every subscriber of `channel`.
    /// Returns the number of sessions it was queued for.
    fn broadcast(&self, channel: Channel, text: Arc<str>) -> usize {
        let mut sent = 0;
        let mut dead = Vec::new();
        {
            let sessions = self.sessions.read();
            for (id, session) in sessions.iter() {
                if !session.channels.contains(&channel) {
                    continue;
                }
                match session.sender.try_send(text.clone()) {
                    Ok(()) => sent += 1,
                    Err(e) => dead.push((id.clone(), eviction_reason(&e))),
                }
            }
        }

        if !dead.is_empty() {
            self.evict(&dead);
        }
        sent
    }

    fn evict(&self, dead: &[(SessionId, &'static str)]) {
        let active = {
            let mut sessions = self.sessions.write();
            for (id, reason) in dead {
                if sessions.remove(id).is_some() {
                    warn!("Disconnecting stream session {}: {}", id, reason);
                    self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                    counter!("drishti_sessions_evicted_total").increment(1);
                }
            }
            sessions.len()
        };
        gauge!("drishti_sessions_active").set(active as f64);
    }

    fn serialize(&self, message: &WireMessage) -> Option<Arc<str>> {
        match message.to_json() {
            Ok(json) => Some(json.into()),
            Err(e) => {
                warn!("Failed to serialize {} message: {}", message.kind(), e);
                None
            }
        }
    }
}

fn eviction_reason<T>(e: &mpsc::error::TrySendError<T>) -> &'static str {
    match e {
        mpsc::error::TrySendError::Full(_) => "outbound buffer full",
        mpsc::error::TrySendError::Closed(_) => "connection closed",
    }
}

impl FrameSink for StreamTransport {
    fn publish_raw(&self, frame: &Frame) {
        if self.subscriber_count(Channel::Raw) == 0 {
            return;
        }
        let (Some(pixels), Some((height, width))) = (frame.pixels.as_ref(), frame.resolution()) else {
            debug!("Frame {} has no pixels, not sent on raw channel", frame.id);
            return;
        };

        let image = match self.encoder.encode_pixels(pixels) {
            Ok(image) => image,
            Err(e) => {
                self.stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                debug!("Frame {} not encodable for raw channel: {}", frame.id, e);
                return;
            }
        };

        let message = WireMessage::RawFrame {
            frame_id: frame.id,
            timestamp: frame.timestamp,
            image,
            resolution: [height, width],
        };
        if let Some(text) = self.serialize(&message) {
            let sent = self.broadcast(Channel::Raw, text);
            self.stats.raw_sent.fetch_add(sent as u64, Ordering::Relaxed);
        }
    }

    fn publish_processed(&self, processed: ProcessedFrame) {
        let image_data = processed.result.enhanced.as_ref().and_then(|enhanced| {
            match self.encoder.encode_pixels(enhanced) {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    self.stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Enhanced image for frame {} not encodable: {}", processed.frame_id, e);
                    None
                }
            }
        });

        let message = WireMessage::Data {
            payload: DataPayload::from_processed(&processed, image_data),
        };
        if let Some(text) = self.serialize(&message) {
            let sent = self.broadcast(Channel::Processed, text);
            self.stats.processed_sent.fetch_add(sent as u64, Ordering::Relaxed);
        }
    }

    fn publish_system(&self, event: SystemEvent) {
        info!("System notice: {:?} {}", event.status, event.message.as_deref().unwrap_or(""));
        if let Some(text) = self.serialize(&WireMessage::system(&event)) {
            let sent = self.broadcast(Channel::Processed, text);
            self.stats.system_sent.fetch_add(sent as u64, Ordering::Relaxed);
        }
    }
}
