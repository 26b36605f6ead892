//! Stream client actor.
//!
//! One task owns the [`ClientSession`], its socket and its single pending
//! timer. Timers and connect attempts run as child tasks that post messages
//! back to the actor tagged with a generation; anything tagged with an old
//! generation is ignored, and the child task itself is aborted whenever it is
//! superseded or the client shuts down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::connector::{Connection, Connector};
use crate::error::{ClientError, Result};
use crate::fps::FpsMeter;
use crate::session::{ClientSession, SessionAction};
use drishti_core::{ConnectionState, DataPayload, ReconnectConfig, SystemStatus, WireMessage};

/// What a viewer sees.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    State(ConnectionState),
    /// An accepted, in-order `data` message.
    Data(DataPayload),
    Raw {
        frame_id: u64,
        timestamp: f64,
        image: String,
        resolution: [usize; 2],
    },
    System {
        status: SystemStatus,
        message: Option<String>,
        cause: Option<String>,
    },
    Fps(f64),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub backoff: Backoff,
    pub fps_window: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, reconnect: &ReconnectConfig) -> Self {
        Self {
            url: url.into(),
            backoff: Backoff::from_config(reconnect),
            fps_window: Duration::from_secs(1),
        }
    }
}

enum Command {
    Retry,
    Shutdown,
}

enum Internal {
    Opened {
        generation: u64,
        result: Result<Box<dyn Connection>>,
    },
    ReconnectDue {
        generation: u64,
    },
}

/// Handle to a running client actor.
pub struct StreamClient {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl StreamClient {
    /// Start connecting immediately. Events arrive on the returned receiver
    /// until the client shuts down.
    pub fn spawn<C: Connector>(
        config: ClientConfig,
        connector: C,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = Actor {
            url: config.url,
            connector: Arc::new(connector),
            session: ClientSession::new(config.backoff),
            connection: None,
            pending: None,
            generation: 0,
            internal: internal_tx,
            events: event_tx,
            state: state_tx,
            fps: FpsMeter::new(config.fps_window, Instant::now()),
        };
        let task = tokio::spawn(actor.run(command_rx, internal_rx));

        let client = Self {
            commands: command_tx,
            state: state_rx,
            task,
        };
        (client, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Manual reconnect. Leaves FAILED or skips a pending backoff.
    pub async fn retry(&self) -> Result<()> {
        self.commands
            .send(Command::Retry)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Cancel any pending reconnect, close the socket and wait for the actor.
    pub async fn shutdown(self) -> Result<()> {
        // already gone is fine
        let _ = self.commands.send(Command::Shutdown).await;
        self.task
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))
    }
}

struct Actor {
    url: String,
    connector: Arc<dyn Connector>,
    session: ClientSession,
    connection: Option<Box<dyn Connection>>,
    /// The one timer or connect attempt in flight
    pending: Option<JoinHandle<()>>,
    generation: u64,
    internal: mpsc::UnboundedSender<Internal>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    fps: FpsMeter,
}

async fn next_text(connection: &mut Option<Box<dyn Connection>>) -> Option<Result<String>> {
    match connection {
        Some(connection) => connection.next_text().await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let action = self.session.start();
        self.apply(action);

        let window = self.fps.window();
        let mut fps_tick = tokio::time::interval_at(Instant::now() + window, window);
        fps_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Retry) => {
                        let action = self.session.manual_retry();
                        self.apply(action);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
                incoming = next_text(&mut self.connection) => self.handle_incoming(incoming),
                _ = fps_tick.tick() => {
                    if let Some(fps) = self.fps.sample(Instant::now()) {
                        debug!("Viewer fps={:.1}", fps);
                        self.emit(ClientEvent::Fps(fps));
                    }
                }
            }
        }

        self.teardown().await;
    }

    fn apply(&mut self, action: Option<SessionAction>) {
        match action {
            Some(SessionAction::Connect) => self.begin_connect(),
            Some(SessionAction::ScheduleReconnect { delay, attempt }) => {
                self.schedule_reconnect(delay, attempt)
            }
            Some(SessionAction::Fail) => {
                self.cancel_pending();
                warn!("Stream {} unreachable, waiting for manual retry", self.url);
            }
            None => {}
        }
        self.publish_state();
    }

    fn begin_connect(&mut self) {
        self.cancel_pending();
        let generation = self.generation;
        let connector = self.connector.clone();
        let url = self.url.clone();
        let tx = self.internal.clone();
        debug!("Connecting to {}", url);
        self.pending = Some(tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = tx.send(Internal::Opened { generation, result });
        }));
    }

    fn schedule_reconnect(&mut self, delay: Duration, attempt: u32) {
        self.cancel_pending();
        let generation = self.generation;
        let tx = self.internal.clone();
        debug!("Reconnect attempt {} scheduled in {:?}", attempt, delay);
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::ReconnectDue { generation });
        }));
    }

    /// Abort the pending task and invalidate anything it already posted.
    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        self.generation += 1;
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Opened { generation, result } => {
                if generation != self.generation {
                    if let Ok(mut stale) = result {
                        stale.close().await;
                    }
                    return;
                }
                self.pending = None;
                match result {
                    Ok(connection) => {
                        self.connection = Some(connection);
                        self.session.on_open();
                        info!("Connected to {}", self.url);
                        self.publish_state();
                    }
                    Err(e) => {
                        warn!("Connect to {} failed: {}", self.url, e);
                        let action = self.session.on_close();
                        self.apply(action);
                    }
                }
            }
            Internal::ReconnectDue { generation } => {
                if generation != self.generation {
                    return;
                }
                self.pending = None;
                let action = self.session.reconnect_due();
                self.apply(action);
            }
        }
    }

    fn handle_incoming(&mut self, incoming: Option<Result<String>>) {
        match incoming {
            Some(Ok(text)) => self.handle_text(&text),
            Some(Err(e)) => {
                warn!("Stream connection error: {}", e);
                self.connection_lost();
            }
            None => {
                info!("Stream closed by server");
                self.connection_lost();
            }
        }
    }

    fn connection_lost(&mut self) {
        self.connection = None;
        let action = self.session.on_close();
        self.apply(action);
    }

    fn handle_text(&mut self, text: &str) {
        match WireMessage::from_json(text) {
            Ok(WireMessage::Data { payload }) => {
                if self.session.accept_frame(payload.frame_id) {
                    self.fps.record();
                    self.emit(ClientEvent::Data(payload));
                } else {
                    debug!(
                        "Dropping stale frame {} (last seen {})",
                        payload.frame_id,
                        self.session.last_seen_frame_id()
                    );
                }
            }
            Ok(WireMessage::RawFrame {
                frame_id,
                timestamp,
                image,
                resolution,
            }) => self.emit(ClientEvent::Raw {
                frame_id,
                timestamp,
                image,
                resolution,
            }),
            Ok(WireMessage::System {
                status,
                message,
                cause,
            }) => {
                info!("System notice: {:?} {}", status, message.as_deref().unwrap_or(""));
                self.emit(ClientEvent::System {
                    status,
                    message,
                    cause,
                });
            }
            Ok(WireMessage::Unknown) => debug!("Ignoring message of unknown type"),
            Err(e) => warn!("Malformed message from server: {}", e),
        }
    }

    fn publish_state(&mut self) {
        let state = self.session.state();
        if *self.state.borrow() != state {
            info!("Stream connection {}", state);
            self.state.send_replace(state);
            self.emit(ClientEvent::State(state));
        }
    }

    fn emit(&self, event: ClientEvent) {
        // the viewer may have stopped listening
        let _ = self.events.send(event);
    }

    async fn teardown(&mut self) {
        self.cancel_pending();
        if let Some(mut connection) = self.connection.take() {
            if tokio::time::timeout(Duration::from_secs(1), connection.close())
                .await
                .is_err()
            {
                debug!("Close handshake timed out");
            }
        }
        self.session.stop();
        self.publish_state();
        info!("Stream client stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Connection;
    use async_trait::async_trait;
    use drishti_core::{SystemMetrics, SystemState};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    enum Script {
        Fail,
        Open(mpsc::UnboundedReceiver<String>),
    }

    #[derive(Clone)]
    struct MockConnector {
        attempts: Arc<AtomicUsize>,
        script: Arc<Mutex<VecDeque<Script>>>,
    }

    impl MockConnector {
        fn new(script: Vec<Script>) -> Self {
            Self {
                attempts: Arc::new(AtomicUsize::new(0)),
                script: Arc::new(Mutex::new(script.into())),
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Connection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Script::Open(rx)) => Ok(Box::new(MockConnection { rx })),
                Some(Script::Fail) | None => Err(ClientError::Connect("refused".to_string())),
            }
        }
    }

    struct MockConnection {
        rx: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn next_text(&mut self) -> Option<Result<String>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.rx.close();
        }
    }

    fn config(max_attempts: u32) -> ClientConfig {
        ClientConfig {
            url: "ws://stream.test/ws/stream".to_string(),
            backoff: Backoff::new(1000, 30000, max_attempts),
            fps_window: Duration::from_secs(1),
        }
    }

    fn data(frame_id: u64) -> String {
        WireMessage::Data {
            payload: DataPayload {
                timestamp: "2024-01-01T00:00:00Z".to_string(),
                state: SystemState::SafeMode,
                max_confidence: 0.0,
                detections: vec![],
                image_data: None,
                frame_id,
                system: SystemMetrics::default(),
                error: None,
            },
        }
        .to_json()
        .unwrap()
    }

    async fn wait_for_state(
        events: &mut mpsc::UnboundedReceiver<ClientEvent>,
        wanted: ConnectionState,
    ) {
        while let Some(event) = events.recv().await {
            if event == ClientEvent::State(wanted) {
                return;
            }
        }
        panic!("event stream ended before {}", wanted);
    }

    async fn next_frame_id(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> u64 {
        while let Some(event) = events.recv().await {
            if let ClientEvent::Data(payload) = event {
                return payload.frame_id;
            }
        }
        panic!("event stream ended");
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_frames_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        for id in [5, 3, 7, 7, 9] {
            tx.send(data(id)).unwrap();
        }
        tx.send("{not json".to_string()).unwrap();
        tx.send(r#"{"type":"telemetry"}"#.to_string()).unwrap();

        let (client, mut events) = StreamClient::spawn(config(10), MockConnector::new(vec![Script::Open(rx)]));
        wait_for_state(&mut events, ConnectionState::Connected).await;

        let mut accepted = Vec::new();
        for _ in 0..3 {
            accepted.push(next_frame_id(&mut events).await);
        }
        assert_eq!(accepted, vec![5, 7, 9]);
        // malformed and unknown messages did not drop the connection
        assert_eq!(client.state(), ConnectionState::Connected);
        client.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_until_failed() {
        let connector = MockConnector::new(vec![]);
        let started = Instant::now();
        let (client, mut events) = StreamClient::spawn(config(3), connector.clone());

        wait_for_state(&mut events, ConnectionState::Failed).await;
        // 1s after the first failure, 2s after the second
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3100), "{:?}", elapsed);
        assert_eq!(connector.attempts(), 3);

        // no automatic timer once FAILED
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), 3);
        assert_eq!(client.state(), ConnectionState::Failed);
        client.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_after_failed() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let connector = MockConnector::new(vec![Script::Fail, Script::Open(rx)]);
        let (client, mut events) = StreamClient::spawn(config(1), connector.clone());

        wait_for_state(&mut events, ConnectionState::Failed).await;
        client.retry().await.unwrap();
        wait_for_state(&mut events, ConnectionState::Connected).await;
        assert_eq!(connector.attempts(), 2);
        client.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_watermark() {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let connector = MockConnector::new(vec![Script::Open(rx1), Script::Open(rx2)]);
        let (client, mut events) = StreamClient::spawn(config(10), connector.clone());

        tx1.send(data(10)).unwrap();
        assert_eq!(next_frame_id(&mut events).await, 10);

        drop(tx1);
        wait_for_state(&mut events, ConnectionState::Disconnected).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;

        // server restarted its ids
        tx2.send(data(0)).unwrap();
        assert_eq!(next_frame_id(&mut events).await, 0);
        assert_eq!(connector.attempts(), 2);
        client.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let connector = MockConnector::new(vec![]);
        let (client, mut events) = StreamClient::spawn(config(10), connector.clone());

        wait_for_state(&mut events, ConnectionState::Connecting).await;
        wait_for_state(&mut events, ConnectionState::Disconnected).await;
        client.shutdown().await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        // the actor is gone and said nothing more about connecting
        while let Some(event) = events.recv().await {
            assert_ne!(event, ClientEvent::State(ConnectionState::Connecting));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_socket() {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let (client, mut events) = StreamClient::spawn(config(10), MockConnector::new(vec![Script::Open(rx)]));
        wait_for_state(&mut events, ConnectionState::Connected).await;

        client.shutdown().await.unwrap();
        assert!(tx.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fps_counts_accepted_frames() {
        let (tx, rx) = mpsc::unbounded_channel();
        for id in 0..5 {
            tx.send(data(id)).unwrap();
        }
        // duplicate is not counted
        tx.send(data(4)).unwrap();
        let (client, mut events) = StreamClient::spawn(config(10), MockConnector::new(vec![Script::Open(rx)]));

        let fps = loop {
            match events.recv().await {
                Some(ClientEvent::Fps(fps)) => break fps,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        };
        assert!((fps - 5.0).abs() < 1e-6, "{}", fps);
        client.shutdown().await.unwrap();
    }
}
