//! Viewer connection lifecycle.
//!
//! `ClientSession` is the pure state machine: it never touches sockets or
//! timers, it only tells its owner what to do next. The owner performs the
//! returned [`SessionAction`] and reports back through `on_open`, `on_close`
//! and `reconnect_due`.
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTED (backoff) -> CONNECTING ...
//!                                         \-> FAILED (after max attempts) -> manual retry
//! ```

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use drishti_core::ConnectionState;

/// What the owner must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Open a socket now.
    Connect,
    /// Arm the reconnect timer, replacing any pending one.
    ScheduleReconnect { delay: Duration, attempt: u32 },
    /// Give up: cancel any timer and wait for a manual retry.
    Fail,
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    state: ConnectionState,
    /// Highest accepted data frame id for the current connection.
    watermark: Option<u64>,
    reconnect_attempt: u32,
    backoff: Backoff,
}

impl ClientSession {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            watermark: None,
            reconnect_attempt: 0,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    /// `-1` until a frame has been accepted on this connection.
    pub fn last_seen_frame_id(&self) -> i64 {
        self.watermark
            .map_or(-1, |id| i64::try_from(id).unwrap_or(i64::MAX))
    }

    /// Session start. Only valid from DISCONNECTED.
    pub fn start(&mut self) -> Option<SessionAction> {
        if self.state != ConnectionState::Disconnected {
            return None;
        }
        Some(self.fresh_connect())
    }

    /// Operator retry: leaves FAILED, or short-cuts a pending backoff.
    pub fn manual_retry(&mut self) -> Option<SessionAction> {
        match self.state {
            ConnectionState::Failed | ConnectionState::Disconnected => {
                info!("Manual reconnect requested");
                Some(self.fresh_connect())
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("Manual reconnect ignored while {}", self.state);
                None
            }
        }
    }

    fn fresh_connect(&mut self) -> SessionAction {
        self.reconnect_attempt = 0;
        self.watermark = None;
        self.transition(ConnectionState::Connecting);
        SessionAction::Connect
    }

    /// The socket opened.
    pub fn on_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.reconnect_attempt = 0;
        self.watermark = None;
        self.transition(ConnectionState::Connected);
    }

    /// The socket closed, errored, or never opened.
    pub fn on_close(&mut self) -> Option<SessionAction> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return None;
        }

        self.reconnect_attempt += 1;
        if self.reconnect_attempt >= self.backoff.max_attempts() {
            warn!(
                "Giving up after {} consecutive failed connections",
                self.reconnect_attempt
            );
            self.transition(ConnectionState::Failed);
            return Some(SessionAction::Fail);
        }

        let delay = self.backoff.delay(self.reconnect_attempt - 1);
        self.transition(ConnectionState::Disconnected);
        info!(
            "Reconnect attempt {} in {:?}",
            self.reconnect_attempt, delay
        );
        Some(SessionAction::ScheduleReconnect {
            delay,
            attempt: self.reconnect_attempt,
        })
    }

    /// The backoff timer fired. Keeps the attempt count.
    pub fn reconnect_due(&mut self) -> Option<SessionAction> {
        if self.state != ConnectionState::Disconnected {
            return None;
        }
        self.transition(ConnectionState::Connecting);
        Some(SessionAction::Connect)
    }

    /// Teardown. No further actions are produced until `start`.
    pub fn stop(&mut self) {
        self.reconnect_attempt = 0;
        self.transition(ConnectionState::Disconnected);
    }

    /// Staleness check for `data` messages. Accepting raises the watermark.
    pub fn accept_frame(&mut self, frame_id: u64) -> bool {
        match self.watermark {
            Some(last) if frame_id <= last => false,
            _ => {
                self.watermark = Some(frame_id);
                true
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Connection state {} -> {}", self.state, next);
            self.state = next;
        }
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}
