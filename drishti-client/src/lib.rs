//! Viewer side of the Drishti stream.
//!
//! [`StreamClient`] keeps one WebSocket to the server alive, reconnecting
//! with capped exponential backoff, and drops `data` messages that arrive out
//! of order. The connection state machine itself lives in [`ClientSession`]
//! and can be driven without any I/O.

pub mod actor;
pub mod backoff;
pub mod connector;
pub mod error;
pub mod fps;
pub mod session;

pub use actor::{ClientConfig, ClientEvent, StreamClient};
pub use backoff::Backoff;
pub use connector::{validate_url, Connection, Connector, WsConnection, WsConnector};
pub use error::{ClientError, Result};
pub use fps::FpsMeter;
pub use session::{ClientSession, SessionAction};
