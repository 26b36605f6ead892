pub mod cli;
pub mod encoding;
pub mod error;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod transport;
pub mod websocket;

pub use error::{ServerError, TransportError};
pub use http::{create_router, AppState};
pub use pipeline::Pipeline;
pub use transport::{Channel, SessionId, SessionReceiver, StreamTransport, TransportConfig};
