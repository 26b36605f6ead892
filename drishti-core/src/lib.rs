//! Shared data model, wire protocol and configuration for the Drishti
//! perception stream.

pub mod config;
pub mod error;
pub mod protocol;
pub mod telemetry;
pub mod types;

pub use config::{
    DrishtiConfig, LoggingConfig, ModelConfig, ReconnectConfig, SchedulerConfig, SendEnhanced,
    ServerConfig, SourceConfig, SourceKind, ThresholdConfig,
};
pub use error::{Error, Result};
pub use protocol::{DataPayload, SystemMetrics, WireMessage};
pub use telemetry::init_tracing;
pub use types::{
    ChannelOrder, ConnectionState, Detection, Frame, InferenceResult, PixelBuffer, ProcessedFrame,
    SafeModeCause, SystemEvent, SystemState, SystemStatus,
};
