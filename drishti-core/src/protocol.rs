// Wire protocol shared by the stream server and viewers

use serde::{Deserialize, Serialize};

use crate::types::{Detection, ProcessedFrame, SystemEvent, SystemState, SystemStatus};

/// Scheduler telemetry attached to every data payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub fps: Option<f64>,
    pub latency_ms: Option<f64>,
}

/// Body of a `data` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    /// RFC 3339 time the result was produced.
    pub timestamp: String,
    pub state: SystemState,
    pub max_confidence: f32,
    pub detections: Vec<Detection>,
    /// Base64 JPEG of the enhanced image, when attached.
    pub image_data: Option<String>,
    pub frame_id: u64,
    pub system: SystemMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataPayload {
    pub fn from_processed(processed: &ProcessedFrame, image_data: Option<String>) -> Self {
        let result = &processed.result;
        Self {
            timestamp: result.timestamp.to_rfc3339(),
            state: result.state,
            max_confidence: result.max_confidence,
            detections: result.detections.clone(),
            image_data,
            frame_id: processed.frame_id,
            system: SystemMetrics {
                fps: processed.fps,
                latency_ms: processed.latency_ms,
            },
            error: result.error.clone(),
        }
    }
}

/// Envelope for everything sent over a stream socket.
///
/// Consumers route on `type` before looking at the payload shape. Tags that
/// this build does not know decode to [`WireMessage::Unknown`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "RAW_FRAME")]
    RawFrame {
        frame_id: u64,
        timestamp: f64,
        /// Base64 JPEG.
        image: String,
        /// `[height, width]`
        resolution: [usize; 2],
    },

    #[serde(rename = "data")]
    Data { payload: DataPayload },

    #[serde(rename = "system")]
    System {
        status: SystemStatus,
        message: Option<String>,
        cause: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

impl WireMessage {
    /// Parse message from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize message to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn system(event: &SystemEvent) -> Self {
        WireMessage::System {
            status: event.status,
            message: event.message.clone(),
            cause: event.cause.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::RawFrame { .. } => "RAW_FRAME",
            WireMessage::Data { .. } => "data",
            WireMessage::System { .. } => "system",
            WireMessage::Unknown => "unknown",
        }
    }
}
