use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Channel ordering of an interleaved pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    /// Camera and decoder native ordering.
    #[default]
    Bgr,
}

/// Interleaved byte buffer with an explicit shape.
///
/// The shape is not forced to be `H x W x 3` at construction so that the
/// frame validity gate can see and reject malformed input instead of the
/// type system hiding it.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    shape: Vec<usize>,
    data: Vec<u8>,
    order: ChannelOrder,
}

impl PixelBuffer {
    pub fn new(shape: Vec<usize>, data: Vec<u8>, order: ChannelOrder) -> Result<Self> {
        let expected = shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d));
        match expected {
            Some(len) if len == data.len() => Ok(Self { shape, data, order }),
            Some(len) => Err(Error::PixelBuffer(format!(
                "shape {:?} needs {} bytes, got {}",
                shape,
                len,
                data.len()
            ))),
            None => Err(Error::PixelBuffer(format!("shape {:?} overflows", shape))),
        }
    }

    /// Build an `H x W x 3` buffer.
    pub fn from_hwc(height: usize, width: usize, data: Vec<u8>, order: ChannelOrder) -> Result<Self> {
        Self::new(vec![height, width, 3], data, order)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn height(&self) -> Option<usize> {
        self.shape.first().copied()
    }

    pub fn width(&self) -> Option<usize> {
        self.shape.get(1).copied()
    }

    pub fn channels(&self) -> Option<usize> {
        self.shape.get(2).copied()
    }
}

/// One timestamped sample from a frame source.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: u64,
    /// Seconds since the unix epoch.
    pub timestamp: f64,
    pub pixels: Option<PixelBuffer>,
}

impl Frame {
    pub fn new(id: u64, timestamp: f64, pixels: PixelBuffer) -> Self {
        Self {
            id,
            timestamp,
            pixels: Some(pixels),
        }
    }

    /// `(height, width)` when the frame carries pixels with at least two dimensions.
    pub fn resolution(&self) -> Option<(usize, usize)> {
        let pixels = self.pixels.as_ref()?;
        Some((pixels.height()?, pixels.width()?))
    }
}

/// Object reported by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x, y, w, h]` in detector-resolution pixels.
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub label: String,
}

impl Detection {
    pub fn new(bbox: [f32; 4], confidence: f32, label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            label: label.into(),
        }
    }
}

/// Operator-facing state, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    SafeMode,
    PotentialAnomaly,
    ConfirmedThreat,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::SafeMode => "SAFE_MODE",
            SystemState::PotentialAnomaly => "POTENTIAL_ANOMALY",
            SystemState::ConfirmedThreat => "CONFIRMED_THREAT",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a result ended up in `SAFE_MODE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafeModeCause {
    NoDetections,
    BelowThreshold,
    InvalidFrame(String),
    InferenceFailure(String),
    /// Inference skipped while the scheduler waits for a recovery probe.
    Degraded(String),
}

impl SafeModeCause {
    pub fn code(&self) -> &'static str {
        match self {
            SafeModeCause::NoDetections => "no_detections",
            SafeModeCause::BelowThreshold => "below_threshold",
            SafeModeCause::InvalidFrame(_) => "invalid_frame",
            SafeModeCause::InferenceFailure(_) => "inference_failure",
            SafeModeCause::Degraded(_) => "degraded",
        }
    }

    /// Error text for causes that represent a fault rather than a quiet scene.
    pub fn error_message(&self) -> Option<String> {
        match self {
            SafeModeCause::NoDetections | SafeModeCause::BelowThreshold => None,
            SafeModeCause::InvalidFrame(reason) => Some(format!("invalid frame: {}", reason)),
            SafeModeCause::InferenceFailure(msg) => Some(format!("inference failed: {}", msg)),
            SafeModeCause::Degraded(reason) => Some(format!("safe mode: {}", reason)),
        }
    }

    pub fn is_fault(&self) -> bool {
        self.error_message().is_some()
    }
}

/// Output of one pass through the inference gate.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub timestamp: DateTime<Utc>,
    pub state: SystemState,
    pub max_confidence: f32,
    pub detections: Vec<Detection>,
    /// Display-range RGB image at the enhancer's resolution.
    pub enhanced: Option<PixelBuffer>,
    pub error: Option<String>,
    pub cause: Option<SafeModeCause>,
}

impl InferenceResult {
    pub fn classified(state: SystemState, max_confidence: f32, detections: Vec<Detection>) -> Self {
        let cause = match state {
            SystemState::SafeMode if detections.is_empty() => Some(SafeModeCause::NoDetections),
            SystemState::SafeMode => Some(SafeModeCause::BelowThreshold),
            _ => None,
        };
        Self {
            timestamp: Utc::now(),
            state,
            max_confidence,
            detections,
            enhanced: None,
            error: None,
            cause,
        }
    }

    pub fn safe_mode(cause: SafeModeCause) -> Self {
        Self {
            timestamp: Utc::now(),
            state: SystemState::SafeMode,
            max_confidence: 0.0,
            detections: Vec::new(),
            enhanced: None,
            error: cause.error_message(),
            cause: Some(cause),
        }
    }

    pub fn with_enhanced(mut self, enhanced: PixelBuffer) -> Self {
        self.enhanced = Some(enhanced);
        self
    }

    /// True when the models themselves failed on this frame.
    pub fn is_inference_failure(&self) -> bool {
        matches!(self.cause, Some(SafeModeCause::InferenceFailure(_)))
    }
}

/// Inference result tagged with the frame it belongs to and scheduler telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFrame {
    pub frame_id: u64,
    pub result: InferenceResult,
    pub fps: Option<f64>,
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    SafeMode,
    Recovered,
    Connected,
}

/// Lifecycle notice for operators, separate from per-frame data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemEvent {
    pub status: SystemStatus,
    pub message: Option<String>,
    pub cause: Option<String>,
}

impl SystemEvent {
    pub fn safe_mode(cause: &SafeModeCause) -> Self {
        Self {
            status: SystemStatus::SafeMode,
            message: cause.error_message(),
            cause: Some(cause.code().to_string()),
        }
    }

    pub fn recovered() -> Self {
        Self {
            status: SystemStatus::Recovered,
            message: Some("System recovered".to_string()),
            cause: None,
        }
    }

    pub fn connected() -> Self {
        Self {
            status: SystemStatus::Connected,
            message: None,
            cause: None,
        }
    }
}

/// Viewer connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_buffer_shape_mismatch() {
        let err = PixelBuffer::new(vec![2, 2, 3], vec![0; 11], ChannelOrder::Rgb).unwrap_err();
        assert!(err.to_string().contains("needs 12 bytes"));
    }

    #[test]
    fn test_pixel_buffer_accessors() {
        let buf = PixelBuffer::from_hwc(4, 6, vec![0; 72], ChannelOrder::Bgr).unwrap();
        assert_eq!(buf.height(), Some(4));
        assert_eq!(buf.width(), Some(6));
        assert_eq!(buf.channels(), Some(3));
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_frame_resolution() {
        let buf = PixelBuffer::from_hwc(480, 640, vec![0; 480 * 640 * 3], ChannelOrder::Bgr).unwrap();
        let frame = Frame::new(7, 1.5, buf);
        assert_eq!(frame.resolution(), Some((480, 640)));

        let empty = Frame { id: 8, timestamp: 2.0, pixels: None };
        assert_eq!(empty.resolution(), None);
    }

    #[test]
    fn test_system_state_ordering() {
        assert!(SystemState::SafeMode < SystemState::PotentialAnomaly);
        assert!(SystemState::PotentialAnomaly < SystemState::ConfirmedThreat);
        assert_eq!(
            serde_json::to_string(&SystemState::PotentialAnomaly).unwrap(),
            "\"POTENTIAL_ANOMALY\""
        );
    }

    #[test]
    fn test_safe_mode_result_carries_error() {
        let result = InferenceResult::safe_mode(SafeModeCause::InvalidFrame("empty".into()));
        assert_eq!(result.state, SystemState::SafeMode);
        assert_eq!(result.max_confidence, 0.0);
        assert!(result.detections.is_empty());
        assert_eq!(result.error.as_deref(), Some("invalid frame: empty"));
        assert!(!result.is_inference_failure());
    }

    #[test]
    fn test_classified_assigns_quiet_causes() {
        let none = InferenceResult::classified(SystemState::SafeMode, 0.0, vec![]);
        assert_eq!(none.cause, Some(SafeModeCause::NoDetections));
        assert!(none.error.is_none());

        let low = InferenceResult::classified(
            SystemState::SafeMode,
            0.2,
            vec![Detection::new([0.0, 0.0, 1.0, 1.0], 0.2, "debris")],
        );
        assert_eq!(low.cause, Some(SafeModeCause::BelowThreshold));

        let hit = InferenceResult::classified(
            SystemState::ConfirmedThreat,
            0.9,
            vec![Detection::new([0.0, 0.0, 1.0, 1.0], 0.9, "diver")],
        );
        assert!(hit.cause.is_none());
    }

    #[test]
    fn test_system_event_safe_mode_cause_code() {
        let event = SystemEvent::safe_mode(&SafeModeCause::InferenceFailure("cuda oom".into()));
        assert_eq!(event.status, SystemStatus::SafeMode);
        assert_eq!(event.cause.as_deref(), Some("inference_failure"));
        assert!(event.message.unwrap().contains("cuda oom"));
    }
}
