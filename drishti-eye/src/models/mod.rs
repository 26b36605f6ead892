//! Model boundary for the two-stage pipeline.
//!
//! Real integrations (ONNX, TensorRT, remote services) implement these traits
//! and are constructed once at process start, then handed to the
//! [`InferenceGate`](crate::gate::InferenceGate).

pub mod simulated;

use crate::bridge::Tensor;
use crate::error::Result;
use drishti_core::Detection;

pub use simulated::{PassthroughEnhancer, SimulatedDetector};

/// Visibility enhancement: `[-1, 1]` RGB in, `[-1, 1]` RGB out.
pub trait Enhancer: Send + Sync {
    fn name(&self) -> &str;

    fn enhance(&self, input: &Tensor) -> Result<Tensor>;
}

/// Object detection on `[0, 1]` RGB at the detector's native resolution.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    /// Boxes are `[x, y, w, h]` in input pixels.
    fn detect(&self, input: &Tensor) -> Result<Vec<Detection>>;
}
