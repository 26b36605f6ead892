//! drishti-eye: perception pipeline for the Drishti stream
//!
//! Owns everything between a frame source and the transport: the frame
//! scheduler and its latest-wins policy, the validity gate, the numeric
//! bridge between the enhancer and detector domains, the model seams and the
//! safety classifier.

pub mod bridge;
pub mod classifier;
pub mod clock;
pub mod error;
pub mod gate;
pub mod models;
pub mod scheduler;
pub mod source;

pub use bridge::{check_frame, FrameRejection, NormalizationBridge, Tensor};
pub use classifier::SafetyClassifier;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, VisionError};
pub use gate::InferenceGate;
pub use models::{Detector, Enhancer, PassthroughEnhancer, SimulatedDetector};
pub use scheduler::{FrameScheduler, FrameSink, SchedulerStats, StatsSnapshot, StopHandle};
pub use source::{FrameInjector, FrameSource, InjectedSource, IterSource, SyntheticSource};
