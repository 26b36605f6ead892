use std::fmt::Write as _;
use std::sync::Arc;

use crate::transport::StreamTransport;
use drishti_eye::{FrameInjector, SchedulerStats};

/// Prometheus text view over the scheduler and transport counters.
///
/// The `metrics` macros are recorded at the source; this renders the same
/// values from the live atomics so `/metrics` works without an exporter.
pub struct Metrics {
    scheduler: Arc<SchedulerStats>,
    transport: Arc<StreamTransport>,
    injector: Option<FrameInjector>,
}

impl Metrics {
    pub fn new(
        scheduler: Arc<SchedulerStats>,
        transport: Arc<StreamTransport>,
        injector: Option<FrameInjector>,
    ) -> Self {
        Self {
            scheduler,
            transport,
            injector,
        }
    }

    pub fn get_prometheus_metrics(&self) -> String {
        let s = self.scheduler.snapshot();
        let t = self.transport.stats();
        let mut out = String::new();

        metric(&mut out, "drishti_frames_raw_total", "counter", "Frames read from the source", s.frames_raw as f64);
        metric(&mut out, "drishti_frames_inferred_total", "counter", "Frames sent through the models", s.frames_inferred as f64);
        metric(&mut out, "drishti_frames_dropped_total", "counter", "Frames skipped by the drift policy", s.frames_dropped as f64);
        metric(&mut out, "drishti_frames_degraded_total", "counter", "Frames answered in safe mode without the models", s.frames_degraded as f64);
        metric(&mut out, "drishti_safe_mode", "gauge", "1 while the scheduler is in safe mode", if s.safe_mode { 1.0 } else { 0.0 });
        if let Some(fps) = s.fps {
            metric(&mut out, "drishti_scheduler_fps", "gauge", "Processed frames per second over the last window", fps);
        }
        metric(&mut out, "drishti_sessions_active", "gauge", "Open stream sessions", self.transport.session_count() as f64);
        metric(&mut out, "drishti_sessions_evicted_total", "counter", "Sessions disconnected by the transport", t.evicted as f64);
        metric(&mut out, "drishti_messages_raw_total", "counter", "RAW_FRAME messages queued", t.raw_sent as f64);
        metric(&mut out, "drishti_messages_data_total", "counter", "data messages queued", t.processed_sent as f64);
        metric(&mut out, "drishti_messages_system_total", "counter", "system messages queued", t.system_sent as f64);
        metric(&mut out, "drishti_encode_failures_total", "counter", "Images that could not be encoded", t.encode_failures as f64);
        if let Some(injector) = &self.injector {
            metric(&mut out, "drishti_injected_accepted_total", "counter", "Injected frames queued", injector.accepted() as f64);
            metric(&mut out, "drishti_injected_dropped_total", "counter", "Injected frames dropped on a full queue", injector.dropped() as f64);
        }
        out
    }
}

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: f64) {
    let _ = write!(out, "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n");
}
