//! Frame cadence and the latest-wins inference policy.
//!
//! Every source frame goes to the raw sink. A frame goes through inference
//! only while the loop is no more than one interval behind schedule; late
//! frames are skipped outright, never queued. Inference runs inline on the
//! scheduler thread, so at most one call is ever outstanding.
//!
//! A failed or panicking inference puts the scheduler into safe mode: in-budget
//! frames publish a SAFE_MODE result without touching the models, and one frame
//! per recovery interval is sent through as a probe. A successful probe leaves
//! safe mode.

use metrics::{counter, gauge, histogram};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::source::FrameSource;
use drishti_core::{
    Frame, InferenceResult, ProcessedFrame, SafeModeCause, SchedulerConfig, SystemEvent,
};

/// Destination for everything the scheduler produces.
///
/// Implementations must not block: the scheduler calls these inline.
pub trait FrameSink: Send + Sync {
    fn publish_raw(&self, frame: &Frame);

    fn publish_processed(&self, processed: ProcessedFrame);

    fn publish_system(&self, event: SystemEvent);
}

impl<T: FrameSink + ?Sized> FrameSink for Arc<T> {
    fn publish_raw(&self, frame: &Frame) {
        (**self).publish_raw(frame)
    }

    fn publish_processed(&self, processed: ProcessedFrame) {
        (**self).publish_processed(processed)
    }

    fn publish_system(&self, event: SystemEvent) {
        (**self).publish_system(event)
    }
}

/// Shared stop flag, checked once per frame.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Live counters, readable from other threads while the loop runs.
#[derive(Debug)]
pub struct SchedulerStats {
    frames_raw: AtomicU64,
    frames_inferred: AtomicU64,
    frames_dropped: AtomicU64,
    frames_degraded: AtomicU64,
    safe_mode: AtomicBool,
    fps_bits: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub frames_raw: u64,
    pub frames_inferred: u64,
    pub frames_dropped: u64,
    pub frames_degraded: u64,
    pub safe_mode: bool,
    pub fps: Option<f64>,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let fps = f64::from_bits(self.fps_bits.load(Ordering::Relaxed));
        StatsSnapshot {
            frames_raw: self.frames_raw.load(Ordering::Relaxed),
            frames_inferred: self.frames_inferred.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_degraded: self.frames_degraded.load(Ordering::Relaxed),
            safe_mode: self.safe_mode.load(Ordering::Relaxed),
            fps: if fps.is_nan() { None } else { Some(fps) },
        }
    }
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self {
            frames_raw: AtomicU64::new(0),
            frames_inferred: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_degraded: AtomicU64::new(0),
            safe_mode: AtomicBool::new(false),
            // no window closed yet
            fps_bits: AtomicU64::new(f64::NAN.to_bits()),
        }
    }
}

struct SafeMode {
    cause: SafeModeCause,
    last_probe: Duration,
}

enum Plan {
    Infer,
    Probe,
    Degraded(SafeModeCause),
}

#[derive(Default)]
struct LoopState {
    /// Clock reading and frame id at the start of the current source epoch.
    epoch: Option<(Duration, u64)>,
    last_id: Option<u64>,
    safe_mode: Option<SafeMode>,
    window_start: Duration,
    window_count: u64,
    current_fps: Option<f64>,
}

/// Schedule position of one frame, in nanoseconds from the epoch start.
struct Timing {
    expected: u128,
    elapsed: u128,
}

impl Timing {
    fn drift_secs(&self) -> f64 {
        (self.elapsed as f64 - self.expected as f64) / 1e9
    }
}

/// Single sequential loop that owns pacing for one source.
pub struct FrameScheduler<C: Clock = SystemClock> {
    interval: Duration,
    recovery_interval: Duration,
    fps_window: Duration,
    clock: C,
    stop: StopHandle,
    stats: Arc<SchedulerStats>,
}

impl FrameScheduler<SystemClock> {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_clock(config, SystemClock::new())
    }
}

impl<C: Clock> FrameScheduler<C> {
    pub fn with_clock(config: &SchedulerConfig, clock: C) -> Self {
        Self {
            interval: config.frame_interval(),
            recovery_interval: config.recovery_interval(),
            fps_window: config.fps_window(),
            clock,
            stop: StopHandle::default(),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Drive `source` until it ends or the stop handle fires.
    ///
    /// `infer` may fail by returning a SAFE_MODE result or by panicking; either
    /// way the loop keeps going.
    pub fn run<S, K, F>(&self, source: &mut S, sink: &K, mut infer: F) -> StatsSnapshot
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
        F: FnMut(&Frame) -> InferenceResult,
    {
        info!(
            "Frame scheduler starting: interval {:.4}s, recovery probe every {:?}",
            self.interval.as_secs_f64(),
            self.recovery_interval
        );
        let mut state = LoopState::default();

        while !self.stop.is_stopped() {
            let Some(frame) = source.next_frame() else {
                info!("Frame source ended");
                break;
            };
            if self.stop.is_stopped() {
                break;
            }

            let now = self.clock.now();
            let timing = self.timing(&mut state, &frame, now);

            sink.publish_raw(&frame);
            self.stats.frames_raw.fetch_add(1, Ordering::Relaxed);
            counter!("drishti_frames_raw_total").increment(1);

            let interval = self.interval.as_nanos();
            if timing.elapsed > timing.expected + interval {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                counter!("drishti_frames_dropped_total").increment(1);
                debug!("Frame {}: dropped from inference (drift {:.4}s)", frame.id, timing.drift_secs());
                self.sample_fps(&mut state);
                continue;
            }

            self.process(&frame, now, &mut state, sink, &mut infer);
            state.window_count += 1;

            // Sleep only when ahead of the next frame's slot.
            if let Some((epoch, _)) = state.epoch {
                let next_slot = timing.expected + interval;
                let elapsed = self.clock.now().saturating_sub(epoch).as_nanos();
                if next_slot > elapsed {
                    let ahead = u64::try_from(next_slot - elapsed).unwrap_or(u64::MAX);
                    self.clock.sleep(Duration::from_nanos(ahead));
                }
            }

            self.sample_fps(&mut state);
        }

        let summary = self.stats.snapshot();
        info!(
            "Frame scheduler stopped: {} raw, {} inferred, {} dropped",
            summary.frames_raw, summary.frames_inferred, summary.frames_dropped
        );
        summary
    }

    fn timing(&self, state: &mut LoopState, frame: &Frame, now: Duration) -> Timing {
        let new_epoch = match (state.epoch, state.last_id) {
            (None, _) => true,
            (Some(_), Some(last)) if frame.id <= last => {
                info!("Frame id went from {} to {}, starting a new source epoch", last, frame.id);
                true
            }
            _ => false,
        };
        if new_epoch {
            state.epoch = Some((now, frame.id));
            state.window_start = now;
            state.window_count = 0;
        }
        state.last_id = Some(frame.id);

        let (epoch, base_id) = state.epoch.unwrap_or((now, frame.id));
        Timing {
            expected: self.interval.as_nanos() * u128::from(frame.id - base_id),
            elapsed: now.saturating_sub(epoch).as_nanos(),
        }
    }

    fn plan(&self, state: &LoopState, now: Duration) -> Plan {
        match &state.safe_mode {
            None => Plan::Infer,
            Some(sm) if now.saturating_sub(sm.last_probe) >= self.recovery_interval => Plan::Probe,
            Some(sm) => Plan::Degraded(sm.cause.clone()),
        }
    }

    fn process<K, F>(&self, frame: &Frame, now: Duration, state: &mut LoopState, sink: &K, infer: &mut F)
    where
        K: FrameSink + ?Sized,
        F: FnMut(&Frame) -> InferenceResult,
    {
        match self.plan(state, now) {
            Plan::Degraded(cause) => {
                let reason = cause.error_message().unwrap_or_else(|| cause.code().to_string());
                self.stats.frames_degraded.fetch_add(1, Ordering::Relaxed);
                sink.publish_processed(ProcessedFrame {
                    frame_id: frame.id,
                    result: InferenceResult::safe_mode(SafeModeCause::Degraded(reason)),
                    fps: state.current_fps,
                    latency_ms: None,
                });
                return;
            }
            Plan::Probe => {
                info!("Safe mode: attempting recovery probe on frame {}", frame.id);
            }
            Plan::Infer => {}
        }

        let started = self.clock.now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| infer(frame)));
        let latency = self.clock.now().saturating_sub(started);
        let latency_ms = latency.as_secs_f64() * 1000.0;

        let result = outcome.unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            error!("Inference panicked on frame {}: {}", frame.id, message);
            InferenceResult::safe_mode(SafeModeCause::InferenceFailure(message))
        });

        self.stats.frames_inferred.fetch_add(1, Ordering::Relaxed);
        counter!("drishti_frames_inferred_total").increment(1);
        histogram!("drishti_inference_latency_ms").record(latency_ms);

        if result.is_inference_failure() {
            if state.safe_mode.is_none() {
                let cause = result
                    .cause
                    .clone()
                    .unwrap_or_else(|| SafeModeCause::InferenceFailure("unknown".to_string()));
                warn!("Entering safe mode on frame {}: {}", frame.id, result.error.as_deref().unwrap_or("-"));
                sink.publish_system(SystemEvent::safe_mode(&cause));
                state.safe_mode = Some(SafeMode {
                    cause,
                    last_probe: self.clock.now(),
                });
                self.stats.safe_mode.store(true, Ordering::Relaxed);
            } else if let Some(sm) = state.safe_mode.as_mut() {
                debug!("Recovery probe failed on frame {}", frame.id);
                sm.last_probe = now;
            }
        } else if matches!(result.cause, Some(SafeModeCause::InvalidFrame(_))) {
            // The models never ran, so this says nothing about recovery.
            if state.safe_mode.is_some() {
                debug!("Recovery frame {} rejected by the validity gate, retrying on the next frame", frame.id);
            }
        } else if state.safe_mode.take().is_some() {
            info!("Recovered from safe mode on frame {} ({:.1}ms)", frame.id, latency_ms);
            self.stats.safe_mode.store(false, Ordering::Relaxed);
            sink.publish_system(SystemEvent::recovered());
        }

        sink.publish_processed(ProcessedFrame {
            frame_id: frame.id,
            result,
            fps: state.current_fps,
            latency_ms: Some(latency_ms),
        });
    }

    fn sample_fps(&self, state: &mut LoopState) {
        let now = self.clock.now();
        let window = now.saturating_sub(state.window_start);
        if window < self.fps_window {
            return;
        }
        let fps = state.window_count as f64 / window.as_secs_f64();
        state.current_fps = Some(fps);
        state.window_count = 0;
        state.window_start = now;
        self.stats.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
        gauge!("drishti_scheduler_fps").set(fps);
        debug!("Scheduler fps={:.1}", fps);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "inference panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::source::IterSource;
    use drishti_core::{ChannelOrder, Detection, PixelBuffer, SystemState, SystemStatus};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        raw: Mutex<Vec<u64>>,
        processed: Mutex<Vec<ProcessedFrame>>,
        system: Mutex<Vec<SystemEvent>>,
    }

    impl FrameSink for RecordingSink {
        fn publish_raw(&self, frame: &Frame) {
            self.raw.lock().push(frame.id);
        }

        fn publish_processed(&self, processed: ProcessedFrame) {
            self.processed.lock().push(processed);
        }

        fn publish_system(&self, event: SystemEvent) {
            self.system.lock().push(event);
        }
    }

    impl RecordingSink {
        fn processed_ids(&self) -> Vec<u64> {
            self.processed.lock().iter().map(|p| p.frame_id).collect()
        }
    }

    fn config(fps: u32) -> SchedulerConfig {
        SchedulerConfig {
            target_fps: fps,
            max_fps: fps.max(15),
            recovery_interval_ms: 500,
            fps_window_ms: 1000,
        }
    }

    fn frame_list(n: u64) -> Vec<Frame> {
        (0..n)
            .map(|id| {
                let pixels = PixelBuffer::from_hwc(2, 2, vec![0; 12], ChannelOrder::Bgr).unwrap();
                Frame::new(id, id as f64, pixels)
            })
            .collect()
    }

    fn frames(n: u64) -> IterSource<std::vec::IntoIter<Frame>> {
        IterSource::new(frame_list(n).into_iter())
    }

    fn ok_result() -> InferenceResult {
        InferenceResult::classified(
            SystemState::PotentialAnomaly,
            0.5,
            vec![Detection::new([0.0, 0.0, 1.0, 1.0], 0.5, "x")],
        )
    }

    #[test]
    fn test_fast_inference_processes_every_frame() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock.clone());
        let sink = RecordingSink::default();
        let summary = scheduler.run(&mut frames(20), &sink, |_| ok_result());

        assert_eq!(sink.raw.lock().len(), 20);
        assert_eq!(sink.processed_ids(), (0..20).collect::<Vec<_>>());
        assert_eq!(summary.frames_dropped, 0);
        // paced to the slot of the frame after the last
        assert_eq!(clock.now(), Duration::from_millis(2000));
    }

    #[test]
    fn test_slow_inference_drops_late_frames() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock.clone());
        let sink = RecordingSink::default();
        let infer_clock = clock.clone();
        let mut calls = 0;
        scheduler.run(&mut frames(10), &sink, |_| {
            calls += 1;
            infer_clock.advance(Duration::from_millis(250));
            ok_result()
        });

        // raw path never starves
        assert_eq!(*sink.raw.lock(), (0..10).collect::<Vec<_>>());
        // each call costs 2.5 intervals, so only frames still within one
        // interval of their slot get through
        assert_eq!(sink.processed_ids(), vec![0, 2, 4, 7, 9]);
        assert_eq!(calls, 5);
        assert_eq!(scheduler.stats().snapshot().frames_dropped, 5);
    }

    #[test]
    fn test_drift_equal_to_interval_is_processed() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock.clone());
        let sink = RecordingSink::default();
        let infer_clock = clock.clone();
        scheduler.run(&mut frames(2), &sink, |_| {
            infer_clock.advance(Duration::from_millis(200));
            ok_result()
        });
        // frame 1 arrives at 200ms, expected 100ms: drift == interval
        assert_eq!(sink.processed_ids(), vec![0, 1]);
    }

    #[test]
    fn test_panic_becomes_safe_mode_result() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock);
        let sink = RecordingSink::default();
        scheduler.run(&mut frames(3), &sink, |frame| {
            if frame.id == 0 {
                panic!("model exploded");
            }
            ok_result()
        });

        let processed = sink.processed.lock();
        assert_eq!(processed[0].result.state, SystemState::SafeMode);
        assert!(processed[0].result.error.as_ref().unwrap().contains("model exploded"));
        // the loop kept going
        assert_eq!(sink.raw.lock().len(), 3);

        let system = sink.system.lock();
        assert_eq!(system[0].status, SystemStatus::SafeMode);
        assert_eq!(system[0].cause.as_deref(), Some("inference_failure"));
    }

    #[test]
    fn test_safe_mode_skips_models_until_probe() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock);
        let sink = RecordingSink::default();
        let mut calls = Vec::new();
        // 500ms recovery interval at 100ms per frame: probe on frame 5
        scheduler.run(&mut frames(8), &sink, |frame| {
            calls.push(frame.id);
            if frame.id == 0 {
                InferenceResult::safe_mode(SafeModeCause::InferenceFailure("oom".into()))
            } else {
                ok_result()
            }
        });

        assert_eq!(calls, vec![0, 5, 6, 7]);
        let processed = sink.processed.lock();
        assert_eq!(processed.len(), 8);
        for p in &processed[1..5] {
            assert_eq!(p.result.state, SystemState::SafeMode);
            assert!(matches!(p.result.cause, Some(SafeModeCause::Degraded(_))));
            assert!(p.latency_ms.is_none());
        }
        assert_eq!(processed[5].result.state, SystemState::PotentialAnomaly);

        let statuses: Vec<SystemStatus> = sink.system.lock().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![SystemStatus::SafeMode, SystemStatus::Recovered]);
        assert!(!scheduler.stats().snapshot().safe_mode);
    }

    #[test]
    fn test_failed_probe_stays_in_safe_mode() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock);
        let sink = RecordingSink::default();
        scheduler.run(&mut frames(7), &sink, |_| {
            InferenceResult::safe_mode(SafeModeCause::InferenceFailure("still broken".into()))
        });
        // one notice on entry, none for the failed probe
        assert_eq!(sink.system.lock().len(), 1);
        assert!(scheduler.stats().snapshot().safe_mode);
    }

    #[test]
    fn test_rejected_recovery_frame_keeps_safe_mode() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock);
        let sink = RecordingSink::default();
        let calls = Mutex::new(Vec::new());
        scheduler.run(&mut frames(7), &sink, |frame| {
            calls.lock().push(frame.id);
            match frame.id {
                5 => InferenceResult::safe_mode(SafeModeCause::InvalidFrame("empty".into())),
                _ => InferenceResult::safe_mode(SafeModeCause::InferenceFailure("still broken".into())),
            }
        });

        // the rejected frame is retried on the very next one
        assert_eq!(*calls.lock(), vec![0, 5, 6]);
        let statuses: Vec<SystemStatus> = sink.system.lock().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![SystemStatus::SafeMode]);
        assert!(scheduler.stats().snapshot().safe_mode);
    }

    #[test]
    fn test_recovery_after_rejected_frame() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock);
        let sink = RecordingSink::default();
        scheduler.run(&mut frames(8), &sink, |frame| match frame.id {
            0 => InferenceResult::safe_mode(SafeModeCause::InferenceFailure("boom".into())),
            5 => InferenceResult::safe_mode(SafeModeCause::InvalidFrame("empty".into())),
            _ => ok_result(),
        });

        let statuses: Vec<SystemStatus> = sink.system.lock().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![SystemStatus::SafeMode, SystemStatus::Recovered]);
        assert!(!scheduler.stats().snapshot().safe_mode);
    }

    #[test]
    fn test_invalid_frame_does_not_enter_safe_mode() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock);
        let sink = RecordingSink::default();
        scheduler.run(&mut frames(3), &sink, |_| {
            InferenceResult::safe_mode(SafeModeCause::InvalidFrame("empty".into()))
        });
        assert!(sink.system.lock().is_empty());
        assert_eq!(sink.processed_ids(), vec![0, 1, 2]);
    }

    #[test]
    fn test_fps_reported_after_first_window() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock);
        let sink = RecordingSink::default();
        scheduler.run(&mut frames(15), &sink, |_| ok_result());

        let processed = sink.processed.lock();
        assert!(processed[0].fps.is_none());
        let fps = processed[14].fps.expect("window closed");
        assert!((fps - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_new_epoch_when_ids_restart() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock);
        let sink = RecordingSink::default();
        // a looping source that starts over at 0
        let mut source = IterSource::new(frame_list(3).into_iter().chain(frame_list(3)));
        scheduler.run(&mut source, &sink, |_| ok_result());
        assert_eq!(sink.processed_ids(), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(scheduler.stats().snapshot().frames_dropped, 0);
    }

    #[test]
    fn test_stop_handle_halts_loop() {
        let clock = ManualClock::new();
        let scheduler = FrameScheduler::with_clock(&config(10), clock);
        let stop = scheduler.stop_handle();
        let sink = RecordingSink::default();
        scheduler.run(&mut frames(100), &sink, |frame| {
            if frame.id == 4 {
                stop.stop();
            }
            ok_result()
        });
        assert_eq!(sink.raw.lock().len(), 5);
    }
}
