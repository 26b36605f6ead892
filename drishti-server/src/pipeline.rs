// Scheduler thread ownership: models, source and loop for one process

use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

use crate::error::ServerError;
use drishti_core::DrishtiConfig;
use drishti_eye::{
    source, Clock, FrameInjector, FrameScheduler, FrameSink, FrameSource, InferenceGate,
    PassthroughEnhancer, SchedulerStats, SimulatedDetector, StatsSnapshot, StopHandle,
};

/// A running scheduler on its own OS thread.
///
/// Model handles are created once here and live as long as the thread.
pub struct Pipeline {
    stop: StopHandle,
    stats: Arc<SchedulerStats>,
    injector: Option<FrameInjector>,
    thread: Option<JoinHandle<StatsSnapshot>>,
}

impl Pipeline {
    /// Start the configured source with the built-in simulated models.
    pub fn spawn(config: &DrishtiConfig, sink: Arc<dyn FrameSink>) -> Result<Self, ServerError> {
        let (source, injector) = source::from_config(&config.source)?;
        let gate = InferenceGate::from_config(
            config,
            Arc::new(PassthroughEnhancer),
            Arc::new(SimulatedDetector::new()),
        );
        Self::spawn_with(
            FrameScheduler::new(&config.scheduler),
            source,
            injector,
            gate,
            sink,
        )
    }

    pub fn spawn_with<C: Clock + 'static>(
        scheduler: FrameScheduler<C>,
        mut source: Box<dyn FrameSource>,
        injector: Option<FrameInjector>,
        gate: InferenceGate,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, ServerError> {
        let stop = scheduler.stop_handle();
        let stats = scheduler.stats();

        let thread = std::thread::Builder::new()
            .name("drishti-scheduler".to_string())
            .spawn(move || scheduler.run(&mut *source, &*sink, |frame| gate.infer(frame)))?;

        info!("Scheduler thread started");
        Ok(Self {
            stop,
            stats,
            injector,
            thread: Some(thread),
        })
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Producer for `POST /frames`, when the source is injected.
    pub fn injector(&self) -> Option<FrameInjector> {
        self.injector.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the loop and wait for the thread.
    ///
    /// An injected source only returns once every injector is gone, so any
    /// clones handed out must be dropped before this is called. Blocks; call
    /// it from `spawn_blocking` inside async code.
    pub fn shutdown(mut self) -> Option<StatsSnapshot> {
        self.stop.stop();
        self.injector.take();
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(summary) => Some(summary),
            Err(_) => {
                warn!("Scheduler thread panicked");
                None
            }
        }
    }
}
