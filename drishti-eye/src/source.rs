//! Frame sources feeding the scheduler.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, VisionError};
use drishti_core::{ChannelOrder, Frame, PixelBuffer, SourceConfig, SourceKind};

/// Blocking producer of frames. `None` ends the stream.
///
/// Ids must increase within one epoch. A source that restarts its ids starts
/// a new epoch from the scheduler's point of view.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Option<Frame>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Option<Frame> {
        (**self).next_frame()
    }
}

fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Adapts any iterator of frames.
pub struct IterSource<I> {
    inner: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Frame> + Send,
{
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I> FrameSource for IterSource<I>
where
    I: Iterator<Item = Frame> + Send,
{
    fn next_frame(&mut self) -> Option<Frame> {
        self.inner.next()
    }
}

/// Generated underwater-like scene with a drifting bright target.
///
/// Endless; the target is visible for part of every cycle so the classified
/// state moves through all bands.
pub struct SyntheticSource {
    width: usize,
    height: usize,
    next_id: u64,
    cycle: u64,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_seed(width, height, 0x5eed)
    }

    pub fn with_seed(width: u32, height: u32, seed: u64) -> Self {
        Self {
            width: width.max(1) as usize,
            height: height.max(1) as usize,
            next_id: 0,
            cycle: 120,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Target centre and radius for a frame, or `None` while it is hidden.
    fn target(&self, id: u64) -> Option<(f32, f32, f32)> {
        let phase = id % self.cycle;
        if phase >= self.cycle * 2 / 3 {
            return None;
        }
        let t = id as f32 / self.cycle as f32 * std::f32::consts::TAU;
        let cx = self.width as f32 * (0.5 + 0.35 * t.sin());
        let cy = self.height as f32 * (0.5 + 0.30 * (2.0 * t).cos());
        // grows while visible so the detector sees weak then strong evidence
        let growth = phase as f32 / (self.cycle as f32 * 2.0 / 3.0);
        let radius = (self.width.min(self.height) as f32) * (0.04 + 0.08 * growth);
        Some((cx, cy, radius))
    }

    fn render(&mut self, id: u64) -> drishti_core::Result<PixelBuffer> {
        let target = self.target(id);
        let mut data = Vec::with_capacity(self.width * self.height * 3);
        for y in 0..self.height {
            let depth = y as f32 / self.height as f32;
            let base_b = 90.0 - 40.0 * depth;
            let base_g = 70.0 - 35.0 * depth;
            let base_r = 20.0 - 10.0 * depth;
            for x in 0..self.width {
                let noise: f32 = self.rng.gen_range(-6.0..6.0);
                let glow = match target {
                    Some((cx, cy, r)) => {
                        let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
                        if d < r {
                            1.0
                        } else {
                            (1.0 - (d - r) / r).max(0.0) * 0.5
                        }
                    }
                    None => 0.0,
                };
                let mix = |base: f32| (base + (255.0 - base) * glow + noise).clamp(0.0, 255.0) as u8;
                data.push(mix(base_b));
                data.push(mix(base_g));
                data.push(mix(base_r));
            }
        }
        PixelBuffer::from_hwc(self.height, self.width, data, ChannelOrder::Bgr)
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Option<Frame> {
        let id = self.next_id;
        self.next_id += 1;
        Some(Frame {
            id,
            timestamp: wall_clock_secs(),
            pixels: self.render(id).ok(),
        })
    }
}

struct Injected {
    pixels: PixelBuffer,
    timestamp: f64,
}

/// Producer half of an injected source. Cheap to clone.
#[derive(Clone)]
pub struct FrameInjector {
    tx: mpsc::Sender<Injected>,
    accepted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl FrameInjector {
    /// Queue a frame. Returns `false` when the queue is full or the source
    /// has gone away; the frame is dropped in that case.
    pub fn push(&self, pixels: PixelBuffer) -> bool {
        let item = Injected {
            pixels,
            timestamp: wall_clock_secs(),
        };
        match self.tx.try_send(item) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Injected frame queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half: frames pushed by a [`FrameInjector`], ids in arrival order.
pub struct InjectedSource {
    rx: mpsc::Receiver<Injected>,
    next_id: u64,
}

impl InjectedSource {
    pub fn channel(capacity: usize) -> (FrameInjector, InjectedSource) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let injector = FrameInjector {
            tx,
            accepted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (injector, InjectedSource { rx, next_id: 0 })
    }
}

impl FrameSource for InjectedSource {
    /// Blocks until a frame arrives; ends once every injector is dropped.
    /// Must not be called from inside an async context.
    fn next_frame(&mut self) -> Option<Frame> {
        let item = self.rx.blocking_recv()?;
        let id = self.next_id;
        self.next_id += 1;
        Some(Frame::new(id, item.timestamp, item.pixels))
    }
}

/// Source selected by configuration, plus the injector when one exists.
pub fn from_config(config: &SourceConfig) -> Result<(Box<dyn FrameSource>, Option<FrameInjector>)> {
    if config.width == 0 || config.height == 0 {
        return Err(VisionError::Source("source resolution must be non-zero".to_string()));
    }
    match config.kind {
        SourceKind::Synthetic => Ok((Box::new(SyntheticSource::new(config.width, config.height)), None)),
        SourceKind::Injected => {
            let (injector, source) = InjectedSource::channel(config.queue_capacity);
            Ok((Box::new(source), Some(injector)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixels() -> PixelBuffer {
        PixelBuffer::from_hwc(2, 2, vec![1; 12], ChannelOrder::Rgb).unwrap()
    }

    #[test]
    fn test_synthetic_ids_increase() {
        let mut source = SyntheticSource::new(32, 24);
        let ids: Vec<u64> = (0..5).map(|_| source.next_frame().unwrap().id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_synthetic_frame_shape() {
        let mut source = SyntheticSource::new(32, 24);
        let frame = source.next_frame().unwrap();
        assert_eq!(frame.resolution(), Some((24, 32)));
        let pixels = frame.pixels.unwrap();
        assert_eq!(pixels.order(), ChannelOrder::Bgr);
        assert_eq!(pixels.channels(), Some(3));
        assert!(frame.timestamp > 0.0);
    }

    #[test]
    fn test_synthetic_same_seed_same_frames() {
        let mut a = SyntheticSource::with_seed(16, 16, 7);
        let mut b = SyntheticSource::with_seed(16, 16, 7);
        assert_eq!(a.next_frame().unwrap().pixels, b.next_frame().unwrap().pixels);
    }

    #[test]
    fn test_synthetic_target_hidden_part_of_cycle() {
        let source = SyntheticSource::new(64, 64);
        assert!(source.target(0).is_some());
        assert!(source.target(100).is_none());
        assert!(source.target(120).is_some());
    }

    #[test]
    fn test_injected_source_assigns_ids() {
        let (injector, mut source) = InjectedSource::channel(4);
        assert!(injector.push(pixels()));
        assert!(injector.push(pixels()));
        assert_eq!(source.next_frame().unwrap().id, 0);
        assert_eq!(source.next_frame().unwrap().id, 1);
        assert_eq!(injector.accepted(), 2);
    }

    #[test]
    fn test_injected_source_drops_when_full() {
        let (injector, mut source) = InjectedSource::channel(2);
        assert!(injector.push(pixels()));
        assert!(injector.push(pixels()));
        assert!(!injector.push(pixels()));
        assert_eq!(injector.dropped(), 1);

        drop(injector);
        assert!(source.next_frame().is_some());
        assert!(source.next_frame().is_some());
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn test_from_config() {
        let mut config = SourceConfig::default();
        let (_, injector) = from_config(&config).unwrap();
        assert!(injector.is_none());

        config.kind = SourceKind::Injected;
        let (_, injector) = from_config(&config).unwrap();
        assert!(injector.is_some());
    }

    #[test]
    fn test_iter_source() {
        let frames = vec![Frame::new(3, 0.0, pixels()), Frame::new(4, 0.1, pixels())];
        let mut source = IterSource::new(frames.into_iter());
        assert_eq!(source.next_frame().unwrap().id, 3);
        assert_eq!(source.next_frame().unwrap().id, 4);
        assert!(source.next_frame().is_none());
    }
}
