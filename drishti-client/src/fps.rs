use std::time::Duration;
use tokio::time::Instant;

/// Accepted-frame rate, sampled once per window.
///
/// Independent of the session watermark, so it keeps counting across
/// reconnects.
#[derive(Debug, Clone)]
pub struct FpsMeter {
    window: Duration,
    window_start: Instant,
    count: u64,
    last: Option<f64>,
}

impl FpsMeter {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            window_start: now,
            count: 0,
            last: None,
        }
    }

    pub fn record(&mut self) {
        self.count += 1;
    }

    /// Close the window if it has elapsed and return the new rate.
    pub fn sample(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window || elapsed.is_zero() {
            return None;
        }
        let fps = self.count as f64 / elapsed.as_secs_f64();
        self.count = 0;
        self.window_start = now;
        self.last = Some(fps);
        Some(fps)
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_per_window() {
        let start = Instant::now();
        let mut meter = FpsMeter::new(Duration::from_secs(1), start);
        for _ in 0..12 {
            meter.record();
        }
        assert_eq!(meter.sample(start + Duration::from_millis(500)), None);

        let fps = meter.sample(start + Duration::from_secs(1)).unwrap();
        assert!((fps - 12.0).abs() < 1e-9);
        assert_eq!(meter.last(), Some(fps));

        // counter was reset
        assert_eq!(meter.sample(start + Duration::from_secs(2)), Some(0.0));
    }
}
