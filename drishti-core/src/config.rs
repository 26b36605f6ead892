// Layered configuration for the perception stream

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// When to attach the enhanced image to a data message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendEnhanced {
    Never,
    /// Only when the classified state is at least POTENTIAL_ANOMALY
    OnAnomaly,
    /// Every processed frame (debug)
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Synthetic,
    Injected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub target_fps: u32,
    pub max_fps: u32,
    pub recovery_interval_ms: u64,
    pub fps_window_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_fps: 12,
            max_fps: 15,
            recovery_interval_ms: 5000,
            fps_window_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.target_fps.max(1)))
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn fps_window(&self) -> Duration {
        Duration::from_millis(self.fps_window_ms)
    }
}

/// Lower bounds (inclusive) of the two alert bands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub potential_anomaly: f32,
    pub confirmed_threat: f32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            potential_anomaly: 0.40,
            confirmed_threat: 0.75,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Enhancer native (width, height)
    pub enhancer_resolution: [u32; 2],
    /// Detector native (width, height)
    pub detector_resolution: [u32; 2],
    pub send_enhanced: SendEnhanced,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            enhancer_resolution: [256, 256],
            detector_resolution: [640, 640],
            send_enhanced: SendEnhanced::OnAnomaly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session_buffer: usize,
    pub max_sessions: usize,
    pub jpeg_quality: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            session_buffer: 32,
            max_sessions: 64,
            jpeg_quality: 80,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub width: u32,
    pub height: u32,
    pub queue_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Synthetic,
            width: 640,
            height: 480,
            queue_capacity: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            max_attempts: 10,
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Full service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrishtiConfig {
    pub scheduler: SchedulerConfig,
    pub thresholds: ThresholdConfig,
    pub models: ModelConfig,
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub reconnect: ReconnectConfig,
    pub logging: LoggingConfig,
}

impl DrishtiConfig {
    /// Load configuration from a TOML, YAML or JSON file.
    ///
    /// Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("toml") => toml::from_str(&content).map_err(|e| Error::Parse(e.to_string())),
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| Error::Parse(e.to_string()))
            }
            Some("json") => serde_json::from_str(&content).map_err(|e| Error::Parse(e.to_string())),
            _ => Self::from_str(&content),
        }
    }

    /// Parse configuration of unknown format
    pub fn from_str(content: &str) -> Result<Self> {
        if let Ok(config) = serde_json::from_str::<DrishtiConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = toml::from_str::<DrishtiConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = serde_yaml::from_str::<DrishtiConfig>(content) {
            return Ok(config);
        }

        Err(Error::Parse("Unknown format".to_string()))
    }

    /// Apply `DRISHTI_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("DRISHTI_HOST") {
            self.server.host = host;
        }

        if let Some(port) = lookup("DRISHTI_PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.server.port = port;
        }

        if let Some(fps) = lookup("DRISHTI_TARGET_FPS").and_then(|f| f.parse::<u32>().ok()) {
            self.scheduler.target_fps = fps;
        }

        if let Some(level) = lookup("DRISHTI_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.target_fps == 0 {
            return Err(Error::Validation("scheduler.target_fps must be > 0".to_string()));
        }
        if s.target_fps > s.max_fps {
            return Err(Error::Validation(format!(
                "scheduler.target_fps ({}) exceeds scheduler.max_fps ({})",
                s.target_fps, s.max_fps
            )));
        }
        if s.fps_window_ms == 0 {
            return Err(Error::Validation("scheduler.fps_window_ms must be > 0".to_string()));
        }

        let t = &self.thresholds;
        if !(0.0..=1.0).contains(&t.potential_anomaly) || !(0.0..=1.0).contains(&t.confirmed_threat) {
            return Err(Error::Validation("thresholds must lie in [0, 1]".to_string()));
        }
        if t.potential_anomaly >= t.confirmed_threat {
            return Err(Error::Validation(
                "thresholds.potential_anomaly must be below thresholds.confirmed_threat".to_string(),
            ));
        }

        let m = &self.models;
        if m.enhancer_resolution.contains(&0) || m.detector_resolution.contains(&0) {
            return Err(Error::Validation("model resolutions must be non-zero".to_string()));
        }

        let srv = &self.server;
        if srv.port == 0 {
            return Err(Error::Validation("server.port cannot be 0".to_string()));
        }
        if srv.session_buffer == 0 {
            return Err(Error::Validation("server.session_buffer must be > 0".to_string()));
        }
        if srv.max_sessions == 0 {
            return Err(Error::Validation("server.max_sessions must be > 0".to_string()));
        }
        if srv.jpeg_quality == 0 || srv.jpeg_quality > 100 {
            return Err(Error::Validation("server.jpeg_quality must be between 1 and 100".to_string()));
        }

        let src = &self.source;
        if src.width == 0 || src.height == 0 {
            return Err(Error::Validation("source resolution must be non-zero".to_string()));
        }
        if src.queue_capacity == 0 {
            return Err(Error::Validation("source.queue_capacity must be > 0".to_string()));
        }

        let r = &self.reconnect;
        if r.base_delay_ms == 0 {
            return Err(Error::Validation("reconnect.base_delay_ms must be > 0".to_string()));
        }
        if r.base_delay_ms > r.max_delay_ms {
            return Err(Error::Validation(
                "reconnect.base_delay_ms cannot exceed reconnect.max_delay_ms".to_string(),
            ));
        }
        if r.max_attempts == 0 {
            return Err(Error::Validation("reconnect.max_attempts must be > 0".to_string()));
        }

        Ok(())
    }
}
