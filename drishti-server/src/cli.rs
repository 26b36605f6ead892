// Command line for the server binary and the final config layer

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use drishti_core::{DrishtiConfig, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    Synthetic,
    Injected,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Synthetic => SourceKind::Synthetic,
            SourceArg::Injected => SourceKind::Injected,
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "drishti-server")]
#[command(about = "Drishti perception stream server", long_about = None)]
#[command(version)]
pub struct ServerArgs {
    /// Config file (TOML, YAML or JSON)
    #[arg(long, short, env = "DRISHTI_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long, short)]
    pub port: Option<u16>,

    /// Target frames per second
    #[arg(long)]
    pub fps: Option<u32>,

    #[arg(long, value_enum)]
    pub source: Option<SourceArg>,

    #[arg(long)]
    pub log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

impl ServerArgs {
    /// File, then `DRISHTI_*` environment, then flags; validated last.
    pub fn load_config(&self) -> drishti_core::Result<DrishtiConfig> {
        let mut config = match &self.config {
            Some(path) => DrishtiConfig::from_file(path)?,
            None => DrishtiConfig::default(),
        };
        config.apply_env();
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut DrishtiConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(fps) = self.fps {
            config.scheduler.target_fps = fps;
        }
        if let Some(source) = self.source {
            config.source.kind = source.into();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}
