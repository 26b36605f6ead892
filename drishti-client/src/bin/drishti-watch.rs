// Drishti stream viewer
// Follows a stream server from the terminal and logs what an operator would see

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use drishti_client::{validate_url, ClientConfig, ClientEvent, StreamClient, WsConnector};
use drishti_core::{init_tracing, ConnectionState, DrishtiConfig, LoggingConfig, ReconnectConfig};

#[derive(Parser, Debug)]
#[command(name = "drishti-watch")]
#[command(about = "Watch a Drishti perception stream", long_about = None)]
#[command(version)]
struct Args {
    /// Stream endpoint
    #[arg(default_value = "ws://127.0.0.1:9000/ws/stream")]
    url: String,

    /// Config file; only the `reconnect` and `logging` sections are read
    #[arg(long, short, env = "DRISHTI_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    base_delay_ms: Option<u64>,

    /// Retry on our own after FAILED instead of exiting
    #[arg(long)]
    retry_on_fail: bool,

    /// Overrides `logging.level` from the config file
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<(ReconnectConfig, LoggingConfig)> {
        let config = match &self.config {
            Some(path) => DrishtiConfig::from_file(path)?,
            None => DrishtiConfig::default(),
        };
        let (mut reconnect, mut logging) = (config.reconnect, config.logging);

        if let Some(max_attempts) = self.max_attempts {
            reconnect.max_attempts = max_attempts;
        }
        if let Some(base_delay_ms) = self.base_delay_ms {
            reconnect.base_delay_ms = base_delay_ms;
        }
        if let Some(level) = &self.log_level {
            logging.level = level.clone();
        }
        if self.json_logs {
            logging.json = true;
        }
        anyhow::ensure!(reconnect.max_attempts > 0, "max attempts must be at least 1");
        Ok((reconnect, logging))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (reconnect, logging) = args.load_config().context("failed to load configuration")?;
    init_tracing(&logging)?;
    validate_url(&args.url)?;
    let connector = WsConnector::new(Duration::from_millis(reconnect.connect_timeout_ms));
    let (client, mut events) = StreamClient::spawn(ClientConfig::new(&args.url, &reconnect), connector);
    info!("Watching {}", args.url);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::State(ConnectionState::Failed) => {
                        if !args.retry_on_fail {
                            warn!("Stream unreachable, giving up");
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(reconnect.max_delay_ms)).await;
                        client.retry().await?;
                    }
                    ClientEvent::State(state) => info!("Connection {}", state),
                    ClientEvent::Data(payload) => info!(
                        "Frame {} {} confidence={:.2} detections={} latency={:?}",
                        payload.frame_id,
                        payload.state.as_str(),
                        payload.max_confidence,
                        payload.detections.len(),
                        payload.system.latency_ms
                    ),
                    ClientEvent::Raw { frame_id, resolution, .. } => {
                        info!("Raw frame {} {}x{}", frame_id, resolution[1], resolution[0])
                    }
                    ClientEvent::System { status, message, cause } => info!(
                        "System {:?}: {} {}",
                        status,
                        message.as_deref().unwrap_or(""),
                        cause.as_deref().unwrap_or("")
                    ),
                    ClientEvent::Fps(fps) => info!("Viewer {:.1} fps", fps),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_defaults() {
        let args = Args::parse_from(["drishti-watch"]);
        let (reconnect, logging) = args.load_config().unwrap();
        assert_eq!(logging, LoggingConfig::default());
        assert_eq!(reconnect, ReconnectConfig::default());
    }

    #[test]
    fn test_flags_override_logging() {
        let args = Args::parse_from([
            "drishti-watch",
            "--log-level",
            "debug",
            "--json-logs",
            "--max-attempts",
            "2",
        ]);
        let (reconnect, logging) = args.load_config().unwrap();
        assert_eq!(logging.level, "debug");
        assert!(logging.json);
        assert_eq!(reconnect.max_attempts, 2);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let args = Args::parse_from(["drishti-watch", "--max-attempts", "0"]);
        assert!(args.load_config().is_err());
    }
}
