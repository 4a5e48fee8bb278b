// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Anvil Telemetry Bridge CLI
//!
//! # Usage
//!
//! ```bash
//! # Run the bridge
//! anvil start --config anvil.toml
//!
//! # Override broker and database
//! anvil start --mqtt-host broker.local --mqtt-port 1883 \
//!     --db-url postgresql://admin:admin@db:5432/metrics
//!
//! # Generate a sample configuration
//! anvil gen-config --output anvil.toml
//!
//! # Check a configuration file
//! anvil validate --config anvil.toml
//!
//! # Show what a payload decodes to
//! anvil decode --topic devices/tank1/telemetry --payload '{"temperature": 80}'
//! ```
//!
//! The first Ctrl+C drains buffered batches and exits; a second one
//! stops immediately with a non-zero exit code.

use anyhow::{bail, Context};
use anvil::bridge;
use anvil::{BridgeConfig, BridgeError, PayloadDecoder};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Anvil MQTT telemetry bridge
#[derive(Parser, Debug)]
#[command(name = "anvil")]
#[command(about = "Anvil telemetry bridge - MQTT device telemetry to a time-series database")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "anvil.toml")]
        config: PathBuf,

        /// MQTT broker host
        #[arg(long)]
        mqtt_host: Option<String>,

        /// MQTT broker port
        #[arg(long)]
        mqtt_port: Option<u16>,

        /// Database connection URL
        #[arg(long)]
        db_url: Option<String>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "anvil.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Decode one payload and print the readings it produces
    Decode {
        /// Topic the payload would arrive on
        #[arg(short, long)]
        topic: String,

        /// JSON payload
        #[arg(short, long)]
        payload: String,

        /// Configuration file providing the decoder rules
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Start {
            config,
            mqtt_host,
            mqtt_port,
            db_url,
            log_level,
        } => {
            let mut config = load_config(&config)?;
            if let Some(host) = mqtt_host {
                config.bus.host = host;
            }
            if let Some(port) = mqtt_port {
                config.bus.port = port;
            }
            if let Some(url) = db_url {
                config.storage.url = url;
            }
            config.validate().context("invalid configuration")?;

            init_logging(log_level.as_deref().unwrap_or(&config.log_level));
            cmd_start(config).await
        }
        Commands::GenConfig { output } => cmd_gen_config(&output),
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Decode {
            topic,
            payload,
            config,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => BridgeConfig::default(),
            };
            cmd_decode(&config, &topic, &payload)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<BridgeConfig> {
    if !path.exists() {
        bail!(
            "configuration file {} not found (generate one with `anvil gen-config`)",
            path.display()
        );
    }
    BridgeConfig::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

async fn cmd_start(config: BridgeConfig) -> anyhow::Result<()> {
    info!("Anvil telemetry bridge v{}", env!("CARGO_PKG_VERSION"));

    let (stop, shutdown) = watch::channel(false);
    let run = bridge::run(&config, shutdown);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            info!("Shutting down, press Ctrl+C again to force");
            let _ = stop.send(true);

            tokio::select! {
                result = &mut run => result,
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for Ctrl+C")?;
                    warn!("Forced shutdown, buffered batches are not persisted");
                    Err(BridgeError::ForcedShutdown)
                }
            }
        }
    };

    match result {
        Ok(report) => {
            info!(
                exit = ?report.exit,
                acked = report.ingest.messages_acked,
                raw_written = report.raw.items_written,
                readings_written = report.readings.items_written,
                "Bridge exited cleanly"
            );
            Ok(())
        }
        Err(e) => {
            error!("Bridge failed: {}", e);
            Err(e.into())
        }
    }
}

fn cmd_gen_config(output: &Path) -> anyhow::Result<()> {
    let toml_str = BridgeConfig::sample_toml()?;

    let content = format!(
        r#"# Anvil Telemetry Bridge Configuration
# Generated by anvil gen-config

{}"#,
        toml_str
    );

    std::fs::write(output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let config = match BridgeConfig::from_file(path) {
        Ok(config) => config,
        Err(e) => bail!("Configuration invalid: {}", e),
    };

    println!("Configuration valid!");
    println!();
    println!(
        "Broker:  {}:{} (client id {}, qos {})",
        config.bus.host, config.bus.port, config.bus.client_id, config.bus.qos
    );
    println!("Topics:  {}", config.bus.topics.join(", "));
    println!("Storage: {:?}", config.storage.backend);
    println!(
        "Tables:  {} (raw), {} (readings)",
        config.storage.raw_table, config.storage.readings_table
    );
    println!("Device:  {}", config.decoder.device_rule);
    for (i, route) in config.decoder.routes.iter().enumerate() {
        println!("  route [{}] {}", i, route.topic_pattern);
    }
    println!(
        "Batch:   {} items / {} ms",
        config.batch.max_items, config.batch.max_wait_ms
    );
    Ok(())
}

fn cmd_decode(config: &BridgeConfig, topic: &str, payload: &str) -> anyhow::Result<()> {
    let decoder = PayloadDecoder::from_config(&config.decoder)?;
    let (readings, outcome) = decoder.decode(topic, payload.as_bytes(), Utc::now());

    for reading in &readings {
        println!("{}", serde_json::to_string(reading)?);
    }
    println!("outcome: {:?}", outcome);

    if outcome.is_failure() {
        bail!("payload produced no readings");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_generated_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anvil.toml");
        cmd_gen_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.bus.topics, vec!["telemetry/#".to_string()]);
    }
}
