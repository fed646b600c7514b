mod config;
mod console;
mod status;

use std::sync::Arc;

use anyhow::Context;
use sashlink_link::{
    BondSource, BondedPeripheral, BtleTransport, Capability, DeviceRegistry, LinkManager,
    SimulatedTransport, Transport,
};
use sashlink_mirror::{MemoryMirror, MirrorPublisher, RestMirror, StateMirror};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use config::{AppConfig, TransportKind};
use console::{Console, Flow};

const DEFAULT_LOG_FILTER: &str = "info,sashlink=debug";

/// Peripheral offered by the simulated transport.
const SIMULATED_NAME: &str = "Window actuator";
const SIMULATED_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter.unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with_filter_reloading();
    let log_reload = builder.reload_handle();
    builder.init();

    let config = load_config();
    if let (false, Some(directive)) = (from_env, config.log_filter.as_deref()) {
        match EnvFilter::try_new(directive) {
            Ok(filter) => {
                if let Err(e) = log_reload.reload(filter) {
                    tracing::warn!(error = %e, "failed to apply log filter");
                }
            }
            Err(e) => tracing::warn!(filter = directive, error = %e, "invalid log filter"),
        }
    }

    let (transport, bonds) = build_transport(config.transport).await?;
    let publisher = MirrorPublisher::new(build_mirror(&config)?);

    let manager = Arc::new(LinkManager::new(transport, Capability::always()));
    let registry = DeviceRegistry::new(bonds, Capability::always());
    let status = status::spawn_status_task(manager.subscribe(), publisher.clone());

    if let Some(address) = &config.device_address {
        if let Err(e) = manager.connect(address).await {
            tracing::warn!(address = %address, error = %e, "start-up connect failed");
        }
    }

    let mut console = Console::new(registry, manager.clone(), publisher);
    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match console.handle_line(&line).await {
            Flow::Continue(output) => {
                for l in output {
                    println!("{l}");
                }
            }
            Flow::Quit => break,
        }
    }

    manager.close().await;
    status.abort();
    tracing::info!("controller stopped");
    Ok(())
}

/// Loads the config, writing the defaults on first run so there is a file
/// to edit.
fn load_config() -> AppConfig {
    let path = match config::config_path() {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(error = %e, "no config location, using defaults");
            return AppConfig::default();
        }
    };
    let first_run = !path.exists();
    let config = AppConfig::load_from(&path).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
        AppConfig::default()
    });
    if first_run {
        if let Err(e) = config.save_to(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write default config");
        }
    }
    config
}

async fn build_transport(
    kind: TransportKind,
) -> anyhow::Result<(Arc<dyn Transport>, Arc<dyn BondSource>)> {
    match kind {
        TransportKind::Bluetooth => {
            let btle = Arc::new(
                BtleTransport::first_adapter()
                    .await
                    .context("failed to open Bluetooth adapter")?,
            );
            let bonds: Arc<dyn BondSource> = btle.clone();
            Ok((btle as Arc<dyn Transport>, bonds))
        }
        TransportKind::Simulated => {
            tracing::info!("using simulated transport");
            let sim = Arc::new(SimulatedTransport::auto_connecting().with_bonded(vec![
                BondedPeripheral::new(Some(SIMULATED_NAME), SIMULATED_ADDRESS),
            ]));
            let bonds: Arc<dyn BondSource> = sim.clone();
            Ok((sim as Arc<dyn Transport>, bonds))
        }
    }
}

fn build_mirror(config: &AppConfig) -> anyhow::Result<Arc<dyn StateMirror>> {
    match config.remote_mirror() {
        Some(remote) => {
            tracing::info!(base_url = %remote.base_url, "mirroring state to REST endpoint");
            let mirror = RestMirror::new(&remote.base_url, remote.auth_token.clone())
                .context("failed to create REST mirror")?;
            Ok(Arc::new(mirror))
        }
        None => Ok(Arc::new(MemoryMirror::new())),
    }
}
