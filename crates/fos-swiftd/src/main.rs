//! fOS Swift daemon
//!
//! Runs the Swift engine against a file-backed store, a static server
//! directory and the simulated VPN manager. Host events are read from
//! stdin as newline-delimited JSON:
//!
//! ```text
//! {"channel":"settings","key":"swift-rules","value":{"value":[...]}}
//! {"channel":"tab","tab_id":1,"url":"https://example.com/","signal":"navigation-committed"}
//! {"channel":"network","tab_id":1,"url":"https://example.com/","resource_type":"main_frame","timestamp":0,"outcome":{"kind":"completed","status":451}}
//! ```
//!
//! Usage: `fos-swiftd [config.toml]`

mod config;

use anyhow::{Context, Result};
use config::SwiftdConfig;
use fos_swift::{
    Clock, FileStore, HostEvent, Runtime, StaticTabs, Store, SwiftEngine, SystemClock,
};
use fos_vpn::{Directory, StaticDirectory, VpnManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Capacity of the tab and network channels
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SwiftdConfig::load(config_path.as_deref()).context("Failed to load config")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("fOS Swift daemon starting...");

    let store: Arc<dyn Store> = Arc::new(
        FileStore::open(&config.store_path)
            .with_context(|| format!("Failed to open store {}", config.store_path.display()))?,
    );
    let directory: Arc<dyn Directory> = Arc::new(
        StaticDirectory::from_file(&config.directory_path).with_context(|| {
            format!("Failed to load directory {}", config.directory_path.display())
        })?,
    );
    let vpn = Arc::new(VpnManager::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let engine = Arc::new(
        SwiftEngine::new(store.clone(), clock.clone(), vpn.clone(), directory)
            .context("Failed to load Swift settings")?,
    );
    let runtime = Runtime::new(engine.clone(), store.clone(), clock, config.engine.clone())
        .with_host_tabs(Arc::new(StaticTabs(config.open_tabs.clone())));

    let (tab_tx, tab_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (net_tx, net_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let runtime_task = tokio::spawn(runtime.run(tab_rx, net_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: HostEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping line {}: {}", line_no, e);
                continue;
            }
        };

        match event {
            HostEvent::Tab(event) => tab_tx.send(event).await.context("Runtime stopped")?,
            HostEvent::Network(event) => net_tx.send(event).await.context("Runtime stopped")?,
            HostEvent::Settings { key, value } => {
                if let Err(e) = store.set_raw(&key, value) {
                    warn!("Failed to store {}: {}", key, e);
                }
            }
        }
    }

    drop(tab_tx);
    drop(net_tx);
    runtime_task.await.context("Runtime task failed")?;

    info!("{}", engine.status().await);
    info!("{}", vpn.status().await);
    info!(
        "Connect calls: {}, disconnect calls: {}",
        vpn.connect_calls(),
        vpn.disconnect_calls()
    );
    info!("fOS Swift daemon shutting down");
    Ok(())
}
