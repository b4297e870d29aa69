//! modlink host daemon: runs the in-process bus and the Route registry.

use std::sync::Arc;

use log::info;
use modlink_hostd::{bus, config, registry};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("modlink-hostd {VERSION}");
            return Ok(());
        }
    }
    env_logger::init();

    let cfg = config::load();
    let bus = bus::LocalBus::new();
    let store = Arc::new(config::FileSettingStore::new(cfg.setting_dir.clone()));
    let registry = registry::start(
        bus.transport(),
        &cfg.device_code,
        &cfg.device_name,
        store,
    )?;
    info!("modlink-hostd {VERSION} up, registry on device {}", cfg.device_code);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(shutdown_signal())?;
    registry.stop();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
