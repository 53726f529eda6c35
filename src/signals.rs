use crate::config::ConfigStore;
use crate::fleet::FleetStatus;
use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1},
    iterator::Signals,
};

/// What should we do when the user stops
/// this program?
pub fn handle_sigint(fleet: FleetStatus) {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).expect("No signals :(. This really should never happen");

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("Received signal {signal}, stopping");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            // The monitor drops its listener tasks and their ssh children on exit
            fleet.shutdown_blocking();
        }
    });
}

/// Re-reads the config on SIGHUP. Added nodes are watched, removed nodes are
/// forgotten.
pub fn handle_reload(store: ConfigStore, fleet: FleetStatus, rt_handle: tokio::runtime::Handle) {
    let mut signals = Signals::new([SIGHUP]).expect("No signals :(");

    std::thread::spawn(move || {
        for _ in signals.forever() {
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Reloading]);
            rt_handle.block_on(async {
                match store.load().await {
                    Ok(config) => {
                        log::info!("Config reloaded, {} nodes configured", config.nodes.len());
                        fleet.sync_nodes(config.hosts()).await;
                    }
                    Err(err) => log::error!("Unable to read new config: {err}"),
                }
            });
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
        }
    });
}

/// SIGUSR1 is sent by the deploy pipeline when a deploy begins. Probes that
/// are already in flight are discarded when they come back.
pub fn handle_deploy(fleet: FleetStatus, rt_handle: tokio::runtime::Handle) {
    let mut signals = Signals::new([SIGUSR1]).expect("No signals :(");

    std::thread::spawn(move || {
        for _ in signals.forever() {
            match rt_handle.block_on(fleet.begin_deploy()) {
                Some(marker) => log::info!("Deploy started, deploy marker is now {marker}"),
                None => log::warn!("Deploy signal received but the status monitor is gone"),
            }
        }
    });
}
