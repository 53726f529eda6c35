use std::{
    io::{BufRead, Write},
    process::ExitCode,
    sync::Arc,
};

use apps::AppManager;
use cli::{AppsCommand, Commands};
use config::{ConfigStore, FleetConfig};
use fleet::{
    DeployMarker, FleetStatus, MonitorDeps, NodeStatus, NodeStatusCollector, StatusMonitor,
    listener::LxcMonitorStream, reaper::DynoReaper,
};
use futures_util::future;
use remote::{LxcRuntime, SshExecutor};

mod apps;
mod cli;
mod config;
mod fleet;
mod remote;
mod signals;

#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    App(#[from] apps::AppError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

struct Services {
    store: ConfigStore,
    config: FleetConfig,
    runtime: Arc<LxcRuntime>,
    collector: NodeStatusCollector,
    ssh: SshExecutor,
    marker: DeployMarker,
}

impl Services {
    async fn init(store: ConfigStore) -> Result<Self, CommandError> {
        let config = store.load().await?;
        let settings = &config.settings;
        let ssh = SshExecutor::new(settings);
        let executor = Arc::new(ssh.clone());
        let marker = DeployMarker::new();
        let collector = NodeStatusCollector::new(
            Arc::new(store.clone()),
            executor.clone(),
            marker.clone(),
            settings.probe_timeout(),
            settings.remote_timeout(),
        );
        let runtime = Arc::new(LxcRuntime::new(executor, settings.remote_timeout()));
        Ok(Self {
            store,
            config,
            runtime,
            collector,
            ssh,
            marker,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = cli::get_cli_args();
    let store = ConfigStore::new(&args.config);

    let res = match &args.command {
        Commands::Monitor => monitor(store).await,
        Commands::Status { json } => status(store, *json).await,
        Commands::Apps(command) => apps(store, command).await,
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn monitor(store: ConfigStore) -> Result<(), CommandError> {
    let services = Services::init(store).await?;
    let settings = services.config.settings.clone();

    let (monitor, fleet) = StatusMonitor::new(MonitorDeps {
        config: Arc::new(services.store.clone()),
        collector: services.collector.clone(),
        reaper: DynoReaper::new(Arc::new(services.store.clone()), services.runtime.clone()),
        events: Arc::new(LxcMonitorStream::new(services.ssh.clone())),
        marker: services.marker.clone(),
        poll_interval: settings.poll_interval(),
        reconnect_delay: settings.listener_reconnect_delay(),
    });
    let monitor = tokio::spawn(monitor.run());

    signals::handle_sigint(fleet.clone());
    signals::handle_reload(
        services.store.clone(),
        fleet.clone(),
        tokio::runtime::Handle::current(),
    );
    signals::handle_deploy(fleet.clone(), tokio::runtime::Handle::current());
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    let summary = tokio::spawn(log_summaries(services.store, fleet, settings.poll_interval()));
    let res = monitor.await;
    summary.abort();
    if let Err(e) = res {
        log::error!("Status monitor crashed: {e}");
    }
    Ok(())
}

/// Periodically logs what the monitor currently knows about each node.
async fn log_summaries(store: ConfigStore, fleet: FleetStatus, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let hosts = match store.load().await {
            Ok(config) => config.hosts(),
            Err(e) => {
                log::warn!("Unable to read config for fleet summary: {e}");
                continue;
            }
        };
        let statuses = future::join_all(hosts.iter().map(|host| fleet.query(host))).await;
        let healthy = statuses.iter().filter(|status| status.is_ok()).count();
        log::info!("Fleet summary: {healthy}/{} nodes healthy", statuses.len());
        for status in &statuses {
            log::debug!("{}", summary_line(status));
        }
    }
}

fn summary_line(status: &NodeStatus) -> String {
    match &status.error {
        Some(e) => format!("{:<24} error: {e}", status.host),
        None => format!(
            "{:<24} {:>8} MB free  {}",
            status.host,
            status.free_memory_mb,
            status.containers.join(" ")
        ),
    }
}

async fn status(store: ConfigStore, json: bool) -> Result<(), CommandError> {
    let services = Services::init(store).await?;
    let statuses = services.collector.collect().await?;
    let mut stdout = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut stdout, &statuses)?;
        writeln!(stdout)?;
    } else {
        for status in &statuses {
            writeln!(stdout, "{}", summary_line(status))?;
        }
    }
    Ok(())
}

/// The operator has to type the application name back.
fn confirm_destroy(name: &str) -> std::io::Result<bool> {
    println!("This destroys {name}, its repository and all of its containers.");
    print!("Type the application name to confirm: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == name)
}

async fn apps(store: ConfigStore, command: &AppsCommand) -> Result<(), CommandError> {
    let manager = AppManager::new(store.clone());
    match command {
        AppsCommand::Create { name, build_pack } => {
            let app = manager.create(name, build_pack).await?;
            println!("Your new application {} is ready", app.name);
        }
        AppsCommand::Destroy { name, yes } => {
            if !yes && !confirm_destroy(name)? {
                println!("Aborted");
                return Ok(());
            }
            let services = Services::init(store).await?;
            let destroyed = manager
                .destroy(name, &services.collector, services.runtime.as_ref())
                .await?;
            println!("Application {name} destroyed ({destroyed} containers removed)");
        }
        AppsCommand::List => {
            for name in manager.list().await? {
                println!("{name}");
            }
        }
    }
    Ok(())
}
