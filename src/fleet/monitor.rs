//! The status monitor: sole owner of the fleet status table.
//!
//! Everything that touches the table goes through one control loop. Ticks
//! start a detached collection round, probe results and live events arrive
//! on their own channels, and queries carry a private reply channel. The loop
//! handles one message at a time and never waits on the network itself.
//! Teardowns run in their own tasks and report the dynos they left standing,
//! so those are tried again on a later round.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::sync::{
    mpsc::{self, Receiver, Sender},
    oneshot,
};

use crate::config::FleetConfigSource;
use crate::fleet::{
    collector::NodeStatusCollector,
    dyno::DynoIdentity,
    listener::{DynoEvent, DynoState, EventListener, EventStream},
    marker::DeployMarker,
    reaper::{DynoReaper, superseded_dynos},
    status::{NO_MARKER, NodeStatus, ProbeError},
};

const CHANNEL_SIZE: usize = 256;

pub struct StatusQuery {
    host: String,
    reply: oneshot::Sender<NodeStatus>,
}

pub enum MonitorControl {
    /// The complete node list. New hosts are watched, hosts missing from it
    /// are forgotten.
    SyncNodes(Vec<String>),
    /// A deploy begins: bump the marker and reply with its new value.
    DeployStarted(oneshot::Sender<i64>),
    Shutdown,
}

/// Dynos a teardown task left standing on `host`.
struct Reaped {
    host: String,
    remaining: Vec<DynoIdentity>,
}

/// One unit of work for the control loop.
enum Command {
    Tick,
    Result(NodeStatus),
    Event(DynoEvent),
    Query(StatusQuery),
    Reaped(Reaped),
    Control(MonitorControl),
}

/// Cloneable handle for reading fleet state.
#[derive(Clone)]
pub struct FleetStatus {
    queries: Sender<StatusQuery>,
    control: Sender<MonitorControl>,
}

impl FleetStatus {
    /// Latest status of `host`. Hosts the monitor has no valid data for come
    /// back as a well formed error status.
    pub async fn query(&self, host: &str) -> NodeStatus {
        let (reply, rx) = oneshot::channel();
        let query = StatusQuery {
            host: host.to_string(),
            reply,
        };
        if self.queries.send(query).await.is_err() {
            return NodeStatus::failed(host, NO_MARKER, 0, ProbeError::MonitorUnavailable);
        }
        rx.await.unwrap_or_else(|_| {
            NodeStatus::failed(host, NO_MARKER, 0, ProbeError::MonitorUnavailable)
        })
    }

    pub async fn sync_nodes(&self, hosts: Vec<String>) {
        let _ = self.control.send(MonitorControl::SyncNodes(hosts)).await;
    }

    /// Marks the start of a deploy. Every probe issued before this call is
    /// discarded when it arrives. Returns `None` when the monitor is gone.
    pub async fn begin_deploy(&self) -> Option<i64> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(MonitorControl::DeployStarted(reply))
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.control.send(MonitorControl::Shutdown).await;
    }

    /// For callers outside the runtime, such as signal handler threads.
    pub fn shutdown_blocking(&self) {
        let _ = self.control.blocking_send(MonitorControl::Shutdown);
    }
}

pub struct MonitorDeps {
    pub config: Arc<dyn FleetConfigSource>,
    pub collector: NodeStatusCollector,
    pub reaper: DynoReaper,
    pub events: Arc<dyn EventStream>,
    pub marker: DeployMarker,
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
}

pub struct StatusMonitor {
    table: HashMap<String, NodeStatus>,
    last_sequence: HashMap<String, u64>,
    /// (host, container) pairs with a teardown already issued.
    reaping: HashSet<(String, String)>,
    config: Arc<dyn FleetConfigSource>,
    collector: NodeStatusCollector,
    reaper: DynoReaper,
    listener: EventListener,
    marker: DeployMarker,
    poll_interval: Duration,
    results_tx: Sender<NodeStatus>,
    results_rx: Receiver<NodeStatus>,
    reaped_tx: Sender<Reaped>,
    reaped_rx: Receiver<Reaped>,
    events_rx: Receiver<DynoEvent>,
    queries_rx: Receiver<StatusQuery>,
    control_rx: Receiver<MonitorControl>,
}

impl StatusMonitor {
    pub fn new(deps: MonitorDeps) -> (Self, FleetStatus) {
        let (results_tx, results_rx) = mpsc::channel(CHANNEL_SIZE);
        let (reaped_tx, reaped_rx) = mpsc::channel(CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_SIZE);
        let (queries_tx, queries_rx) = mpsc::channel(CHANNEL_SIZE);
        let (control_tx, control_rx) = mpsc::channel(8);

        let monitor = Self {
            table: HashMap::new(),
            last_sequence: HashMap::new(),
            reaping: HashSet::new(),
            config: deps.config,
            collector: deps.collector,
            reaper: deps.reaper,
            listener: EventListener::new(deps.events, events_tx, deps.reconnect_delay),
            marker: deps.marker,
            poll_interval: deps.poll_interval,
            results_tx,
            results_rx,
            reaped_tx,
            reaped_rx,
            events_rx,
            queries_rx,
            control_rx,
        };
        let handle = FleetStatus {
            queries: queries_tx,
            control: control_tx,
        };
        (monitor, handle)
    }

    pub async fn run(mut self) {
        log::info!("Status monitor started");

        // Every configured node is watched before the first tick or query.
        match self.config.read_config().await {
            Ok(config) => {
                for host in config.hosts() {
                    self.listener.register_host(&host);
                }
            }
            Err(e) => log::error!("Unable to read config, no nodes registered: {e}"),
        }

        // Initial round so that the first answers don't wait a full interval
        self.check_nodes();
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.tick().await;

        loop {
            let command = tokio::select! {
                _ = interval.tick() => Command::Tick,
                Some(status) = self.results_rx.recv() => Command::Result(status),
                Some(event) = self.events_rx.recv() => Command::Event(event),
                Some(query) = self.queries_rx.recv() => Command::Query(query),
                Some(reaped) = self.reaped_rx.recv() => Command::Reaped(reaped),
                control = self.control_rx.recv() => {
                    Command::Control(control.unwrap_or(MonitorControl::Shutdown))
                }
            };
            if !self.handle(command) {
                break;
            }
        }
        log::info!("Status monitor stopped");
    }

    /// Returns false once the loop should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Tick => self.check_nodes(),
            Command::Result(status) => {
                let host = status.host.clone();
                if let Some(dynos) = self.apply_result(status) {
                    self.reap(&host, dynos);
                }
            }
            Command::Event(event) => self.apply_event(event),
            Command::Query(query) => {
                let _ = query.reply.send(self.lookup(&query.host));
            }
            Command::Reaped(Reaped { host, remaining }) => {
                for dyno in remaining {
                    self.reaping.remove(&(host.clone(), dyno.to_string()));
                }
            }
            Command::Control(MonitorControl::SyncNodes(hosts)) => self.sync_nodes(hosts),
            Command::Control(MonitorControl::DeployStarted(reply)) => {
                let _ = reply.send(self.marker.bump());
            }
            Command::Control(MonitorControl::Shutdown) => return false,
        }
        true
    }

    fn check_nodes(&self) {
        let collector = self.collector.clone();
        let results = self.results_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = collector.check_nodes(results).await {
                log::error!("Unable to start node checks: {e}");
            }
        });
    }

    /// Stores a probe result if it is still valid, and returns the dynos on
    /// that host which have been superseded.
    fn apply_result(&mut self, status: NodeStatus) -> Option<Vec<DynoIdentity>> {
        if !self.marker.is_current(status.deploy_marker) {
            log::debug!(
                "Discarding stale status for {} (deploy marker {} != {})",
                status.host,
                status.deploy_marker,
                self.marker.value()
            );
            return None;
        }
        if let Some(&last) = self.last_sequence.get(&status.host) {
            if status.sequence < last {
                log::debug!(
                    "Discarding late status for {} from round {} (have round {last})",
                    status.host,
                    status.sequence
                );
                return None;
            }
        }

        let host = status.host.clone();
        self.last_sequence.insert(host.clone(), status.sequence);
        self.table.insert(host.clone(), status);

        let current = &self.table[&host];
        if !current.is_ok() {
            return None;
        }
        self.reaping
            .retain(|(h, name)| h != &host || current.containers.contains(name));

        let dynos: Vec<_> = superseded_dynos(&host, &self.table)
            .into_iter()
            .filter(|dyno| !self.reaping.contains(&(host.clone(), dyno.to_string())))
            .collect();
        Some(dynos)
    }

    fn reap(&mut self, host: &str, dynos: Vec<DynoIdentity>) {
        if dynos.is_empty() {
            return;
        }
        for dyno in &dynos {
            self.reaping.insert((host.to_string(), dyno.to_string()));
        }
        let reaper = self.reaper.clone();
        let reaped = self.reaped_tx.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            let remaining = reaper.reap(&host, dynos).await;
            if !remaining.is_empty() {
                let _ = reaped.send(Reaped { host, remaining }).await;
            }
        });
    }

    fn sync_nodes(&mut self, hosts: Vec<String>) {
        self.listener.retain_hosts(&hosts);
        for host in &hosts {
            self.listener.register_host(host);
        }
        self.table.retain(|host, _| hosts.contains(host));
        self.last_sequence.retain(|host, _| hosts.contains(host));
        self.reaping.retain(|(host, _)| hosts.contains(host));
    }

    fn apply_event(&mut self, event: DynoEvent) {
        let Some(status) = self.table.get_mut(&event.host) else {
            log::debug!("Ignoring event for untracked host {}", event.host);
            return;
        };
        if !status.is_ok() {
            return;
        }
        match event.state {
            DynoState::Running => {
                if !status.containers.contains(&event.container)
                    && DynoIdentity::parse(&event.container).is_ok()
                {
                    log::info!("{} started on {}", event.container, event.host);
                    status.containers.push(event.container);
                }
            }
            DynoState::Stopped => {
                let before = status.containers.len();
                status.containers.retain(|c| c != &event.container);
                if status.containers.len() != before {
                    log::info!("{} stopped on {}", event.container, event.host);
                }
            }
            _ => {}
        }
    }

    fn lookup(&self, host: &str) -> NodeStatus {
        self.table
            .get(host)
            .cloned()
            .unwrap_or_else(|| NodeStatus::unknown(host))
    }
}
