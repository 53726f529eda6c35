//! Live container lifecycle events.
//!
//! Every registered node gets one long-lived `lxc-monitor` process streamed
//! over ssh. Lines are parsed into [`DynoEvent`]s and handed to the status
//! monitor. A stream that fails to start or reaches EOF is restarted after
//! a short delay, for as long as the listener lives.

use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::mpsc::Sender,
    task::{AbortHandle, JoinSet},
};

use crate::remote::SshExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynoState {
    Running,
    Stopped,
    /// Transitional states such as STARTING or STOPPING.
    Other,
}

impl DynoState {
    fn from_lxc(state: &str) -> Self {
        match state {
            "RUNNING" => DynoState::Running,
            "STOPPED" => DynoState::Stopped,
            _ => DynoState::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynoEvent {
    pub host: String,
    pub container: String,
    pub state: DynoState,
}

impl DynoEvent {
    /// Parses an lxc-monitor line such as `'app_v1_web_1' changed state to [RUNNING]`.
    pub fn parse(host: &str, line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix('\'')?;
        let (container, rest) = rest.split_once('\'')?;
        let state = rest
            .trim()
            .strip_prefix("changed state to [")?
            .strip_suffix(']')?;
        if container.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            container: container.to_string(),
            state: DynoState::from_lxc(state),
        })
    }
}

/// Builds the process that streams events for one node.
pub trait EventStream: Send + Sync {
    fn attach_command(&self, host: &str) -> Command;
}

pub struct LxcMonitorStream {
    ssh: SshExecutor,
}

impl LxcMonitorStream {
    pub fn new(ssh: SshExecutor) -> Self {
        Self { ssh }
    }
}

impl EventStream for LxcMonitorStream {
    fn attach_command(&self, host: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh.options())
            .args(["-o", "ServerAliveInterval=15"])
            .arg(self.ssh.destination(host))
            .args(["sudo", "lxc-monitor", "'.*'"]);
        cmd
    }
}

/// Owns one event stream task per registered host. Dropping the listener
/// aborts the tasks, which kills their subprocesses.
pub struct EventListener {
    source: Arc<dyn EventStream>,
    events: Sender<DynoEvent>,
    reconnect_delay: Duration,
    registered: HashMap<String, AbortHandle>,
    tasks: JoinSet<()>,
}

impl EventListener {
    pub fn new(
        source: Arc<dyn EventStream>,
        events: Sender<DynoEvent>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            source,
            events,
            reconnect_delay,
            registered: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Starts watching `host`. Returns false when it is already watched.
    pub fn register_host(&mut self, host: &str) -> bool {
        if self.registered.contains_key(host) {
            return false;
        }
        log::info!("Attaching event listener to {host}");
        let handle = self.tasks.spawn(attach(
            Arc::clone(&self.source),
            host.to_string(),
            self.events.clone(),
            self.reconnect_delay,
        ));
        self.registered.insert(host.to_string(), handle);
        true
    }

    /// Stops watching every host not in `hosts`.
    pub fn retain_hosts(&mut self, hosts: &[String]) {
        self.registered.retain(|host, handle| {
            let keep = hosts.contains(host);
            if !keep {
                log::info!("Detaching event listener from {host}");
                handle.abort();
            }
            keep
        });
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.registered.len()
    }
}

async fn attach(
    source: Arc<dyn EventStream>,
    host: String,
    events: Sender<DynoEvent>,
    reconnect_delay: Duration,
) {
    loop {
        let mut cmd = source.attach_command(&host);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match cmd.spawn() {
            Err(e) => log::warn!("Unable to start event stream for {host}: {e}"),
            Ok(mut child) => {
                if let Some(stdout) = child.stdout.take() {
                    let mut lines = BufReader::new(stdout).lines();
                    loop {
                        match lines.next_line().await {
                            Ok(Some(line)) => {
                                log::debug!("[{host}] {line}");
                                let Some(event) = DynoEvent::parse(&host, &line) else {
                                    continue;
                                };
                                if events.send(event).await.is_err() {
                                    // Nobody is consuming events anymore
                                    return;
                                }
                            }
                            Ok(None) => {
                                log::warn!("Event stream for {host} ended");
                                break;
                            }
                            Err(e) => {
                                log::warn!("Error reading event stream for {host}: {e}");
                                break;
                            }
                        }
                    }
                }
                let _ = child.kill().await;
            }
        }

        if events.is_closed() {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
        log::info!("Reconnecting event stream for {host}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Emits a single event line for the host and exits, so every
    /// reconnect produces exactly one more event.
    struct EchoStream;

    impl EventStream for EchoStream {
        fn attach_command(&self, host: &str) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(format!(
                "echo 'noise line'; echo \"'{host}_v1_web_1' changed state to [RUNNING]\""
            ));
            cmd
        }
    }

    struct MissingBinary;

    impl EventStream for MissingBinary {
        fn attach_command(&self, _host: &str) -> Command {
            Command::new("/nonexistent/fleetd-event-stream")
        }
    }

    #[test]
    fn test_parse_lxc_monitor_line() {
        let event = DynoEvent::parse("node-1", "'app_v2_web_1' changed state to [STOPPED]")
            .expect("valid line");
        assert_eq!(
            event,
            DynoEvent {
                host: "node-1".to_string(),
                container: "app_v2_web_1".to_string(),
                state: DynoState::Stopped,
            }
        );
        let event = DynoEvent::parse("node-1", "'c' changed state to [FROZEN]").unwrap();
        assert_eq!(event.state, DynoState::Other);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(DynoEvent::parse("n", ""), None);
        assert_eq!(DynoEvent::parse("n", "lxc-monitor: connected"), None);
        assert_eq!(DynoEvent::parse("n", "'' changed state to [RUNNING]"), None);
        assert_eq!(DynoEvent::parse("n", "'app' changed state to RUNNING"), None);
    }

    #[tokio::test]
    async fn test_reconnects_after_eof() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut listener = EventListener::new(Arc::new(EchoStream), tx, Duration::from_millis(10));
        assert!(listener.register_host("n1"));

        // Each run exits after one event, so three events prove two reconnects
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("event stream did not reconnect")
                .expect("channel closed");
            assert_eq!(event.host, "n1");
            assert_eq!(event.container, "n1_v1_web_1");
            assert_eq!(event.state, DynoState::Running);
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut listener = EventListener::new(Arc::new(EchoStream), tx, Duration::from_secs(3600));
        assert!(listener.register_host("a"));
        assert!(!listener.register_host("a"));
        assert!(listener.register_host("b"));
        assert_eq!(listener.registered(), 2);

        let mut hosts = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            hosts.push(event.host);
        }
        hosts.sort();
        assert_eq!(hosts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_retain_hosts_detaches_removed() {
        let (tx, _rx) = mpsc::channel(8);
        let mut listener = EventListener::new(Arc::new(EchoStream), tx, Duration::from_secs(3600));
        listener.register_host("a");
        listener.register_host("b");

        listener.retain_hosts(&["b".to_string()]);

        assert_eq!(listener.registered(), 1);
        // A detached host can be attached again later
        assert!(listener.register_host("a"));
        assert!(!listener.register_host("b"));
    }

    #[tokio::test]
    async fn test_spawn_failure_keeps_other_hosts_alive() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut broken = EventListener::new(Arc::new(MissingBinary), tx.clone(), Duration::from_millis(5));
        let mut working = EventListener::new(Arc::new(EchoStream), tx, Duration::from_secs(3600));
        broken.register_host("dead");
        working.register_host("alive");

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.host, "alive");
    }
}
