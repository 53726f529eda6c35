use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::mpsc::Sender;

use crate::config::{ConfigError, FleetConfigSource};
use crate::fleet::{
    marker::DeployMarker,
    status::{NodeStatus, STATUS_CHECK_COMMAND},
};
use crate::remote::RemoteExecutor;

/// Fans out one status probe per configured node.
#[derive(Clone)]
pub struct NodeStatusCollector {
    config: Arc<dyn FleetConfigSource>,
    executor: Arc<dyn RemoteExecutor>,
    marker: DeployMarker,
    sequence: Arc<AtomicU64>,
    probe_timeout: Duration,
    remote_timeout: Duration,
}

impl NodeStatusCollector {
    pub fn new(
        config: Arc<dyn FleetConfigSource>,
        executor: Arc<dyn RemoteExecutor>,
        marker: DeployMarker,
        probe_timeout: Duration,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            config,
            executor,
            marker,
            sequence: Arc::new(AtomicU64::new(0)),
            probe_timeout,
            remote_timeout,
        }
    }

    /// Starts one detached probe per configured node and returns how many were
    /// started. Every probe delivers exactly one status on `results`: its own
    /// outcome or a timeout, whichever comes first.
    pub async fn check_nodes(&self, results: Sender<NodeStatus>) -> Result<usize, ConfigError> {
        let config = self.config.read_config().await?;
        let marker = self.marker.value();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!(
            "Checking {} nodes (round {sequence}, deploy marker {marker})",
            config.nodes.len()
        );

        for node in &config.nodes {
            let executor = Arc::clone(&self.executor);
            let results = results.clone();
            let host = node.host.clone();
            let probe_timeout = self.probe_timeout;
            let remote_timeout = self.remote_timeout;
            tokio::spawn(async move {
                let status = check_node(
                    executor.as_ref(),
                    &host,
                    marker,
                    sequence,
                    probe_timeout,
                    remote_timeout,
                )
                .await;
                if results.send(status).await.is_err() {
                    log::debug!("Status receiver for {host} is gone, dropping result");
                }
            });
        }
        Ok(config.nodes.len())
    }

    /// Runs a single round and waits for every node's answer.
    pub async fn collect(&self) -> Result<Vec<NodeStatus>, ConfigError> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let expected = self.check_nodes(tx).await?;
        let mut statuses = Vec::with_capacity(expected);
        while let Some(status) = rx.recv().await {
            statuses.push(status);
        }
        statuses.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(statuses)
    }
}

/// Probes one node. The probe future is dropped (and its ssh child killed)
/// when the deadline wins the race.
pub async fn check_node(
    executor: &dyn RemoteExecutor,
    host: &str,
    marker: i64,
    sequence: u64,
    probe_timeout: Duration,
    remote_timeout: Duration,
) -> NodeStatus {
    let probe = async {
        let output = executor.run(host, STATUS_CHECK_COMMAND, remote_timeout).await;
        NodeStatus::parse(host, marker, sequence, output)
    };

    tokio::select! {
        status = probe => {
            if let Some(e) = &status.error {
                log::warn!("Status check for {host} failed: {e}");
            }
            status
        }
        _ = tokio::time::sleep(probe_timeout) => {
            log::warn!("Status check for {host} timed out after {probe_timeout:?}");
            NodeStatus::timed_out(host, marker, sequence)
        }
    }
}
