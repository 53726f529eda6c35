use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::config::FleetConfigSource;
use crate::fleet::{
    dyno::{DynoIdentity, DynoSlot},
    status::NodeStatus,
};
use crate::remote::ContainerRuntime;

/// Dynos on `host` that run an older version of a slot whose newest version
/// is observed somewhere in `table`. Names that are not dyno names never show
/// up here.
pub fn superseded_dynos(host: &str, table: &HashMap<String, NodeStatus>) -> Vec<DynoIdentity> {
    let parsed: Vec<(&str, DynoIdentity)> = table
        .values()
        .filter(|status| status.is_ok())
        .flat_map(|status| {
            status
                .containers
                .iter()
                .filter_map(|name| DynoIdentity::parse(name).ok())
                .map(|dyno| (status.host.as_str(), dyno))
        })
        .collect();

    let mut newest: HashMap<DynoSlot<'_>, u64> = HashMap::new();
    for (_, dyno) in &parsed {
        let version = newest.entry(dyno.slot()).or_insert(dyno.version);
        *version = (*version).max(dyno.version);
    }

    let mut seen = HashSet::new();
    parsed
        .iter()
        .filter(|(owner, dyno)| *owner == host && dyno.version < newest[&dyno.slot()])
        .filter(|(_, dyno)| seen.insert(dyno.clone()))
        .map(|(_, dyno)| dyno.clone())
        .collect()
}

/// Best effort teardown of superseded dynos, off the monitor loop.
#[derive(Clone)]
pub struct DynoReaper {
    config: Arc<dyn FleetConfigSource>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl DynoReaper {
    pub fn new(config: Arc<dyn FleetConfigSource>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { config, runtime }
    }

    /// Destroys the dynos that belong to configured applications and
    /// returns the ones left standing, either skipped or failed.
    pub async fn reap(&self, host: &str, dynos: Vec<DynoIdentity>) -> Vec<DynoIdentity> {
        let config = match self.config.read_config().await {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Skipping teardown on {host}, unable to read config: {e}");
                return dynos;
            }
        };

        let mut remaining = Vec::new();
        for dyno in dynos {
            if !config.has_application(&dyno.app) {
                log::debug!(
                    "Leaving {dyno} on {host} alone, {} is not a configured app",
                    dyno.app
                );
                remaining.push(dyno);
                continue;
            }
            log::info!("Tearing down superseded dyno {dyno} on {host}");
            if let Err(e) = self.runtime.destroy(host, &dyno.to_string()).await {
                log::warn!("Failed to tear down {dyno} on {host}: {e}");
                remaining.push(dyno);
            }
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::collector::testing::StaticConfig;
    use crate::remote::testing::RecordingRuntime;

    fn table(entries: &[(&str, &str)]) -> HashMap<String, NodeStatus> {
        entries
            .iter()
            .map(|(host, output)| {
                (
                    host.to_string(),
                    NodeStatus::parse(host, 0, 1, Ok(output.to_string())),
                )
            })
            .collect()
    }

    fn names(dynos: Vec<DynoIdentity>) -> Vec<String> {
        let mut names: Vec<_> = dynos.iter().map(|d| d.to_string()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_older_sibling_on_same_host() {
        let table = table(&[("a", "100 app_v1_web_1 app_v2_web_1 app_v1_worker_1")]);
        assert_eq!(names(superseded_dynos("a", &table)), vec!["app_v1_web_1"]);
    }

    #[test]
    fn test_newest_version_elsewhere_in_fleet() {
        let table = table(&[
            ("a", "100 app_v3_web_1"),
            ("b", "100 app_v2_web_1 app_v2_web_2 other_v1_web_1"),
        ]);
        assert_eq!(names(superseded_dynos("b", &table)), vec!["app_v2_web_1"]);
        assert!(superseded_dynos("a", &table).is_empty());
    }

    #[test]
    fn test_foreign_names_untouched() {
        let table = table(&[("a", "100 app_v2_web_1 app_v1_web_1_old postgres app-v1-web-1")]);
        assert!(superseded_dynos("a", &table).is_empty());
    }

    #[test]
    fn test_failed_hosts_ignored() {
        let mut table = table(&[("a", "100 app_v1_web_1")]);
        table.insert("b".to_string(), NodeStatus::timed_out("b", 0, 1));
        assert!(superseded_dynos("a", &table).is_empty());
    }

    #[test]
    fn test_already_pruned_table_is_stable() {
        let table = table(&[
            ("a", "100 app_v3_web_1 app_v3_web_2 api_v7_worker_1"),
            ("b", "100 app_v3_web_3 api_v7_worker_2"),
        ]);
        for host in ["a", "b"] {
            assert!(superseded_dynos(host, &table).is_empty());
        }
    }

    #[test]
    fn test_duplicates_reported_once() {
        let table = table(&[("a", "100 app_v1_web_1 app_v1_web_1 app_v2_web_1")]);
        assert_eq!(names(superseded_dynos("a", &table)), vec!["app_v1_web_1"]);
    }

    #[tokio::test]
    async fn test_reap_only_configured_apps() {
        let (runtime, mut calls) = RecordingRuntime::new();
        let reaper = DynoReaper::new(
            Arc::new(StaticConfig::with_hosts(&["a"]).with_apps(&["app"])),
            Arc::new(runtime),
        );

        let remaining = reaper
            .reap(
                "a",
                vec![
                    DynoIdentity::new("app", 1, "web", 1),
                    DynoIdentity::new("stranger", 1, "web", 1),
                ],
            )
            .await;

        assert_eq!(remaining, vec![DynoIdentity::new("stranger", 1, "web", 1)]);
        assert_eq!(
            calls.recv().await,
            Some(("a".to_string(), "app_v1_web_1".to_string()))
        );
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reap_continues_after_failure() {
        let (mut runtime, mut calls) = RecordingRuntime::new();
        runtime.failing.push("a".to_string());
        let reaper = DynoReaper::new(
            Arc::new(StaticConfig::with_hosts(&["a"]).with_apps(&["app"])),
            Arc::new(runtime),
        );

        let remaining = reaper
            .reap(
                "a",
                vec![
                    DynoIdentity::new("app", 1, "web", 1),
                    DynoIdentity::new("app", 1, "web", 2),
                ],
            )
            .await;

        assert_eq!(remaining.len(), 2);
        assert!(calls.recv().await.is_some());
        assert!(calls.recv().await.is_some());
    }
}
