use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "node")]
    pub nodes: Vec<Node>,
    #[serde(default, rename = "application")]
    pub applications: Vec<Application>,
}

impl FleetConfig {
    pub fn hosts(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.host.clone()).collect()
    }

    pub fn has_application(&self, name: &str) -> bool {
        self.applications.iter().any(|app| app.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Application {
    pub name: String,
    pub build_pack: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Process type to instance count.
    #[serde(default)]
    pub processes: HashMap<String, u32>,
    #[serde(default)]
    pub maintenance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Seconds between two polling rounds (default: 15)
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Seconds a single probe may take before it is reported as timed out (default: 30)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    /// Seconds handed to the process level `timeout` guard around ssh (default: 60)
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout: u64,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_options")]
    pub ssh_options: Vec<String>,
    #[serde(default = "default_git_directory")]
    pub git_directory: PathBuf,
    #[serde(default = "default_listener_reconnect_delay_ms")]
    pub listener_reconnect_delay_ms: u64,
    /// Program invoked by the git hooks on push. Hooks are not installed without it.
    #[serde(default)]
    pub receive_command: Option<String>,
}

fn default_poll_interval() -> u64 {
    15
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_remote_timeout() -> u64 {
    60
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_ssh_options() -> Vec<String> {
    [
        "-o",
        "BatchMode=yes",
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "ConnectTimeout=10",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_git_directory() -> PathBuf {
    PathBuf::from("/git")
}

fn default_listener_reconnect_delay_ms() -> u64 {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            probe_timeout: default_probe_timeout(),
            remote_timeout: default_remote_timeout(),
            ssh_user: default_ssh_user(),
            ssh_options: default_ssh_options(),
            git_directory: default_git_directory(),
            listener_reconnect_delay_ms: default_listener_reconnect_delay_ms(),
            receive_command: None,
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout)
    }

    pub fn listener_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.listener_reconnect_delay_ms)
    }
}

/// Read access to the fleet configuration, as consumed by the status monitor.
#[async_trait]
pub trait FleetConfigSource: Send + Sync {
    async fn read_config(&self) -> Result<FleetConfig, ConfigError>;
}

/// The persisted configuration file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_init_from_string(val: &str) -> Result<FleetConfig, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    pub async fn load(&self) -> Result<FleetConfig, ConfigError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(config) => Self::try_init_from_string(&config),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config file {:?} not found, using an empty fleet", self.path);
                Ok(FleetConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read, modify and persist the configuration. Nothing is written when `f` fails.
    pub async fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut FleetConfig) -> Result<T, E>,
        E: From<ConfigError>,
    {
        let mut config = self.load().await?;
        let out = f(&mut config)?;
        self.save(&config).await?;
        Ok(out)
    }

    async fn save(&self, config: &FleetConfig) -> Result<(), ConfigError> {
        let rendered = toml::to_string_pretty(config)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, rendered).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl FleetConfigSource for ConfigStore {
    async fn read_config(&self) -> Result<FleetConfig, ConfigError> {
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = ConfigStore::try_init_from_string(
            r#"
            [[node]]
            host = "10.0.0.5"

            [[node]]
            host = "10.0.0.6"
        "#,
        )
        .expect("Failed to parse config");

        assert_eq!(config.hosts(), vec!["10.0.0.5", "10.0.0.6"]);
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.settings.probe_timeout(), Duration::from_secs(30));
        assert!(config.applications.is_empty());
    }

    #[test]
    fn test_settings_override() {
        let config = ConfigStore::try_init_from_string(
            r#"
            [settings]
            poll_interval = 5
            ssh_user = "deploy"
            receive_command = "/usr/local/bin/receive"

            [[application]]
            name = "myapp"
            build_pack = "python"
            processes = { web = 2 }
        "#,
        )
        .expect("Failed to parse config");

        assert_eq!(config.settings.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.settings.ssh_user, "deploy");
        assert_eq!(config.settings.remote_timeout, 60);
        assert_eq!(
            config.settings.receive_command.as_deref(),
            Some("/usr/local/bin/receive")
        );
        assert!(config.has_application("myapp"));
        assert_eq!(config.applications[0].processes.get("web"), Some(&2));
    }

    #[test]
    fn test_invalid_toml() {
        let res = ConfigStore::try_init_from_string("[[node]]\nhost = ");
        assert!(matches!(res, Err(ConfigError::Toml(_))), "{:?}", res);
    }

    #[tokio::test]
    async fn test_update_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("fleetd.toml"));

        // Missing file behaves like an empty fleet
        assert_eq!(store.load().await.unwrap(), FleetConfig::default());

        store
            .update(|cfg| {
                cfg.nodes.push(Node {
                    host: "node-1".to_string(),
                });
                Ok::<_, ConfigError>(())
            })
            .await
            .unwrap();

        let reloaded = store.read_config().await.unwrap();
        assert_eq!(reloaded.hosts(), vec!["node-1"]);
    }

    #[tokio::test]
    async fn test_failed_update_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("fleetd.toml"));

        let res: Result<(), ConfigError> = store
            .update(|cfg| {
                cfg.nodes.push(Node {
                    host: "node-1".to_string(),
                });
                Err(ConfigError::Io(std::io::Error::other("boom")))
            })
            .await;

        assert!(res.is_err());
        assert!(!store.path().exists());
    }
}
