use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::remote::RemoteError;

/// Free memory first, then the running app containers, all on one line.
pub const STATUS_CHECK_COMMAND: &str = r#"echo $(free -m | awk '/^Mem:/ {print $NF}') $(sudo lxc-ls --running -1 | grep '^[^_]\+_v[0-9]\+_[^_]\+_[^_]\+$' | tr '\n' ' ')"#;

/// Sentinel for an unknown amount of free memory.
pub const UNKNOWN_MEMORY: i64 = -1;

/// Marker carried by statuses the monitor synthesizes for hosts it never saw.
pub const NO_MARKER: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum ProbeError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timed out for host {0}")]
    Timeout(String),
    #[error("Parse failed for input '{0}'")]
    Empty(String),
    #[error("Integer conversion failed for token '{token}' (tokens={tokens:?})")]
    FreeMemory { token: String, tokens: Vec<String> },
    #[error("Unknown host {0}")]
    UnknownHost(String),
    #[error("Status monitor is not running")]
    MonitorUnavailable,
}

/// Snapshot of one node, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub host: String,
    pub free_memory_mb: i64,
    pub containers: Vec<String>,
    pub deploy_marker: i64,
    /// Polling round the probe was issued in.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub error: Option<ProbeError>,
}

impl NodeStatus {
    pub fn failed(host: &str, deploy_marker: i64, sequence: u64, error: ProbeError) -> Self {
        Self {
            host: host.to_string(),
            free_memory_mb: UNKNOWN_MEMORY,
            containers: Vec::new(),
            deploy_marker,
            sequence,
            timestamp: Utc::now(),
            error: Some(error),
        }
    }

    pub fn timed_out(host: &str, deploy_marker: i64, sequence: u64) -> Self {
        Self::failed(
            host,
            deploy_marker,
            sequence,
            ProbeError::Timeout(host.to_string()),
        )
    }

    pub fn unknown(host: &str) -> Self {
        Self::failed(host, NO_MARKER, 0, ProbeError::UnknownHost(host.to_string()))
    }

    /// Builds a status from the raw output of [`STATUS_CHECK_COMMAND`].
    pub fn parse(
        host: &str,
        deploy_marker: i64,
        sequence: u64,
        output: Result<String, RemoteError>,
    ) -> Self {
        let input = match output {
            Ok(input) => input,
            Err(e) => {
                return Self::failed(
                    host,
                    deploy_marker,
                    sequence,
                    ProbeError::Transport(e.to_string()),
                );
            }
        };

        let tokens: Vec<&str> = input.split_whitespace().collect();
        let Some((first, rest)) = tokens.split_first() else {
            return Self::failed(host, deploy_marker, sequence, ProbeError::Empty(input));
        };

        // Plain decimal digits only, so neither a sign nor a negative slips through
        let parsed = first
            .bytes()
            .all(|b| b.is_ascii_digit())
            .then(|| first.parse::<i64>().ok())
            .flatten();
        let free_memory_mb = match parsed {
            Some(mb) => mb,
            None => {
                return Self::failed(
                    host,
                    deploy_marker,
                    sequence,
                    ProbeError::FreeMemory {
                        token: first.to_string(),
                        tokens: tokens.iter().map(|t| t.to_string()).collect(),
                    },
                );
            }
        };

        Self {
            host: host.to_string(),
            free_memory_mb,
            containers: rest.iter().map(|c| c.to_string()).collect(),
            deploy_marker,
            sequence,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> NodeStatus {
        NodeStatus::parse("node-1", 3, 7, Ok(input.to_string()))
    }

    #[test]
    fn test_parse_memory_and_containers() {
        let status = parse("512 myapp-v1-web-1 myapp-v1-worker-1\n");
        assert_eq!(status.error, None);
        assert_eq!(status.free_memory_mb, 512);
        assert_eq!(
            status.containers,
            vec!["myapp-v1-web-1", "myapp-v1-worker-1"]
        );
        assert_eq!(status.deploy_marker, 3);
        assert_eq!(status.sequence, 7);
        assert_eq!(status.host, "node-1");
    }

    #[test]
    fn test_parse_keeps_order_and_duplicates() {
        let status = parse("  64   b_v1_web_1 a_v1_web_1 b_v1_web_1 ");
        assert_eq!(
            status.containers,
            vec!["b_v1_web_1", "a_v1_web_1", "b_v1_web_1"]
        );
    }

    #[test]
    fn test_parse_memory_only() {
        let status = parse("2048");
        assert!(status.is_ok());
        assert_eq!(status.free_memory_mb, 2048);
        assert!(status.containers.is_empty());
    }

    #[test]
    fn test_parse_empty_input() {
        let status = parse("   \n");
        assert!(matches!(status.error, Some(ProbeError::Empty(_))));
        assert_eq!(status.free_memory_mb, UNKNOWN_MEMORY);
        assert!(status.containers.is_empty());
    }

    #[test]
    fn test_parse_bad_token_is_named() {
        let status = parse("abc foo");
        assert_eq!(
            status.error,
            Some(ProbeError::FreeMemory {
                token: "abc".to_string(),
                tokens: vec!["abc".to_string(), "foo".to_string()],
            })
        );
        let message = status.error.unwrap().to_string();
        assert!(message.contains("'abc'"), "{message}");
        assert!(message.contains("foo"), "{message}");
    }

    #[test]
    fn test_parse_negative_memory_rejected() {
        let status = parse("-5 app_v1_web_1");
        assert!(matches!(status.error, Some(ProbeError::FreeMemory { .. })));
        assert_eq!(status.free_memory_mb, UNKNOWN_MEMORY);
    }

    #[test]
    fn test_parse_memory_full_range() {
        let status = parse("8589934592 app_v1_web_1");
        assert_eq!(status.error, None);
        assert_eq!(status.free_memory_mb, 8_589_934_592);

        for token in ["+5", "5.0", "0x10"] {
            let status = parse(token);
            assert!(
                matches!(&status.error, Some(ProbeError::FreeMemory { token: t, .. }) if t == token),
                "{token}"
            );
        }
    }

    #[test]
    fn test_parse_transport_error() {
        let status = NodeStatus::parse(
            "node-1",
            0,
            1,
            Err(RemoteError::CommandFailed {
                host: "node-1".to_string(),
                code: Some(255),
                output: "Connection refused".to_string(),
            }),
        );
        match status.error {
            Some(ProbeError::Transport(message)) => {
                assert!(message.contains("Connection refused"))
            }
            other => panic!("Expected a transport error, found {:?}", other),
        }
        assert_eq!(status.free_memory_mb, UNKNOWN_MEMORY);
        assert_eq!(status.deploy_marker, 0);
    }

    #[test]
    fn test_unknown_host_status() {
        let status = NodeStatus::unknown("ghost");
        assert_eq!(status.deploy_marker, NO_MARKER);
        assert_eq!(status.free_memory_mb, UNKNOWN_MEMORY);
        assert_eq!(
            status.error,
            Some(ProbeError::UnknownHost("ghost".to_string()))
        );
    }
}
