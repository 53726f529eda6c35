pub mod collector;
pub mod dyno;
pub mod listener;
pub mod marker;
pub mod monitor;
pub mod reaper;
pub mod status;

pub use collector::NodeStatusCollector;
pub use marker::DeployMarker;
pub use monitor::{FleetStatus, MonitorDeps, StatusMonitor};
pub use status::NodeStatus;
