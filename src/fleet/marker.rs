use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

/// Freshness epoch for asynchronous probe results.
///
/// The deploy pipeline bumps the marker when a deployment begins. Probes are
/// tagged with the value current at issue time, and the status monitor only
/// accepts results whose tag still equals the live value. Clones share the
/// same counter.
#[derive(Debug, Clone, Default)]
pub struct DeployMarker(Arc<AtomicI64>);

impl DeployMarker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, marker: i64) -> bool {
        self.value() == marker
    }

    /// Starts a new deploy epoch and returns its value.
    pub fn bump(&self) -> i64 {
        let next = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("Deploy marker advanced to {next}");
        next
    }
}
