//! Periodic hub cleanup and staleness sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use overwatch_core::ids::SessionId;

use crate::gateway::Gateway;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions whose last connection was dropped by cleanup.
    pub emptied: Vec<SessionId>,
    /// Sessions moved to idle for inactivity.
    pub stale: Vec<SessionId>,
}

/// One maintenance pass: drop closed connections, then idle stale sessions.
pub fn run_once(gateway: &Gateway, now: DateTime<Utc>) -> SweepReport {
    let emptied = gateway.hubs().cleanup_all();
    for session_id in &emptied {
        gateway.session_emptied(session_id);
    }

    let stale = match gateway.lifecycle().sweep(now) {
        Ok(moved) => moved,
        Err(e) => {
            warn!(error = %e, "staleness sweep failed");
            Vec::new()
        }
    };
    SweepReport { emptied, stale }
}

/// Run [`run_once`] every `interval` until `cancel` fires.
pub fn spawn(gateway: Arc<Gateway>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = run_once(&gateway, Utc::now());
                    debug!(emptied = report.emptied.len(), stale = report.stale.len(), "maintenance pass");
                }
            }
        }
        debug!("maintenance task stopped");
    })
}
