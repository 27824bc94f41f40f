//! Periodic refresh of offloaded UDP flow timestamps
//!
//! Offloaded UDP flows bypass the kernel, so their conntrack entries would
//! age out while traffic is still flowing. The NAT store refreshes them on
//! a fixed interval.

use crate::nat::NatTimeoutStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default refresh period in seconds
pub const DEFAULT_UDP_REFRESH_INTERVAL_SECS: u64 = 20;

/// Refresh UDP timestamps every `period` until cancelled.
///
/// Returns the number of refreshes performed.
pub async fn run_udp_timestamp_refresh(
    store: Arc<dyn NatTimeoutStore>,
    period: Duration,
    cancel: CancellationToken,
) -> u64 {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    info!(period_secs = period.as_secs(), "Starting UDP timestamp refresh");
    let mut refreshes = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(refreshes, "UDP timestamp refresh cancelled");
                return refreshes;
            }
            _ = ticker.tick() => {
                store.refresh_udp_timestamps();
                refreshes += 1;
            }
        }
    }
}
