//! NAT timeout store
//!
//! The NAT application owns the timeout state. ctsyncd only pushes values
//! into it and never reads them back.

use crate::types::{L4Protocol, TimeoutValue};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Sink for idle timeout values and UDP activity refreshes
#[cfg_attr(test, mockall::automock)]
pub trait NatTimeoutStore: Send + Sync {
    /// Set the idle timeout for a protocol
    fn set_timeout(&self, value: TimeoutValue);

    /// Refresh last-activity timestamps of offloaded UDP flows
    fn refresh_udp_timestamps(&self) {}
}

/// In-process timeout table
#[derive(Debug, Default)]
pub struct NatTimeouts {
    timeouts: RwLock<HashMap<L4Protocol, u32>>,
    udp_refreshes: AtomicU64,
}

impl NatTimeouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value pushed for a protocol
    pub fn timeout(&self, protocol: L4Protocol) -> Option<u32> {
        self.timeouts.read().get(&protocol).copied()
    }

    /// Number of UDP timestamp refreshes performed
    pub fn udp_refreshes(&self) -> u64 {
        self.udp_refreshes.load(Ordering::Relaxed)
    }
}

impl NatTimeoutStore for NatTimeouts {
    fn set_timeout(&self, value: TimeoutValue) {
        let previous = self.timeouts.write().insert(value.protocol, value.seconds);
        info!(
            protocol = %value.protocol,
            seconds = value.seconds,
            previous = ?previous,
            "Updated NAT idle timeout"
        );
    }

    fn refresh_udp_timestamps(&self) {
        let count = self.udp_refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(count, "Refreshed UDP connection timestamps");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nat_timeouts_last_value_wins() {
        let store = NatTimeouts::new();
        assert_eq!(store.timeout(L4Protocol::Tcp), None);

        store.set_timeout(TimeoutValue {
            protocol: L4Protocol::Tcp,
            seconds: 120,
        });
        store.set_timeout(TimeoutValue {
            protocol: L4Protocol::Tcp,
            seconds: 300,
        });
        store.set_timeout(TimeoutValue {
            protocol: L4Protocol::Udp,
            seconds: 60,
        });

        assert_eq!(store.timeout(L4Protocol::Tcp), Some(300));
        assert_eq!(store.timeout(L4Protocol::Udp), Some(60));
    }

    #[test]
    fn test_udp_refresh_counter() {
        let store = NatTimeouts::new();
        store.refresh_udp_timestamps();
        store.refresh_udp_timestamps();
        assert_eq!(store.udp_refreshes(), 2);
    }
}
