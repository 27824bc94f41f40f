//! Hand-off of accepted conntrack records to the processing pipeline
//!
//! The gateway is fire-and-forget. A rejected message is discarded by the
//! gateway and its record released; nothing is retried.

use crate::error::{CtsyncError, Result};
use crate::types::{AddressFamily, ConntrackRecord, EventKind};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Event type posted to the processing threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    /// IPv4 conntrack message
    Conntrack,
    /// IPv6 conntrack message, only produced in extended mode
    ConntrackV6,
}

/// A record wrapped for the processing pipeline
#[derive(Debug)]
pub struct DispatchMessage {
    pub event: DispatchEvent,
    pub kind: EventKind,
    pub record: ConntrackRecord,
}

impl DispatchMessage {
    /// Wrap a record, taking ownership of it
    pub fn new(record: ConntrackRecord) -> Self {
        let event = match record.family {
            AddressFamily::Ipv4 => DispatchEvent::Conntrack,
            AddressFamily::Ipv6 => DispatchEvent::ConntrackV6,
        };
        Self {
            event,
            kind: record.kind,
            record,
        }
    }
}

/// Bounded queue toward the processing pipeline
pub trait DispatchGateway: Send + Sync {
    /// Post a message without blocking.
    ///
    /// On error the message has already been dropped.
    fn post(&self, message: DispatchMessage) -> Result<()>;
}

/// Gateway over a bounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelGateway {
    tx: mpsc::Sender<DispatchMessage>,
}

impl ChannelGateway {
    /// Create a gateway and the receiver the pipeline reads from
    pub fn bounded(depth: usize) -> (Self, mpsc::Receiver<DispatchMessage>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }
}

impl DispatchGateway for ChannelGateway {
    fn post(&self, message: DispatchMessage) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => CtsyncError::Dispatch("queue full".to_string()),
            TrySendError::Closed(_) => CtsyncError::Dispatch("queue closed".to_string()),
        })
    }
}
