//! Per-protocol conntrack capture sessions
//!
//! A [`CaptureSession`] owns one subscription to the tracking subsystem and
//! runs a blocking receive loop on its own thread. TCP and UDP sessions
//! share no receive path. Within a session records reach the gateway in
//! kernel order.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Continuous flow event capture
//! - AU-12: Audit Record Generation - Session lifecycle logging
//! - SC-5: DoS Protection - Backpressure drops instead of blocking capture

use crate::conntrack::{ConntrackBackend, SubscriptionMask};
use crate::dispatch::{DispatchGateway, DispatchMessage};
use crate::error::{CtsyncError, Result};
use crate::filter_update::{ProtocolFilter, WanState};
use crate::types::{AddressFamily, ConntrackRecord, L4Protocol, SessionState};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace};

/// Static forwarding policy of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePolicy {
    /// Forward IPv6 flows tagged as IPv6 instead of releasing them
    pub forward_ipv6: bool,
    /// Release every record while the WAN link is down
    pub require_wan_up: bool,
    /// Subscribe TCP sessions to flow creation as well
    pub subscribe_tcp_new: bool,
}

impl CapturePolicy {
    /// IPv4 only, gated on WAN state
    pub const fn standard() -> Self {
        Self {
            forward_ipv6: false,
            require_wan_up: true,
            subscribe_tcp_new: false,
        }
    }

    /// IPv4 and IPv6, no WAN gate, TCP creation events included
    pub const fn extended() -> Self {
        Self {
            forward_ipv6: true,
            require_wan_up: false,
            subscribe_tcp_new: true,
        }
    }

    pub const fn from_extended(extended: bool) -> Self {
        if extended {
            Self::extended()
        } else {
            Self::standard()
        }
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Counters for one capture run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub received: u64,
    pub forwarded: u64,
    pub dropped_family: u64,
    pub dropped_wan_down: u64,
    pub dropped_dispatch: u64,
}

/// One long-lived subscription for one protocol
pub struct CaptureSession {
    protocol: L4Protocol,
    backend: Arc<dyn ConntrackBackend>,
    filter: Arc<ProtocolFilter>,
    policy: CapturePolicy,
    wan: WanState,
    stats: CaptureStats,
}

impl CaptureSession {
    pub fn new(
        backend: Arc<dyn ConntrackBackend>,
        filter: Arc<ProtocolFilter>,
        policy: CapturePolicy,
        wan: WanState,
    ) -> Self {
        Self {
            protocol: filter.protocol(),
            backend,
            filter,
            policy,
            wan,
            stats: CaptureStats::default(),
        }
    }

    pub fn protocol(&self) -> L4Protocol {
        self.protocol
    }

    pub fn state(&self) -> SessionState {
        self.filter.state()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Subscription used when opening this session
    pub fn subscriptions(&self) -> SubscriptionMask {
        SubscriptionMask::for_protocol(self.protocol, self.policy.subscribe_tcp_new)
    }

    /// Open a handle on the tracking subsystem
    ///
    /// # NIST Controls
    /// - AC-3: Access Enforcement - Kernel subscription requires CAP_NET_ADMIN
    #[instrument(skip(self), fields(protocol = %self.protocol), err)]
    pub fn open(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Uninitialized | SessionState::Closed => {}
            state => {
                return Err(CtsyncError::InvalidState(format!(
                    "cannot open {} session in state {:?}",
                    self.protocol, state
                )));
            }
        }

        let handle = self.backend.open(self.protocol, self.subscriptions())?;
        self.filter.install(handle);
        self.stats = CaptureStats::default();
        info!(protocol = %self.protocol, "Opened capture session");
        Ok(())
    }

    /// Bind the current rule set to the open handle.
    ///
    /// Repeating the call replaces the attached rules.
    pub fn attach_filter(&mut self) -> Result<()> {
        self.filter.attach_current()?;
        debug!(protocol = %self.protocol, "Filter attached");
        Ok(())
    }

    /// Receive and forward records until cancelled or the handle fails.
    ///
    /// Cancellation closes the session and returns the run's counters. A
    /// receive failure leaves the session `Closing` and is returned as a
    /// capture error; [`close`](Self::close) finishes the teardown.
    pub fn run(
        &mut self,
        gateway: &dyn DispatchGateway,
        cancel: &CancellationToken,
    ) -> Result<CaptureStats> {
        let state = self.state();
        if !state.is_attached() {
            return Err(CtsyncError::InvalidState(format!(
                "cannot run {} session in state {:?}",
                self.protocol, state
            )));
        }
        let handle = self.filter.handle().ok_or_else(|| {
            CtsyncError::InvalidState(format!("{} session has no handle", self.protocol))
        })?;

        self.filter.set_state(SessionState::Capturing);
        info!(protocol = %self.protocol, "Waiting for conntrack events");

        while !cancel.is_cancelled() {
            let batch = match handle.receive() {
                Ok(batch) => batch,
                Err(e) => {
                    error!(protocol = %self.protocol, error = %e, "Capture terminated");
                    self.filter.set_state(SessionState::Closing);
                    return Err(match e {
                        e @ CtsyncError::Capture { .. } => e,
                        other => CtsyncError::Capture {
                            protocol: self.protocol,
                            reason: other.to_string(),
                        },
                    });
                }
            };

            for record in batch {
                self.forward(record, gateway);
            }
        }

        info!(
            protocol = %self.protocol,
            received = self.stats.received,
            forwarded = self.stats.forwarded,
            dropped_family = self.stats.dropped_family,
            dropped_wan_down = self.stats.dropped_wan_down,
            dropped_dispatch = self.stats.dropped_dispatch,
            "Capture cancelled"
        );
        self.close();
        Ok(self.stats)
    }

    /// Forward one record, releasing it on every path that does not hand
    /// it to the gateway
    fn forward(&mut self, record: ConntrackRecord, gateway: &dyn DispatchGateway) {
        self.stats.received += 1;

        if record.family == AddressFamily::Ipv6 && !self.policy.forward_ipv6 {
            trace!(protocol = %self.protocol, flow = %record.original, "Ignoring IPv6 connection");
            self.stats.dropped_family += 1;
            return;
        }

        if self.policy.require_wan_up && !self.wan.is_up() {
            trace!(protocol = %self.protocol, flow = %record.original, "WAN is not up, ignoring connection");
            self.stats.dropped_wan_down += 1;
            return;
        }

        trace!(
            protocol = %self.protocol,
            kind = ?record.kind,
            flow = %record.original,
            "Dispatching conntrack event"
        );
        match gateway.post(DispatchMessage::new(record)) {
            Ok(()) => self.stats.forwarded += 1,
            Err(e) => {
                debug!(protocol = %self.protocol, error = %e, "Dropped conntrack event");
                self.stats.dropped_dispatch += 1;
            }
        }
    }

    /// Release the handle and its filter. Safe to call in any state.
    pub fn close(&mut self) {
        if self.state() == SessionState::Closed {
            return;
        }
        if let Some(handle) = self.filter.take_handle() {
            handle.close();
        }
        self.filter.set_state(SessionState::Closed);
        debug!(protocol = %self.protocol, "Capture session closed");
    }

    fn open_and_run(
        &mut self,
        gateway: &dyn DispatchGateway,
        cancel: &CancellationToken,
    ) -> Result<CaptureStats> {
        self.open()?;
        self.attach_filter()?;
        self.run(gateway, cancel)
    }

    /// Open, attach and run the session on a dedicated thread.
    ///
    /// A session that stops on an error cancels `cancel`, so the rest of
    /// the daemon winds down with it.
    pub fn spawn(
        mut self,
        gateway: Arc<dyn DispatchGateway>,
        cancel: CancellationToken,
    ) -> std::io::Result<JoinHandle<Result<CaptureStats>>> {
        let name = format!("ctsyncd-{}", self.protocol.to_string().to_lowercase());
        std::thread::Builder::new().name(name).spawn(move || {
            let result = self.open_and_run(gateway.as_ref(), &cancel);
            self.close();
            if let Err(e) = &result {
                error!(protocol = %self.protocol, error = %e, "Capture session stopped");
                cancel.cancel();
            }
            result
        })
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}
