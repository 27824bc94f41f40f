//! Live filter reconfiguration on interface state changes
//!
//! [`FilterCoordinator`] owns both protocol rule sets and the one-time
//! bridge/broadcast exclusion latch. The latch is shared by TCP and UDP:
//! the first non-WAN interface-up event applies the exclusions to both rule
//! sets together.
//!
//! Re-attaching a filter takes effect at the kernel boundary
//! asynchronously with respect to the capture loop, so a record already in
//! flight may still be delivered under the previous filter.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Boundary rules follow interface changes
//! - CM-3: Configuration Change Control - Serialized rule set mutation

use crate::conntrack::ConntrackHandle;
use crate::error::{CtsyncError, Result};
use crate::filter::FilterRuleSet;
use crate::filter_builder::FilterBuilder;
use crate::types::{InterfaceUpInfo, L4Protocol, SessionState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument, warn};

struct SessionSlot {
    state: SessionState,
    handle: Option<Arc<dyn ConntrackHandle>>,
}

/// Rule set of one protocol together with the session that carries it
///
/// Lock order is rules before slot.
pub struct ProtocolFilter {
    protocol: L4Protocol,
    rules: Mutex<FilterRuleSet>,
    slot: Mutex<SessionSlot>,
}

impl ProtocolFilter {
    fn new(rules: FilterRuleSet) -> Self {
        Self {
            protocol: rules.protocol(),
            rules: Mutex::new(rules),
            slot: Mutex::new(SessionSlot {
                state: SessionState::Uninitialized,
                handle: None,
            }),
        }
    }

    pub fn protocol(&self) -> L4Protocol {
        self.protocol
    }

    /// Copy of the current rule set
    pub fn snapshot(&self) -> FilterRuleSet {
        self.rules.lock().clone()
    }

    /// State of the session bound to this rule set
    pub fn state(&self) -> SessionState {
        self.slot.lock().state
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.slot.lock().state = state;
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn ConntrackHandle>> {
        self.slot.lock().handle.clone()
    }

    /// Record a freshly opened handle
    pub(crate) fn install(&self, handle: Arc<dyn ConntrackHandle>) {
        let mut slot = self.slot.lock();
        slot.handle = Some(handle);
        slot.state = SessionState::FilterReady;
    }

    /// Detach the handle, leaving the slot in `Closing`
    pub(crate) fn take_handle(&self) -> Option<Arc<dyn ConntrackHandle>> {
        let mut slot = self.slot.lock();
        slot.state = SessionState::Closing;
        slot.handle.take()
    }

    /// Bind the current rules to the open handle.
    ///
    /// Rules and slot stay locked across the attach so a concurrent update
    /// cannot slip in between the attach and the state change.
    pub(crate) fn attach_current(&self) -> Result<()> {
        let rules = self.rules.lock();
        let mut slot = self.slot.lock();

        let handle = slot.handle.clone().ok_or_else(|| {
            CtsyncError::InvalidState(format!("{} session is not open", self.protocol))
        })?;
        handle.attach_filter(&rules)?;

        if slot.state == SessionState::FilterReady {
            slot.state = SessionState::Attached;
        }
        Ok(())
    }

    fn reattach(&self, rules: &FilterRuleSet) -> Result<()> {
        let slot = self.slot.lock();
        match (&slot.handle, slot.state.is_attached()) {
            (Some(handle), true) => {
                debug!(protocol = %self.protocol, "Re-attaching filter to live session");
                handle.attach_filter(rules)
            }
            _ => {
                debug!(
                    protocol = %self.protocol,
                    state = ?slot.state,
                    "Session not attached, rules applied at next attach"
                );
                Ok(())
            }
        }
    }
}

/// Whether the WAN link is up, shared with the capture sessions
#[derive(Debug, Clone, Default)]
pub struct WanState(Arc<AtomicBool>);

impl WanState {
    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, up: bool) {
        self.0.store(up, Ordering::Release);
    }
}

/// Coordinates both protocol rule sets across interface events
pub struct FilterCoordinator {
    builder: FilterBuilder,
    tcp: Arc<ProtocolFilter>,
    udp: Arc<ProtocolFilter>,
    /// Bridge and global broadcast exclusions applied to both rule sets
    global_exclusions: Mutex<bool>,
    wan: WanState,
}

impl FilterCoordinator {
    /// Create both rule sets with their protocol baselines.
    ///
    /// A baseline that cannot be configured is fatal to session startup.
    pub fn new(builder: FilterBuilder) -> Result<Self> {
        let mut tcp = FilterRuleSet::new(L4Protocol::Tcp);
        builder.init_tcp_baseline(&mut tcp)?;
        let mut udp = FilterRuleSet::new(L4Protocol::Udp);
        builder.init_udp_baseline(&mut udp)?;

        Ok(Self {
            builder,
            tcp: Arc::new(ProtocolFilter::new(tcp)),
            udp: Arc::new(ProtocolFilter::new(udp)),
            global_exclusions: Mutex::new(false),
            wan: WanState::default(),
        })
    }

    pub fn filter(&self, protocol: L4Protocol) -> Arc<ProtocolFilter> {
        match protocol {
            L4Protocol::Tcp => Arc::clone(&self.tcp),
            L4Protocol::Udp => Arc::clone(&self.udp),
        }
    }

    pub fn wan_state(&self) -> WanState {
        self.wan.clone()
    }

    /// Whether the one-time bridge/broadcast exclusions have been applied
    pub fn global_exclusions_applied(&self) -> bool {
        *self.global_exclusions.lock()
    }

    /// Update one protocol's rules for an interface that came up.
    ///
    /// WAN interfaces add no rules. Other interfaces get their address and
    /// subnet broadcast excluded and, the first time, the bridge and global
    /// broadcast exclusions land in both rule sets. Live sessions have the
    /// new rules re-attached.
    #[instrument(skip(self, iface), fields(interface = %iface.ifname))]
    pub fn update_filters(
        &self,
        protocol: L4Protocol,
        iface: &InterfaceUpInfo,
        is_wan: bool,
    ) -> Result<()> {
        let mut latch = self.global_exclusions.lock();
        let mut tcp_rules = self.tcp.rules.lock();
        let mut udp_rules = self.udp.rules.lock();

        if is_wan {
            debug!(%protocol, "WAN interface, no exclusions added");
        } else {
            let target = match protocol {
                L4Protocol::Tcp => &mut *tcp_rules,
                L4Protocol::Udp => &mut *udp_rules,
            };
            self.builder.exclude_local_interface(target, iface)?;
        }

        let mut both_changed = false;
        if !is_wan && !*latch {
            match self.builder.exclude_bridge_traffic(&mut tcp_rules) {
                Ok(()) => {
                    if let Err(e) = self.builder.exclude_bridge_traffic(&mut udp_rules) {
                        warn!(error = %e, "UDP bridge exclusion failed, continuing with degraded filter");
                    }
                    *latch = true;
                }
                Err(e) => {
                    warn!(error = %e, "Bridge exclusion deferred to next interface event");
                }
            }
            self.builder.exclude_global_broadcast(&mut tcp_rules)?;
            self.builder.exclude_global_broadcast(&mut udp_rules)?;
            both_changed = true;
        }

        let (target, target_rules, other, other_rules) = match protocol {
            L4Protocol::Tcp => (&self.tcp, &*tcp_rules, &self.udp, &*udp_rules),
            L4Protocol::Udp => (&self.udp, &*udp_rules, &self.tcp, &*tcp_rules),
        };

        let target_result = target.reattach(target_rules);
        let other_result = if both_changed {
            other.reattach(other_rules)
        } else {
            Ok(())
        };

        if let Err(e) = &target_result {
            warn!(%protocol, error = %e, "Failed to re-attach filter");
        }
        if let Err(e) = &other_result {
            warn!(protocol = %other.protocol(), error = %e, "Failed to re-attach filter");
        }
        target_result.and(other_result)
    }

    /// Apply an interface-up notification to both protocols
    pub fn on_interface_up(&self, iface: &InterfaceUpInfo, is_wan: bool) -> Result<()> {
        info!(
            interface = %iface.ifname,
            address = %iface.address,
            is_wan,
            "Interface up"
        );
        let tcp = self.update_filters(L4Protocol::Tcp, iface, is_wan);
        let udp = self.update_filters(L4Protocol::Udp, iface, is_wan);
        tcp.and(udp)
    }

    /// Record a WAN link transition
    pub fn on_wan_state_change(&self, up: bool) {
        if self.wan.is_up() != up {
            info!(up, "WAN state changed");
        }
        self.wan.set(up);
    }
}
