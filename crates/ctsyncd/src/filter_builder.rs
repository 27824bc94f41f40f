//! Construction of conntrack exclusion and baseline rules
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Self traffic and broadcast excluded at the kernel
//! - CM-8: System Component Inventory - Local interface address resolution

use crate::error::{CtsyncError, Result};
use crate::filter::{FilterRule, FilterRuleSet, Selector, broadcast_address};
use crate::types::{InterfaceUpInfo, L4Protocol, TcpState};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

/// Default name of the LAN bridge interface
pub const DEFAULT_BRIDGE_INTERFACE: &str = "bridge0";

/// Lookup of an interface's IPv4 addressing
pub trait AddressResolver: Send + Sync {
    /// Current IPv4 address and netmask of `ifname`
    fn resolve(&self, ifname: &str) -> Result<InterfaceUpInfo>;
}

/// Resolver backed by the kernel's interface address list
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[cfg(target_os = "linux")]
impl AddressResolver for SystemResolver {
    fn resolve(&self, ifname: &str) -> Result<InterfaceUpInfo> {
        let addrs = nix::ifaddrs::getifaddrs().map_err(|e| CtsyncError::Resolution {
            interface: ifname.to_string(),
            reason: format!("getifaddrs failed: {}", e),
        })?;

        for ifaddr in addrs.filter(|a| a.interface_name == ifname) {
            let Some(address) = ifaddr
                .address
                .as_ref()
                .and_then(|a| a.as_sockaddr_in())
                .map(|sin| Ipv4Addr::from(sin.ip()))
            else {
                continue;
            };

            let netmask = ifaddr
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|sin| Ipv4Addr::from(sin.ip()))
                .unwrap_or(Ipv4Addr::BROADCAST);

            debug!(interface = ifname, %address, %netmask, "Resolved interface address");
            return Ok(InterfaceUpInfo::new(ifname, address, netmask));
        }

        Err(CtsyncError::Resolution {
            interface: ifname.to_string(),
            reason: "interface absent or has no IPv4 address".to_string(),
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl AddressResolver for SystemResolver {
    fn resolve(&self, ifname: &str) -> Result<InterfaceUpInfo> {
        Err(CtsyncError::Resolution {
            interface: ifname.to_string(),
            reason: "interface lookup unsupported on this platform".to_string(),
        })
    }
}

/// Builds the rules that keep irrelevant flows out of user space
///
/// Each operation appends to the given rule set. A failure aborts only the
/// rule addition it was raised from; callers decide whether a degraded
/// filter is acceptable.
pub struct FilterBuilder {
    resolver: Arc<dyn AddressResolver>,
    bridge_interface: String,
}

impl FilterBuilder {
    pub fn new(resolver: Arc<dyn AddressResolver>, bridge_interface: impl Into<String>) -> Self {
        Self {
            resolver,
            bridge_interface: bridge_interface.into(),
        }
    }

    pub fn bridge_interface(&self) -> &str {
        &self.bridge_interface
    }

    /// Exclude flows to and from the bridge address.
    ///
    /// The address is resolved on every call, so callers apply this once
    /// per process lifetime.
    pub fn exclude_bridge_traffic(&self, rules: &mut FilterRuleSet) -> Result<()> {
        let bridge = self.resolver.resolve(&self.bridge_interface)?;

        rules.push(FilterRule::exclude_dst(bridge.address))?;
        rules.push(FilterRule::exclude_src(bridge.address))?;

        info!(
            protocol = %rules.protocol(),
            interface = %self.bridge_interface,
            address = %bridge.address,
            "Excluding bridge traffic"
        );
        Ok(())
    }

    /// Exclude flows to and from an interface plus its subnet broadcast
    pub fn exclude_local_interface(
        &self,
        rules: &mut FilterRuleSet,
        iface: &InterfaceUpInfo,
    ) -> Result<()> {
        rules.push(FilterRule::exclude_dst(iface.address))?;
        rules.push(FilterRule::exclude_src(iface.address))?;

        let broadcast = broadcast_address(iface.address, iface.netmask);
        rules.push(FilterRule::exclude_dst(broadcast))?;

        info!(
            protocol = %rules.protocol(),
            interface = %iface.ifname,
            address = %iface.address,
            %broadcast,
            "Excluding local interface traffic"
        );
        Ok(())
    }

    /// Exclude the limited broadcast address as source and destination.
    ///
    /// Applied at most once per rule set; later calls leave it untouched.
    pub fn exclude_global_broadcast(&self, rules: &mut FilterRuleSet) -> Result<()> {
        if rules.global_broadcast_excluded() {
            debug!(protocol = %rules.protocol(), "Global broadcast already excluded");
            return Ok(());
        }

        rules.push(FilterRule::exclude_dst(Ipv4Addr::BROADCAST))?;
        rules.push(FilterRule::exclude_src(Ipv4Addr::BROADCAST))?;
        rules.latch_global_broadcast();

        info!(protocol = %rules.protocol(), "Excluding global broadcast traffic");
        Ok(())
    }

    /// Select TCP flows in the ESTABLISHED or FIN_WAIT state
    pub fn init_tcp_baseline(&self, rules: &mut FilterRuleSet) -> Result<()> {
        rules.push(FilterRule::positive(Selector::L4Proto(L4Protocol::Tcp)))?;
        for state in [TcpState::Established, TcpState::FinWait] {
            rules.push(FilterRule::positive(Selector::L4ProtoState {
                protocol: L4Protocol::Tcp,
                state,
            }))?;
        }
        debug!("Initialized TCP baseline filter");
        Ok(())
    }

    /// Select UDP flows regardless of state
    pub fn init_udp_baseline(&self, rules: &mut FilterRuleSet) -> Result<()> {
        rules.push(FilterRule::positive(Selector::L4Proto(L4Protocol::Udp)))?;
        debug!("Initialized UDP baseline filter");
        Ok(())
    }

    /// Baseline for either protocol
    pub fn init_baseline(&self, rules: &mut FilterRuleSet) -> Result<()> {
        match rules.protocol() {
            L4Protocol::Tcp => self.init_tcp_baseline(rules),
            L4Protocol::Udp => self.init_udp_baseline(rules),
        }
    }
}

/// Resolver that answers from a fixed table, for tests and static setups
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: Vec<InterfaceUpInfo>,
}

impl StaticResolver {
    pub fn new(entries: Vec<InterfaceUpInfo>) -> Self {
        Self { entries }
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, ifname: &str) -> Result<InterfaceUpInfo> {
        self.entries
            .iter()
            .find(|e| e.ifname == ifname)
            .cloned()
            .ok_or_else(|| CtsyncError::Resolution {
                interface: ifname.to_string(),
                reason: "interface absent".to_string(),
            })
    }
}
