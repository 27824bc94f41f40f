//! Core types for connection tracking synchronization
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Flow state tracking for offload decisions
//! - AU-3: Content of Audit Records - Flow tuples included in event logs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// IANA protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;
/// IANA protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// Transport protocol of a tracked flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L4Protocol {
    Tcp,
    Udp,
}

impl L4Protocol {
    /// Parse from an IP protocol number
    pub fn from_number(proto: u8) -> Option<Self> {
        match proto {
            IPPROTO_TCP => Some(L4Protocol::Tcp),
            IPPROTO_UDP => Some(L4Protocol::Udp),
            _ => None,
        }
    }

    /// IP protocol number
    pub fn number(self) -> u8 {
        match self {
            L4Protocol::Tcp => IPPROTO_TCP,
            L4Protocol::Udp => IPPROTO_UDP,
        }
    }
}

impl fmt::Display for L4Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L4Protocol::Tcp => write!(f, "TCP"),
            L4Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Layer 3 address family of a tracked flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Parse from a kernel AF_* value
    pub fn from_kernel(family: u8) -> Option<Self> {
        match i32::from(family) {
            libc::AF_INET => Some(AddressFamily::Ipv4),
            libc::AF_INET6 => Some(AddressFamily::Ipv6),
            _ => None,
        }
    }
}

/// Kernel TCP conntrack state (TCP_CONNTRACK_* values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TcpState {
    None,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Close,
    SynSent2,
}

impl TcpState {
    /// Parse from the kernel state value, `None` for unknown values
    pub fn from_kernel(state: u8) -> Option<Self> {
        let state = match state {
            0 => TcpState::None,
            1 => TcpState::SynSent,
            2 => TcpState::SynRecv,
            3 => TcpState::Established,
            4 => TcpState::FinWait,
            5 => TcpState::CloseWait,
            6 => TcpState::LastAck,
            7 => TcpState::TimeWait,
            8 => TcpState::Close,
            9 => TcpState::SynSent2,
            _ => return None,
        };
        Some(state)
    }

    /// Kernel state value
    pub fn number(self) -> u8 {
        match self {
            TcpState::None => 0,
            TcpState::SynSent => 1,
            TcpState::SynRecv => 2,
            TcpState::Established => 3,
            TcpState::FinWait => 4,
            TcpState::CloseWait => 5,
            TcpState::LastAck => 6,
            TcpState::TimeWait => 7,
            TcpState::Close => 8,
            TcpState::SynSent2 => 9,
        }
    }
}

/// Kind of connection tracking event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    New,
    Update,
    Destroy,
}

/// One direction of a tracked flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

/// A single connection tracking event with its attributes
///
/// Each record has exactly one owner at a time. Moving it into a
/// [`DispatchMessage`](crate::dispatch::DispatchMessage) hands it to the
/// downstream consumer; dropping it releases it.
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Full flow information for logging
#[derive(Debug, PartialEq, Eq)]
pub struct ConntrackRecord {
    pub kind: EventKind,
    pub family: AddressFamily,
    pub protocol: L4Protocol,
    /// Original direction tuple
    pub original: FlowTuple,
    /// Reply direction tuple, when the kernel reported one
    pub reply: Option<FlowTuple>,
    /// TCP conntrack state, only present for TCP flows
    pub tcp_state: Option<TcpState>,
    /// Kernel IPS_* status bits
    pub status: u32,
}

impl ConntrackRecord {
    /// Create an IPv4 record with no reply tuple or state
    pub fn ipv4(
        kind: EventKind,
        protocol: L4Protocol,
        src: (Ipv4Addr, u16),
        dst: (Ipv4Addr, u16),
    ) -> Self {
        Self {
            kind,
            family: AddressFamily::Ipv4,
            protocol,
            original: FlowTuple {
                src: IpAddr::V4(src.0),
                dst: IpAddr::V4(dst.0),
                src_port: src.1,
                dst_port: dst.1,
            },
            reply: None,
            tcp_state: None,
            status: 0,
        }
    }

    /// Set the TCP state
    pub fn with_tcp_state(mut self, state: TcpState) -> Self {
        self.tcp_state = Some(state);
        self
    }

    /// Original direction source address when it is IPv4
    pub fn src_ipv4(&self) -> Option<Ipv4Addr> {
        match self.original.src {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        }
    }

    /// Original direction destination address when it is IPv4
    pub fn dst_ipv4(&self) -> Option<Ipv4Addr> {
        match self.original.dst {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        }
    }
}

/// Addressing of an interface that transitioned to up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceUpInfo {
    pub ifname: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl InterfaceUpInfo {
    pub fn new(ifname: impl Into<String>, address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            ifname: ifname.into(),
            address,
            netmask,
        }
    }
}

/// Idle timeout pushed to the NAT store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutValue {
    pub protocol: L4Protocol,
    pub seconds: u32,
}

/// Lifecycle of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    FilterReady,
    Attached,
    Capturing,
    Closing,
    Closed,
}

impl SessionState {
    /// A handle is open and carries a filter at the kernel boundary
    pub fn is_attached(self) -> bool {
        matches!(self, SessionState::Attached | SessionState::Capturing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(L4Protocol::from_number(6), Some(L4Protocol::Tcp));
        assert_eq!(L4Protocol::from_number(17), Some(L4Protocol::Udp));
        assert_eq!(L4Protocol::from_number(1), None);
        assert_eq!(L4Protocol::Udp.number(), 17);
    }

    #[test]
    fn test_tcp_state_from_kernel() {
        assert_eq!(TcpState::from_kernel(3), Some(TcpState::Established));
        assert_eq!(TcpState::from_kernel(4), Some(TcpState::FinWait));
        assert_eq!(TcpState::from_kernel(8), Some(TcpState::Close));
        assert_eq!(TcpState::from_kernel(42), None);
        for value in 0..=9 {
            assert_eq!(TcpState::from_kernel(value).map(TcpState::number), Some(value));
        }
    }

    #[test]
    fn test_address_family_from_kernel() {
        assert_eq!(
            AddressFamily::from_kernel(libc::AF_INET as u8),
            Some(AddressFamily::Ipv4)
        );
        assert_eq!(
            AddressFamily::from_kernel(libc::AF_INET6 as u8),
            Some(AddressFamily::Ipv6)
        );
        assert_eq!(AddressFamily::from_kernel(0), None);
    }

    #[test]
    fn test_session_state_attached() {
        assert!(SessionState::Attached.is_attached());
        assert!(SessionState::Capturing.is_attached());
        assert!(!SessionState::FilterReady.is_attached());
        assert!(!SessionState::Closed.is_attached());
    }

    #[test]
    fn test_flow_tuple_display() {
        let record = ConntrackRecord::ipv4(
            EventKind::New,
            L4Protocol::Tcp,
            (Ipv4Addr::new(192, 168, 1, 10), 40000),
            (Ipv4Addr::new(8, 8, 8, 8), 443),
        );
        assert_eq!(
            record.original.to_string(),
            "192.168.1.10:40000 -> 8.8.8.8:443"
        );
        assert_eq!(record.src_ipv4(), Some(Ipv4Addr::new(192, 168, 1, 10)));
    }
}
