//! Connection tracking subsystem access
//!
//! [`ConntrackBackend`] opens per-protocol subscriptions and
//! [`ConntrackHandle`] is one open subscription. On Linux the backend is a
//! `NETLINK_NETFILTER` socket bound to the ctnetlink multicast groups, with
//! each rule set compiled by [`crate::bpf`] and attached as a socket filter.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Kernel interface for flow state
//! - SI-4: System Monitoring - Monitor connection tracking changes
//! - AC-3: Access Enforcement - Subscription requires CAP_NET_ADMIN

use crate::error::Result;
use crate::filter::FilterRuleSet;
use crate::types::{
    AddressFamily, ConntrackRecord, EventKind, FlowTuple, L4Protocol, TcpState,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::BitOr;
use std::sync::Arc;
use tracing::trace;

/// Multicast groups a handle listens on (NF_NETLINK_CONNTRACK_* bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionMask(u32);

impl SubscriptionMask {
    pub const NEW: Self = Self(0x0000_0001);
    pub const UPDATE: Self = Self(0x0000_0002);
    pub const DESTROY: Self = Self(0x0000_0004);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Default subscription for a protocol.
    ///
    /// TCP listens for updates and teardown (plus creation in extended
    /// mode); UDP listens for creation and teardown.
    pub fn for_protocol(protocol: L4Protocol, extended: bool) -> Self {
        match protocol {
            L4Protocol::Tcp if extended => Self::NEW | Self::UPDATE | Self::DESTROY,
            L4Protocol::Tcp => Self::UPDATE | Self::DESTROY,
            L4Protocol::Udp => Self::NEW | Self::DESTROY,
        }
    }

    pub fn contains(self, kind: EventKind) -> bool {
        let bit = match kind {
            EventKind::New => Self::NEW,
            EventKind::Update => Self::UPDATE,
            EventKind::Destroy => Self::DESTROY,
        };
        self.0 & bit.0 != 0
    }
}

impl BitOr for SubscriptionMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Opens subscriptions to the connection tracking subsystem
pub trait ConntrackBackend: Send + Sync {
    fn open(
        &self,
        protocol: L4Protocol,
        subscriptions: SubscriptionMask,
    ) -> Result<Arc<dyn ConntrackHandle>>;
}

/// One open subscription
///
/// Handles are shared between the capture thread, which blocks in
/// [`receive`](ConntrackHandle::receive), and whichever thread re-attaches
/// filters, so every method takes `&self`.
pub trait ConntrackHandle: Send + Sync {
    /// Replace the rule set evaluated at the kernel boundary
    fn attach_filter(&self, rules: &FilterRuleSet) -> Result<()>;

    /// Block for the next batch of accepted records.
    ///
    /// Returns an empty batch when the read timeout elapses, so callers can
    /// observe cancellation. An error means the handle is unusable.
    fn receive(&self) -> Result<Vec<ConntrackRecord>>;

    /// Detach the filter and release the subscription
    fn close(&self);
}

// ctnetlink wire constants
pub(crate) const NLMSG_HDRLEN: usize = 16;
pub(crate) const NFGENMSG_LEN: usize = 4;
pub(crate) const NLA_HDRLEN: usize = 4;
pub(crate) const NLA_TYPE_MASK: u16 = 0x3fff;
pub(crate) const NLM_F_EXCL: u16 = 0x200;
pub(crate) const NLM_F_CREATE: u16 = 0x400;

pub(crate) const NFNL_SUBSYS_CTNETLINK: u16 = 1;
pub(crate) const IPCTNL_MSG_CT_NEW: u16 = 0;
pub(crate) const IPCTNL_MSG_CT_DELETE: u16 = 2;

pub(crate) const CTA_TUPLE_ORIG: u16 = 1;
pub(crate) const CTA_TUPLE_REPLY: u16 = 2;
pub(crate) const CTA_STATUS: u16 = 3;
pub(crate) const CTA_PROTOINFO: u16 = 4;

pub(crate) const CTA_TUPLE_IP: u16 = 1;
pub(crate) const CTA_TUPLE_PROTO: u16 = 2;

pub(crate) const CTA_IP_V4_SRC: u16 = 1;
pub(crate) const CTA_IP_V4_DST: u16 = 2;
pub(crate) const CTA_IP_V6_SRC: u16 = 3;
pub(crate) const CTA_IP_V6_DST: u16 = 4;

pub(crate) const CTA_PROTO_NUM: u16 = 1;
pub(crate) const CTA_PROTO_SRC_PORT: u16 = 2;
pub(crate) const CTA_PROTO_DST_PORT: u16 = 3;

pub(crate) const CTA_PROTOINFO_TCP: u16 = 1;
pub(crate) const CTA_PROTOINFO_TCP_STATE: u16 = 1;

#[inline]
pub(crate) fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Iterator over netlink attributes in a buffer
struct Attributes<'a> {
    buf: &'a [u8],
}

impl<'a> Attributes<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }
        let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let kind = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let payload = &self.buf[NLA_HDRLEN..len];
        let advance = align4(len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some((kind, payload))
    }
}

fn be_u16(bytes: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes(bytes.get(..2)?.try_into().ok()?))
}

fn be_u32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?))
}

fn ipv4(bytes: &[u8]) -> Option<IpAddr> {
    let octets: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(IpAddr::V4(Ipv4Addr::from(octets)))
}

fn ipv6(bytes: &[u8]) -> Option<IpAddr> {
    let octets: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
}

#[derive(Debug, Default)]
struct RawTuple {
    src: Option<IpAddr>,
    dst: Option<IpAddr>,
    proto: Option<u8>,
    src_port: u16,
    dst_port: u16,
}

impl RawTuple {
    fn parse(buf: &[u8]) -> Self {
        let mut tuple = RawTuple::default();
        for (kind, payload) in Attributes::new(buf) {
            match kind {
                CTA_TUPLE_IP => {
                    for (ip_kind, value) in Attributes::new(payload) {
                        match ip_kind {
                            CTA_IP_V4_SRC => tuple.src = ipv4(value),
                            CTA_IP_V4_DST => tuple.dst = ipv4(value),
                            CTA_IP_V6_SRC => tuple.src = ipv6(value),
                            CTA_IP_V6_DST => tuple.dst = ipv6(value),
                            _ => {}
                        }
                    }
                }
                CTA_TUPLE_PROTO => {
                    for (proto_kind, value) in Attributes::new(payload) {
                        match proto_kind {
                            CTA_PROTO_NUM => tuple.proto = value.first().copied(),
                            CTA_PROTO_SRC_PORT => tuple.src_port = be_u16(value).unwrap_or(0),
                            CTA_PROTO_DST_PORT => tuple.dst_port = be_u16(value).unwrap_or(0),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        tuple
    }

    fn flow(&self) -> Option<FlowTuple> {
        Some(FlowTuple {
            src: self.src?,
            dst: self.dst?,
            src_port: self.src_port,
            dst_port: self.dst_port,
        })
    }
}

fn parse_tcp_state(protoinfo: &[u8]) -> Option<TcpState> {
    Attributes::new(protoinfo)
        .filter(|(kind, _)| *kind == CTA_PROTOINFO_TCP)
        .flat_map(|(_, tcp)| Attributes::new(tcp))
        .find(|(kind, _)| *kind == CTA_PROTOINFO_TCP_STATE)
        .and_then(|(_, value)| value.first().copied())
        .and_then(TcpState::from_kernel)
}

/// Decode one ctnetlink message body into a record.
///
/// Returns `None` for messages that are not conntrack events or that
/// describe flows other than IPv4/IPv6 TCP/UDP.
pub fn decode_message(msg_type: u16, flags: u16, payload: &[u8]) -> Option<ConntrackRecord> {
    if msg_type >> 8 != NFNL_SUBSYS_CTNETLINK {
        return None;
    }
    let kind = match msg_type & 0xff {
        IPCTNL_MSG_CT_NEW if flags & (NLM_F_CREATE | NLM_F_EXCL) != 0 => EventKind::New,
        IPCTNL_MSG_CT_NEW => EventKind::Update,
        IPCTNL_MSG_CT_DELETE => EventKind::Destroy,
        _ => return None,
    };

    if payload.len() < NFGENMSG_LEN {
        return None;
    }
    let family = AddressFamily::from_kernel(payload[0])?;

    let mut original = None;
    let mut reply = None;
    let mut status = 0;
    let mut tcp_state = None;

    for (attr, value) in Attributes::new(&payload[NFGENMSG_LEN..]) {
        match attr {
            CTA_TUPLE_ORIG => original = Some(RawTuple::parse(value)),
            CTA_TUPLE_REPLY => reply = Some(RawTuple::parse(value)),
            CTA_STATUS => status = be_u32(value).unwrap_or(0),
            CTA_PROTOINFO => tcp_state = parse_tcp_state(value),
            _ => {}
        }
    }

    let original = original?;
    let protocol = L4Protocol::from_number(original.proto?)?;

    Some(ConntrackRecord {
        kind,
        family,
        protocol,
        original: original.flow()?,
        reply: reply.as_ref().and_then(RawTuple::flow),
        tcp_state: if protocol == L4Protocol::Tcp {
            tcp_state
        } else {
            None
        },
        status,
    })
}

/// Decode every ctnetlink event in a datagram
pub fn decode_datagram(buf: &[u8]) -> Vec<ConntrackRecord> {
    let mut records = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= NLMSG_HDRLEN {
        let header = &buf[offset..];
        let len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len < NLMSG_HDRLEN || len > header.len() {
            trace!(len, "Truncated netlink message");
            break;
        }
        let msg_type = u16::from_ne_bytes([header[4], header[5]]);
        let flags = u16::from_ne_bytes([header[6], header[7]]);

        match decode_message(msg_type, flags, &header[NLMSG_HDRLEN..len]) {
            Some(record) => records.push(record),
            None => trace!(msg_type, "Skipping non-conntrack or unsupported message"),
        }

        offset += align4(len);
        if offset >= buf.len() {
            break;
        }
    }

    records
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{ConntrackBackend, ConntrackHandle, SubscriptionMask, decode_datagram};
    use crate::bpf;
    use crate::error::{CtsyncError, Result};
    use crate::filter::FilterRuleSet;
    use crate::types::{ConntrackRecord, L4Protocol};
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_NETFILTER};
    use parking_lot::Mutex;
    use std::io::ErrorKind;
    use std::os::fd::AsRawFd;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tracing::{debug, instrument, trace, warn};

    /// Largest datagram the kernel sends for conntrack events
    const RECV_DATAGRAM_SIZE: usize = 64 * 1024;

    /// ctnetlink backend over a raw netlink socket
    #[derive(Debug, Clone)]
    pub struct NetlinkConntrack {
        recv_timeout: Duration,
        recv_buffer_bytes: usize,
    }

    impl NetlinkConntrack {
        pub fn new(recv_timeout: Duration, recv_buffer_bytes: usize) -> Self {
            Self {
                recv_timeout,
                recv_buffer_bytes,
            }
        }
    }

    impl ConntrackBackend for NetlinkConntrack {
        #[instrument(skip(self))]
        fn open(
            &self,
            protocol: L4Protocol,
            subscriptions: SubscriptionMask,
        ) -> Result<Arc<dyn ConntrackHandle>> {
            let open_err = |reason: String| CtsyncError::SessionOpen { protocol, reason };

            let mut socket = Socket::new(NETLINK_NETFILTER)
                .map_err(|e| open_err(format!("Failed to create socket: {}", e)))?;
            socket
                .bind(&SocketAddr::new(0, subscriptions.bits()))
                .map_err(|e| open_err(format!("Failed to bind socket: {}", e)))?;

            let handle = NetlinkConntrackHandle {
                protocol,
                socket,
                buffer: Mutex::new(Vec::with_capacity(RECV_DATAGRAM_SIZE)),
                closed: AtomicBool::new(false),
            };
            handle.tune_socket(self.recv_timeout, self.recv_buffer_bytes)?;

            debug!(
                %protocol,
                groups = subscriptions.bits(),
                fd = handle.socket.as_raw_fd(),
                "Opened conntrack subscription"
            );
            Ok(Arc::new(handle))
        }
    }

    struct NetlinkConntrackHandle {
        protocol: L4Protocol,
        socket: Socket,
        buffer: Mutex<Vec<u8>>,
        closed: AtomicBool,
    }

    impl NetlinkConntrackHandle {
        /// Read timeout, receive buffer size and overrun behavior
        ///
        /// # NIST Controls
        /// - SC-5: DoS Protection - Prevent buffer overflow under burst load
        fn tune_socket(&self, recv_timeout: Duration, recv_buffer_bytes: usize) -> Result<()> {
            let fd = self.socket.as_raw_fd();

            let timeout = libc::timeval {
                tv_sec: recv_timeout.as_secs() as libc::time_t,
                tv_usec: recv_timeout.subsec_micros() as libc::suseconds_t,
            };
            // SAFETY: fd is owned by self.socket and the option values outlive the calls
            unsafe {
                let ret = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &timeout as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                );
                if ret < 0 {
                    return Err(CtsyncError::SessionOpen {
                        protocol: self.protocol,
                        reason: format!(
                            "Failed to set SO_RCVTIMEO: {}",
                            std::io::Error::last_os_error()
                        ),
                    });
                }

                let size = recv_buffer_bytes as libc::c_int;
                let ret = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                if ret < 0 {
                    warn!("Failed to set SO_RCVBUF, using default buffer size");
                }

                let enable: libc::c_int = 1;
                let ret = libc::setsockopt(
                    fd,
                    libc::SOL_NETLINK,
                    libc::NETLINK_NO_ENOBUFS,
                    &enable as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                if ret < 0 {
                    warn!("Failed to set NETLINK_NO_ENOBUFS");
                }
            }
            Ok(())
        }

        /// Install the compiled program, replacing any previous one
        ///
        /// # NIST Controls
        /// - SC-7: Boundary Protection - Excluded flows dropped in the kernel
        fn set_socket_filter(&self, rules: &FilterRuleSet) -> Result<usize> {
            let attach_err = |reason: String| CtsyncError::FilterAttach {
                protocol: self.protocol,
                reason,
            };

            let program = bpf::compile(rules).map_err(|e| attach_err(e.to_string()))?;
            let mut filter: Vec<libc::sock_filter> = program
                .iter()
                .map(|insn| libc::sock_filter {
                    code: insn.code,
                    jt: insn.jt,
                    jf: insn.jf,
                    k: insn.k,
                })
                .collect();
            let fprog = libc::sock_fprog {
                len: filter.len() as libc::c_ushort,
                filter: filter.as_mut_ptr(),
            };

            // SAFETY: fprog points into `filter`, which outlives the call; the
            // kernel copies the program before returning
            let ret = unsafe {
                libc::setsockopt(
                    self.socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_ATTACH_FILTER,
                    &fprog as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(attach_err(format!(
                    "Failed to set SO_ATTACH_FILTER: {}",
                    std::io::Error::last_os_error()
                )));
            }
            Ok(program.len())
        }

        fn clear_socket_filter(&self) {
            let unused: libc::c_int = 0;
            // SAFETY: fd is owned by self.socket; the option value is ignored
            let ret = unsafe {
                libc::setsockopt(
                    self.socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_DETACH_FILTER,
                    &unused as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                trace!(protocol = %self.protocol, "No socket filter to detach");
            }
        }
    }

    impl ConntrackHandle for NetlinkConntrackHandle {
        fn attach_filter(&self, rules: &FilterRuleSet) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(CtsyncError::FilterAttach {
                    protocol: self.protocol,
                    reason: "handle is closed".to_string(),
                });
            }
            let instructions = self.set_socket_filter(rules)?;
            debug!(
                protocol = %self.protocol,
                rules = rules.len(),
                instructions,
                "Attached filter"
            );
            Ok(())
        }

        fn receive(&self) -> Result<Vec<ConntrackRecord>> {
            if self.closed.load(Ordering::Acquire) {
                return Err(CtsyncError::Capture {
                    protocol: self.protocol,
                    reason: "handle is closed".to_string(),
                });
            }

            let mut buffer = self.buffer.lock();
            buffer.clear();

            match self.socket.recv(&mut *buffer, 0) {
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(Vec::new());
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    warn!(protocol = %self.protocol, "Conntrack socket overrun, events lost");
                    return Ok(Vec::new());
                }
                Err(e) => {
                    return Err(CtsyncError::Capture {
                        protocol: self.protocol,
                        reason: format!("Failed to receive: {}", e),
                    });
                }
            }

            let records = decode_datagram(&buffer);
            trace!(protocol = %self.protocol, count = records.len(), "Received conntrack events");
            Ok(records)
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.clear_socket_filter();
                debug!(protocol = %self.protocol, "Closed conntrack subscription");
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Mock implementation for non-Linux platforms (development only)
#[cfg(not(target_os = "linux"))]
mod mock {
    use super::{ConntrackBackend, ConntrackHandle, SubscriptionMask};
    use crate::error::Result;
    use crate::filter::FilterRuleSet;
    use crate::types::{ConntrackRecord, L4Protocol};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub struct NetlinkConntrack {
        recv_timeout: Duration,
    }

    impl NetlinkConntrack {
        #[allow(unused_variables)]
        pub fn new(recv_timeout: Duration, recv_buffer_bytes: usize) -> Self {
            Self { recv_timeout }
        }
    }

    impl ConntrackBackend for NetlinkConntrack {
        #[allow(unused_variables)]
        fn open(
            &self,
            protocol: L4Protocol,
            subscriptions: SubscriptionMask,
        ) -> Result<Arc<dyn ConntrackHandle>> {
            Ok(Arc::new(MockHandle {
                recv_timeout: self.recv_timeout,
            }))
        }
    }

    struct MockHandle {
        recv_timeout: Duration,
    }

    impl ConntrackHandle for MockHandle {
        #[allow(unused_variables)]
        fn attach_filter(&self, rules: &FilterRuleSet) -> Result<()> {
            Ok(())
        }

        fn receive(&self) -> Result<Vec<ConntrackRecord>> {
            // In mock, just sleep to prevent busy-loop
            std::thread::sleep(self.recv_timeout);
            Ok(Vec::new())
        }

        fn close(&self) {}
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
