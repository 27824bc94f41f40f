//! Connection Tracking Synchronization Daemon for SONiC
//!
//! This crate captures kernel connection tracking events (flow creation,
//! update and teardown) for TCP and UDP, filters out traffic that must never
//! be offloaded, and hands the remaining records to the NAT/offload
//! processing pipeline. It also keeps the NAT idle timeouts in step with
//! the kernel's netfilter timeout files.
//!
//! # Modes
//!
//! - **standard**: IPv4 only, records dropped while the WAN link is down
//! - **extended**: IPv4 and IPv6, TCP creation events, no WAN gate
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | ctnetlink subscription requires CAP_NET_ADMIN |
//! | AU-3 | Content of Audit Records | Flow tuples in structured logs |
//! | AU-12 | Audit Record Generation | Session lifecycle and filter changes logged |
//! | CM-6 | Configuration Settings | TOML configuration, live timeout reload |
//! | SC-5 | DoS Protection | Bounded dispatch queue, drop on overflow |
//! | SC-7 | Boundary Protection | Local and broadcast traffic never offloaded |
//! | SI-4 | System Monitoring | Continuous flow event capture |
//! | SI-10 | Input Validation | Defensive ctnetlink attribute decoding |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//! +-----------------+     +---------------------------+     +----------------+
//! |  Linux Kernel   |     |          ctsyncd          |     | NAT / offload  |
//! |                 |     |                           |     |                |
//! |  nf_conntrack   |---->| CaptureSession (TCP)  --+ |     |                |
//! |  NEW/UPDATE/    |---->| CaptureSession (UDP)  --+-+---->| DispatchGateway|
//! |  DESTROY        |     |        ^                  |     |                |
//! |                 |     | FilterCoordinator         |     |                |
//! |  /proc/sys/net/ |     |        ^ interface up     |     |                |
//! |  .../netfilter  |---->| TimeoutWatcher -----------+---->| NatTimeoutStore|
//! +-----------------+     +---------------------------+     +----------------+
//! ```

pub mod bpf;
pub mod capture;
pub mod config;
pub mod conntrack;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod filter_builder;
pub mod filter_update;
pub mod nat;
pub mod timeout_watcher;
pub mod types;
pub mod udp_refresh;

pub use capture::{CapturePolicy, CaptureSession, CaptureStats};
pub use config::CtsyncConfig;
pub use conntrack::{ConntrackBackend, ConntrackHandle, NetlinkConntrack, SubscriptionMask};
pub use dispatch::{ChannelGateway, DispatchEvent, DispatchGateway, DispatchMessage};
pub use error::{CtsyncError, Result};
pub use filter::{AttributeKind, FilterRule, FilterRuleSet, Polarity, Selector};
pub use filter_builder::{AddressResolver, FilterBuilder, StaticResolver, SystemResolver};
pub use filter_update::{FilterCoordinator, ProtocolFilter, WanState};
pub use nat::{NatTimeoutStore, NatTimeouts};
pub use timeout_watcher::TimeoutWatcher;
pub use types::{
    AddressFamily, ConntrackRecord, EventKind, FlowTuple, InterfaceUpInfo, L4Protocol,
    SessionState, TcpState, TimeoutValue,
};
pub use udp_refresh::run_udp_timestamp_refresh;
