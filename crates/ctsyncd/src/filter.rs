//! Per-protocol conntrack filter rule sets
//!
//! A [`FilterRuleSet`] mirrors what the kernel filter evaluates before an
//! event ever reaches user space. Every attribute kind carries exactly one
//! logic (polarity). Within a kind, positive rules accept when any value
//! matches and negative rules accept when no value matches. Across kinds
//! the results are combined with AND.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Exclude self-originated traffic at the kernel boundary
//! - SC-5: DoS Protection - Broadcast traffic never reaches user space

use crate::error::{CtsyncError, Result};
use crate::types::{ConntrackRecord, L4Protocol, TcpState};
use std::fmt;
use std::net::Ipv4Addr;

/// Host route mask used by every address exclusion
pub const HOST_MASK: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Whether a rule must match or must not match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    Positive,
    Negative,
}

/// Attribute a rule selects on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    L4Proto,
    L4ProtoState,
    SrcIpv4,
    DstIpv4,
}

impl AttributeKind {
    pub(crate) const ALL: [AttributeKind; 4] = [
        AttributeKind::L4Proto,
        AttributeKind::L4ProtoState,
        AttributeKind::SrcIpv4,
        AttributeKind::DstIpv4,
    ];

    fn index(self) -> usize {
        match self {
            AttributeKind::L4Proto => 0,
            AttributeKind::L4ProtoState => 1,
            AttributeKind::SrcIpv4 => 2,
            AttributeKind::DstIpv4 => 3,
        }
    }
}

/// Attribute selector and the value it compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    L4Proto(L4Protocol),
    L4ProtoState { protocol: L4Protocol, state: TcpState },
    SrcIpv4 { addr: Ipv4Addr, mask: Ipv4Addr },
    DstIpv4 { addr: Ipv4Addr, mask: Ipv4Addr },
}

impl Selector {
    pub fn kind(&self) -> AttributeKind {
        match self {
            Selector::L4Proto(_) => AttributeKind::L4Proto,
            Selector::L4ProtoState { .. } => AttributeKind::L4ProtoState,
            Selector::SrcIpv4 { .. } => AttributeKind::SrcIpv4,
            Selector::DstIpv4 { .. } => AttributeKind::DstIpv4,
        }
    }

    /// Whether the selector applies to this record at all.
    ///
    /// State selectors only constrain flows of their own protocol that
    /// report a state. Teardown events carry no protocol info, so they pass
    /// state rules untouched. IPv4 selectors never constrain IPv6 flows.
    fn applies_to(&self, record: &ConntrackRecord) -> bool {
        match self {
            Selector::L4Proto(_) => true,
            Selector::L4ProtoState { protocol, .. } => {
                *protocol == record.protocol && record.tcp_state.is_some()
            }
            Selector::SrcIpv4 { .. } => record.src_ipv4().is_some(),
            Selector::DstIpv4 { .. } => record.dst_ipv4().is_some(),
        }
    }

    fn matches(&self, record: &ConntrackRecord) -> bool {
        match self {
            Selector::L4Proto(protocol) => record.protocol == *protocol,
            Selector::L4ProtoState { protocol, state } => {
                record.protocol == *protocol && record.tcp_state == Some(*state)
            }
            Selector::SrcIpv4 { addr, mask } => record
                .src_ipv4()
                .is_some_and(|src| masked_eq(src, *addr, *mask)),
            Selector::DstIpv4 { addr, mask } => record
                .dst_ipv4()
                .is_some_and(|dst| masked_eq(dst, *addr, *mask)),
        }
    }
}

fn masked_eq(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

/// A single inclusion or exclusion rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterRule {
    pub selector: Selector,
    pub polarity: Polarity,
}

impl FilterRule {
    pub fn positive(selector: Selector) -> Self {
        Self {
            selector,
            polarity: Polarity::Positive,
        }
    }

    pub fn negative(selector: Selector) -> Self {
        Self {
            selector,
            polarity: Polarity::Negative,
        }
    }

    /// Exclude flows whose original destination is `addr`/32
    pub fn exclude_dst(addr: Ipv4Addr) -> Self {
        Self::negative(Selector::DstIpv4 {
            addr,
            mask: HOST_MASK,
        })
    }

    /// Exclude flows whose original source is `addr`/32
    pub fn exclude_src(addr: Ipv4Addr) -> Self {
        Self::negative(Selector::SrcIpv4 {
            addr,
            mask: HOST_MASK,
        })
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.polarity {
            Polarity::Positive => "==",
            Polarity::Negative => "!=",
        };
        match self.selector {
            Selector::L4Proto(p) => write!(f, "l4proto {} {}", op, p),
            Selector::L4ProtoState { protocol, state } => {
                write!(f, "{} state {} {:?}", protocol, op, state)
            }
            Selector::SrcIpv4 { addr, mask } => write!(f, "src {} {}/{}", op, addr, mask),
            Selector::DstIpv4 { addr, mask } => write!(f, "dst {} {}/{}", op, addr, mask),
        }
    }
}

/// Ordered rule set for one protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRuleSet {
    protocol: L4Protocol,
    rules: Vec<FilterRule>,
    logic: [Option<Polarity>; 4],
    global_broadcast_excluded: bool,
}

impl FilterRuleSet {
    /// Create an empty rule set that accepts everything
    pub fn new(protocol: L4Protocol) -> Self {
        Self {
            protocol,
            rules: Vec::new(),
            logic: [None; 4],
            global_broadcast_excluded: false,
        }
    }

    pub fn protocol(&self) -> L4Protocol {
        self.protocol
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Logic currently established for an attribute kind
    pub fn logic(&self, kind: AttributeKind) -> Option<Polarity> {
        self.logic[kind.index()]
    }

    /// Establish the logic for an attribute kind.
    ///
    /// Re-setting the same logic is accepted. A kind cannot switch polarity
    /// once set, as the kernel filter keeps one logic per attribute.
    pub fn set_logic(&mut self, kind: AttributeKind, polarity: Polarity) -> Result<()> {
        match self.logic[kind.index()] {
            Some(existing) if existing != polarity => Err(CtsyncError::FilterConfig(format!(
                "{} filter already uses {:?} logic for {:?}",
                self.protocol, existing, kind
            ))),
            _ => {
                self.logic[kind.index()] = Some(polarity);
                Ok(())
            }
        }
    }

    /// Append a rule, establishing its kind's logic if needed
    pub fn push(&mut self, rule: FilterRule) -> Result<()> {
        self.set_logic(rule.selector.kind(), rule.polarity)?;
        self.rules.push(rule);
        Ok(())
    }

    /// Whether the global broadcast exclusion has been applied
    pub fn global_broadcast_excluded(&self) -> bool {
        self.global_broadcast_excluded
    }

    pub(crate) fn latch_global_broadcast(&mut self) {
        self.global_broadcast_excluded = true;
    }

    /// Evaluate the rule set against a record the way the kernel does
    pub fn accepts(&self, record: &ConntrackRecord) -> bool {
        AttributeKind::ALL.iter().all(|kind| {
            let Some(polarity) = self.logic(*kind) else {
                return true;
            };

            let mut applicable = self
                .rules
                .iter()
                .filter(|rule| rule.selector.kind() == *kind)
                .filter(|rule| rule.selector.applies_to(record))
                .peekable();

            if applicable.peek().is_none() {
                return true;
            }

            let any_match = applicable.any(|rule| rule.selector.matches(record));
            match polarity {
                Polarity::Positive => any_match,
                Polarity::Negative => !any_match,
            }
        })
    }
}

/// Directed broadcast address of a subnet, `(~mask) | (addr & mask)`
pub fn broadcast_address(addr: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    let addr = u32::from(addr);
    let mask = u32::from(mask);
    Ipv4Addr::from((0xFFFF_FFFF & !mask) | (addr & mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;

    fn udp(src: Ipv4Addr, dst: Ipv4Addr) -> ConntrackRecord {
        ConntrackRecord::ipv4(EventKind::New, L4Protocol::Udp, (src, 5000), (dst, 53))
    }

    #[test]
    fn test_broadcast_address() {
        assert_eq!(
            broadcast_address(
                Ipv4Addr::new(192, 168, 1, 1),
                Ipv4Addr::new(255, 255, 255, 0)
            ),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 0, 0, 0)),
            Ipv4Addr::new(10, 255, 255, 255)
        );
        assert_eq!(
            broadcast_address(Ipv4Addr::new(172, 16, 5, 4), Ipv4Addr::BROADCAST),
            Ipv4Addr::new(172, 16, 5, 4)
        );
    }

    #[test]
    fn test_broadcast_formula_holds_for_many_masks() {
        let addr = Ipv4Addr::new(100, 64, 37, 201);
        for prefix in 0..=32u32 {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix)
            };
            let expected = (0xFFFF_FFFF & !mask) | (u32::from(addr) & mask);
            assert_eq!(
                broadcast_address(addr, Ipv4Addr::from(mask)),
                Ipv4Addr::from(expected)
            );
        }
    }

    #[test]
    fn test_empty_set_accepts_everything() {
        let set = FilterRuleSet::new(L4Protocol::Udp);
        assert!(set.accepts(&udp(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2))));
    }

    #[test]
    fn test_negative_rules_are_none_of() {
        let mut set = FilterRuleSet::new(L4Protocol::Udp);
        set.push(FilterRule::exclude_dst(Ipv4Addr::new(192, 168, 1, 1)))
            .unwrap();
        set.push(FilterRule::exclude_dst(Ipv4Addr::new(192, 168, 1, 255)))
            .unwrap();

        let lan = Ipv4Addr::new(192, 168, 1, 20);
        assert!(!set.accepts(&udp(lan, Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!set.accepts(&udp(lan, Ipv4Addr::new(192, 168, 1, 255))));
        assert!(set.accepts(&udp(lan, Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn test_conflicting_logic_rejected() {
        let mut set = FilterRuleSet::new(L4Protocol::Tcp);
        set.push(FilterRule::positive(Selector::L4Proto(L4Protocol::Tcp)))
            .unwrap();
        let err = set
            .push(FilterRule::negative(Selector::L4Proto(L4Protocol::Udp)))
            .unwrap_err();
        assert!(matches!(err, CtsyncError::FilterConfig(_)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_ipv4_rules_do_not_apply_to_ipv6() {
        let mut set = FilterRuleSet::new(L4Protocol::Udp);
        set.push(FilterRule::exclude_src(Ipv4Addr::new(10, 0, 0, 1)))
            .unwrap();

        let mut record = udp(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        record.family = crate::types::AddressFamily::Ipv6;
        record.original.src = "fd00::1".parse().unwrap();
        record.original.dst = "fd00::2".parse().unwrap();
        assert!(set.accepts(&record));
    }

    #[test]
    fn test_state_rules_skip_stateless_records() {
        let mut set = FilterRuleSet::new(L4Protocol::Tcp);
        set.push(FilterRule::positive(Selector::L4ProtoState {
            protocol: L4Protocol::Tcp,
            state: TcpState::Established,
        }))
        .unwrap();

        let destroy = ConntrackRecord::ipv4(
            EventKind::Destroy,
            L4Protocol::Tcp,
            (Ipv4Addr::new(192, 168, 1, 20), 51000),
            (Ipv4Addr::new(93, 184, 216, 34), 443),
        );
        assert!(set.accepts(&destroy));
        assert!(!set.accepts(&destroy.with_tcp_state(TcpState::Close)));
    }

    #[test]
    fn test_rule_display() {
        let rule = FilterRule::exclude_dst(Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(rule.to_string(), "dst != 192.168.1.255/255.255.255.255");
    }
}
