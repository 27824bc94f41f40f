//! Classic BPF programs compiled from conntrack rule sets
//!
//! The program runs on every ctnetlink message before it is queued on a
//! subscription socket, so flows a [`FilterRuleSet`] rejects never reach
//! user space. Attributes are located with the `SKF_AD_NLATTR` and
//! `SKF_AD_NLATTR_NEST` ancillary loads. A selector whose attribute is
//! absent from the message does not constrain it, matching
//! [`FilterRuleSet::accepts`].
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Rules enforced inside the kernel
//! - SC-5: DoS Protection - Excluded flows cost no user-space work

use crate::conntrack::{
    CTA_IP_V4_DST, CTA_IP_V4_SRC, CTA_PROTO_NUM, CTA_PROTOINFO, CTA_PROTOINFO_TCP,
    CTA_PROTOINFO_TCP_STATE, CTA_TUPLE_IP, CTA_TUPLE_ORIG, CTA_TUPLE_PROTO, NFGENMSG_LEN,
    NLA_HDRLEN, NLMSG_HDRLEN,
};
use crate::error::{CtsyncError, Result};
use crate::filter::{AttributeKind, FilterRuleSet, Polarity, Selector};
use crate::types::L4Protocol;

// linux/filter.h
const BPF_LD: u16 = 0x00;
const BPF_LDX: u16 = 0x01;
const BPF_ST: u16 = 0x02;
const BPF_ALU: u16 = 0x04;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_MISC: u16 = 0x07;
const BPF_W: u16 = 0x00;
const BPF_B: u16 = 0x10;
const BPF_IMM: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_IND: u16 = 0x40;
const BPF_MEM: u16 = 0x60;
const BPF_AND: u16 = 0x50;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_TAX: u16 = 0x00;

const SKF_AD_OFF: i32 = -0x1000;
const SKF_AD_NLATTR: i32 = 12;
const SKF_AD_NLATTR_NEST: i32 = 16;

/// Kernel limit on classic program length
pub const BPF_MAXINSNS: usize = 4096;

pub(crate) const OP_LD_IMM: u16 = BPF_LD | BPF_W | BPF_IMM;
pub(crate) const OP_LDX_IMM: u16 = BPF_LDX | BPF_W | BPF_IMM;
pub(crate) const OP_LD_ANCILLARY: u16 = BPF_LD | BPF_B | BPF_ABS;
pub(crate) const OP_LDB_IND: u16 = BPF_LD | BPF_B | BPF_IND;
pub(crate) const OP_LDW_IND: u16 = BPF_LD | BPF_W | BPF_IND;
pub(crate) const OP_LD_MEM: u16 = BPF_LD | BPF_MEM;
pub(crate) const OP_ST: u16 = BPF_ST;
pub(crate) const OP_TAX: u16 = BPF_MISC | BPF_TAX;
pub(crate) const OP_AND_K: u16 = BPF_ALU | BPF_AND | BPF_K;
pub(crate) const OP_JEQ_K: u16 = BPF_JMP | BPF_JEQ | BPF_K;
pub(crate) const OP_RET_K: u16 = BPF_RET | BPF_K;

pub(crate) const NLATTR: u32 = (SKF_AD_OFF + SKF_AD_NLATTR) as u32;
pub(crate) const NLATTR_NEST: u32 = (SKF_AD_OFF + SKF_AD_NLATTR_NEST) as u32;

const ACCEPT: u32 = u32::MAX;
const DROP: u32 = 0;

/// Offset of the first ctnetlink attribute in a message
const PAYLOAD_OFFSET: u32 = (NLMSG_HDRLEN + NFGENMSG_LEN) as u32;

// Scratch memory slots
const PROTO_SLOT: u32 = 0;
const STATE_SLOT: u32 = 1;
const ADDR_SLOT: u32 = 2;

/// Negative address rules per lookup, keeps every jump within `u8` range
const NEGATIVE_CHUNK: usize = 48;

/// One classic BPF instruction, laid out like `struct sock_filter`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInstruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Next,
    Skip(u8),
    Label(usize),
}

/// What a failed attribute lookup does
#[derive(Debug, Clone, Copy)]
enum Missing {
    Accept,
    JumpTo(usize),
}

struct Pending {
    code: u16,
    k: u32,
    jt: Target,
    jf: Target,
}

#[derive(Default)]
struct Assembler {
    code: Vec<Pending>,
    labels: Vec<Option<usize>>,
}

impl Assembler {
    fn stmt(&mut self, code: u16, k: u32) {
        self.jump(code, k, Target::Next, Target::Next);
    }

    fn jump(&mut self, code: u16, k: u32, jt: Target, jf: Target) {
        self.code.push(Pending { code, k, jt, jf });
    }

    fn jeq(&mut self, k: u32, jt: Target, jf: Target) {
        self.jump(OP_JEQ_K, k, jt, jf);
    }

    fn ret(&mut self, verdict: u32) {
        self.stmt(OP_RET_K, verdict);
    }

    fn label(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn bind(&mut self, label: usize) {
        self.labels[label] = Some(self.code.len());
    }

    /// Leave X pointing at the attribute found by walking `path`
    fn find_attribute(&mut self, path: &[u16], missing: Missing) {
        self.stmt(OP_LD_IMM, PAYLOAD_OFFSET);
        for (depth, kind) in path.iter().enumerate() {
            self.stmt(OP_LDX_IMM, u32::from(*kind));
            self.stmt(
                OP_LD_ANCILLARY,
                if depth == 0 { NLATTR } else { NLATTR_NEST },
            );
            match missing {
                Missing::Accept => {
                    self.jeq(0, Target::Next, Target::Skip(1));
                    self.ret(ACCEPT);
                }
                Missing::JumpTo(end) => self.jeq(0, Target::Label(end), Target::Next),
            }
        }
        self.stmt(OP_TAX, 0);
    }

    /// Compare a scratch slot against `(mask, value)` pairs.
    ///
    /// Positive logic continues at `end` on the first match and drops
    /// otherwise. Negative logic drops on any match.
    fn compare(&mut self, polarity: Polarity, slot: u32, values: &[(u32, u32)], end: usize) {
        for &(mask, value) in values {
            self.stmt(OP_LD_MEM, slot);
            if mask != u32::MAX {
                self.stmt(OP_AND_K, mask);
            }
            match polarity {
                Polarity::Positive => self.jeq(value & mask, Target::Label(end), Target::Next),
                Polarity::Negative => {
                    self.jeq(value & mask, Target::Next, Target::Skip(1));
                    self.ret(DROP);
                }
            }
        }
        if polarity == Polarity::Positive {
            self.ret(DROP);
        }
    }

    fn offset(&self, pc: usize, target: Target) -> Result<u8> {
        match target {
            Target::Next => Ok(0),
            Target::Skip(n) => Ok(n),
            Target::Label(label) => {
                let dest = self.labels.get(label).copied().flatten().ok_or_else(|| {
                    CtsyncError::FilterConfig(format!("unbound jump label {}", label))
                })?;
                dest.checked_sub(pc + 1)
                    .and_then(|off| u8::try_from(off).ok())
                    .ok_or_else(|| {
                        CtsyncError::FilterConfig(format!(
                            "jump from {} to {} out of range",
                            pc, dest
                        ))
                    })
            }
        }
    }

    fn finish(self) -> Result<Vec<BpfInstruction>> {
        if self.code.len() > BPF_MAXINSNS {
            return Err(CtsyncError::FilterConfig(format!(
                "filter program has {} instructions, limit is {}",
                self.code.len(),
                BPF_MAXINSNS
            )));
        }
        self.code
            .iter()
            .enumerate()
            .map(|(pc, insn)| {
                Ok(BpfInstruction {
                    code: insn.code,
                    jt: self.offset(pc, insn.jt)?,
                    jf: self.offset(pc, insn.jf)?,
                    k: insn.k,
                })
            })
            .collect()
    }
}

/// Compile a rule set into a socket filter program.
///
/// Messages with no original protocol attribute are accepted and left
/// for the decoder to discard.
pub fn compile(rules: &FilterRuleSet) -> Result<Vec<BpfInstruction>> {
    let mut asm = Assembler::default();

    asm.find_attribute(
        &[CTA_TUPLE_ORIG, CTA_TUPLE_PROTO, CTA_PROTO_NUM],
        Missing::Accept,
    );
    asm.stmt(OP_LDB_IND, NLA_HDRLEN as u32);
    asm.stmt(OP_ST, PROTO_SLOT);

    for kind in AttributeKind::ALL {
        let Some(polarity) = rules.logic(kind) else {
            continue;
        };
        let selectors: Vec<Selector> = rules
            .rules()
            .iter()
            .map(|rule| rule.selector)
            .filter(|selector| selector.kind() == kind)
            .collect();

        match kind {
            AttributeKind::L4Proto => {
                let values: Vec<(u32, u32)> = selectors
                    .iter()
                    .filter_map(|selector| match selector {
                        Selector::L4Proto(protocol) => {
                            Some((u32::MAX, u32::from(protocol.number())))
                        }
                        _ => None,
                    })
                    .collect();
                if values.is_empty() {
                    continue;
                }
                let end = asm.label();
                asm.compare(polarity, PROTO_SLOT, &values, end);
                asm.bind(end);
            }
            AttributeKind::L4ProtoState => {
                for protocol in [L4Protocol::Tcp, L4Protocol::Udp] {
                    let values: Vec<(u32, u32)> = selectors
                        .iter()
                        .filter_map(|selector| match selector {
                            Selector::L4ProtoState { protocol: p, state } if *p == protocol => {
                                Some((u32::MAX, u32::from(state.number())))
                            }
                            _ => None,
                        })
                        .collect();
                    if values.is_empty() {
                        continue;
                    }
                    let end = asm.label();
                    asm.stmt(OP_LD_MEM, PROTO_SLOT);
                    asm.jeq(
                        u32::from(protocol.number()),
                        Target::Next,
                        Target::Label(end),
                    );
                    asm.find_attribute(
                        &[CTA_PROTOINFO, CTA_PROTOINFO_TCP, CTA_PROTOINFO_TCP_STATE],
                        Missing::JumpTo(end),
                    );
                    asm.stmt(OP_LDB_IND, NLA_HDRLEN as u32);
                    asm.stmt(OP_ST, STATE_SLOT);
                    asm.compare(polarity, STATE_SLOT, &values, end);
                    asm.bind(end);
                }
            }
            AttributeKind::SrcIpv4 | AttributeKind::DstIpv4 => {
                let leaf = if kind == AttributeKind::SrcIpv4 {
                    CTA_IP_V4_SRC
                } else {
                    CTA_IP_V4_DST
                };
                let values: Vec<(u32, u32)> = selectors
                    .iter()
                    .filter_map(|selector| match selector {
                        Selector::SrcIpv4 { addr, mask } | Selector::DstIpv4 { addr, mask } => {
                            Some((u32::from(*mask), u32::from(*addr)))
                        }
                        _ => None,
                    })
                    .collect();
                if values.is_empty() {
                    continue;
                }
                // None-of splits cleanly; any-of must stay in one block
                let chunk = match polarity {
                    Polarity::Negative => NEGATIVE_CHUNK,
                    Polarity::Positive => values.len(),
                };
                for chunk in values.chunks(chunk) {
                    let end = asm.label();
                    asm.find_attribute(
                        &[CTA_TUPLE_ORIG, CTA_TUPLE_IP, leaf],
                        Missing::JumpTo(end),
                    );
                    asm.stmt(OP_LDW_IND, NLA_HDRLEN as u32);
                    asm.stmt(OP_ST, ADDR_SLOT);
                    asm.compare(polarity, ADDR_SLOT, chunk, end);
                    asm.bind(end);
                }
            }
        }
    }

    asm.ret(ACCEPT);
    asm.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::{
        CTA_PROTO_DST_PORT, CTA_PROTO_SRC_PORT, CTA_STATUS, IPCTNL_MSG_CT_DELETE, IPCTNL_MSG_CT_NEW,
        NFNL_SUBSYS_CTNETLINK, NLA_TYPE_MASK, NLM_F_CREATE, align4, decode_datagram,
    };
    use crate::filter::FilterRule;
    use crate::filter_builder::{FilterBuilder, StaticResolver};
    use crate::types::{AddressFamily, ConntrackRecord, EventKind, InterfaceUpInfo, TcpState};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn nla_find(pkt: &[u8], mut offset: usize, end: usize, kind: u32) -> u32 {
        while offset + NLA_HDRLEN <= end {
            let len = u16::from_ne_bytes([pkt[offset], pkt[offset + 1]]) as usize;
            let found = u16::from_ne_bytes([pkt[offset + 2], pkt[offset + 3]]) & NLA_TYPE_MASK;
            if len < NLA_HDRLEN || len > end - offset {
                return 0;
            }
            if u32::from(found) == kind {
                return offset as u32;
            }
            offset += align4(len);
        }
        0
    }

    /// Evaluates the instructions `compile` emits, with the kernel's
    /// netlink attribute ancillary semantics
    fn run(program: &[BpfInstruction], pkt: &[u8]) -> u32 {
        let (mut a, mut x) = (0u32, 0u32);
        let mut mem = [0u32; 16];
        let mut pc = 0;

        loop {
            let insn = program[pc];
            pc += 1;
            match insn.code {
                OP_LD_IMM => a = insn.k,
                OP_LDX_IMM => x = insn.k,
                OP_LD_ANCILLARY => {
                    let start = a as usize;
                    if start + NLA_HDRLEN > pkt.len() {
                        a = 0;
                    } else if insn.k == NLATTR {
                        a = nla_find(pkt, start, pkt.len(), x);
                    } else {
                        assert_eq!(insn.k, NLATTR_NEST);
                        let len = u16::from_ne_bytes([pkt[start], pkt[start + 1]]) as usize;
                        a = if len > pkt.len() - start {
                            0
                        } else {
                            nla_find(pkt, start + NLA_HDRLEN, start + len, x)
                        };
                    }
                }
                OP_LDB_IND => match pkt.get((x + insn.k) as usize) {
                    Some(byte) => a = u32::from(*byte),
                    None => return 0,
                },
                OP_LDW_IND => {
                    let at = (x + insn.k) as usize;
                    match pkt.get(at..at + 4) {
                        Some(word) => a = u32::from_be_bytes(word.try_into().unwrap()),
                        None => return 0,
                    }
                }
                OP_LD_MEM => a = mem[insn.k as usize],
                OP_ST => mem[insn.k as usize] = a,
                OP_TAX => x = a,
                OP_AND_K => a &= insn.k,
                OP_JEQ_K => {
                    pc += usize::from(if a == insn.k { insn.jt } else { insn.jf });
                }
                OP_RET_K => return insn.k,
                other => panic!("unexpected opcode {:#x}", other),
            }
        }
    }

    fn nla(kind: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((NLA_HDRLEN + payload.len()) as u16).to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.extend_from_slice(payload);
        out.resize(align4(out.len()), 0);
        out
    }

    fn nested(kind: u16, children: &[Vec<u8>]) -> Vec<u8> {
        nla(kind | 0x8000, &children.concat())
    }

    fn address(kind: u16, addr: IpAddr) -> Vec<u8> {
        match addr {
            IpAddr::V4(v4) => nla(kind, &v4.octets()),
            IpAddr::V6(v6) => nla(kind + 2, &v6.octets()),
        }
    }

    /// ctnetlink event message for a record, leading with a status
    /// attribute so lookups have something to skip
    fn encode(record: &ConntrackRecord) -> Vec<u8> {
        let flow = &record.original;
        let mut attrs = vec![
            nla(CTA_STATUS, &record.status.to_be_bytes()),
            nested(
                CTA_TUPLE_ORIG,
                &[
                    nested(
                        CTA_TUPLE_IP,
                        &[
                            address(CTA_IP_V4_SRC, flow.src),
                            address(CTA_IP_V4_DST, flow.dst),
                        ],
                    ),
                    nested(
                        CTA_TUPLE_PROTO,
                        &[
                            nla(CTA_PROTO_NUM, &[record.protocol.number()]),
                            nla(CTA_PROTO_SRC_PORT, &flow.src_port.to_be_bytes()),
                            nla(CTA_PROTO_DST_PORT, &flow.dst_port.to_be_bytes()),
                        ],
                    ),
                ],
            ),
        ];
        if let Some(state) = record.tcp_state {
            attrs.push(nested(
                CTA_PROTOINFO,
                &[nested(
                    CTA_PROTOINFO_TCP,
                    &[nla(CTA_PROTOINFO_TCP_STATE, &[state.number()])],
                )],
            ));
        }

        let (msg, flags) = match record.kind {
            EventKind::New => (IPCTNL_MSG_CT_NEW, NLM_F_CREATE),
            EventKind::Update => (IPCTNL_MSG_CT_NEW, 0),
            EventKind::Destroy => (IPCTNL_MSG_CT_DELETE, 0),
        };
        let family = match flow.src {
            IpAddr::V4(_) => libc::AF_INET as u8,
            IpAddr::V6(_) => libc::AF_INET6 as u8,
        };
        let mut body = vec![family, 0, 0, 0];
        body.extend(attrs.concat());

        let mut out = Vec::new();
        out.extend_from_slice(&((NLMSG_HDRLEN + body.len()) as u32).to_ne_bytes());
        out.extend_from_slice(&((NFNL_SUBSYS_CTNETLINK << 8) | msg).to_ne_bytes());
        out.extend_from_slice(&flags.to_ne_bytes());
        out.extend_from_slice(&[0; 8]);
        out.extend(body);
        out
    }

    fn builder() -> FilterBuilder {
        let bridge = InterfaceUpInfo::new(
            "bridge0",
            Ipv4Addr::new(192, 168, 225, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        FilterBuilder::new(Arc::new(StaticResolver::new(vec![bridge])), "bridge0")
    }

    fn daemon_rules(protocol: L4Protocol) -> FilterRuleSet {
        let b = builder();
        let wlan = InterfaceUpInfo::new(
            "wlan0",
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        let mut rules = FilterRuleSet::new(protocol);
        b.init_baseline(&mut rules).unwrap();
        b.exclude_bridge_traffic(&mut rules).unwrap();
        b.exclude_global_broadcast(&mut rules).unwrap();
        b.exclude_local_interface(&mut rules, &wlan).unwrap();
        rules
    }

    fn flow(kind: EventKind, protocol: L4Protocol, src: [u8; 4], dst: [u8; 4]) -> ConntrackRecord {
        ConntrackRecord::ipv4(
            kind,
            protocol,
            (Ipv4Addr::from(src), 40000),
            (Ipv4Addr::from(dst), 443),
        )
    }

    fn samples() -> Vec<ConntrackRecord> {
        let lan = [192, 168, 225, 20];
        let wan = [93, 184, 216, 34];
        let ipv6 = |mut record: ConntrackRecord| {
            record.family = AddressFamily::Ipv6;
            record.original.src = "fd00::20".parse().unwrap();
            record.original.dst = "2001:db8::34".parse().unwrap();
            record
        };
        let tcp = |src, dst, state| {
            flow(EventKind::Update, L4Protocol::Tcp, src, dst).with_tcp_state(state)
        };

        vec![
            tcp(lan, wan, TcpState::Established),
            tcp(lan, wan, TcpState::FinWait),
            tcp(lan, wan, TcpState::Close),
            tcp(lan, [192, 168, 225, 1], TcpState::Established),
            flow(EventKind::Destroy, L4Protocol::Tcp, lan, wan),
            flow(EventKind::Destroy, L4Protocol::Tcp, [192, 168, 1, 1], wan),
            flow(EventKind::New, L4Protocol::Udp, lan, wan),
            flow(EventKind::New, L4Protocol::Udp, lan, [192, 168, 1, 255]),
            flow(EventKind::New, L4Protocol::Udp, [255, 255, 255, 255], wan),
            flow(EventKind::Destroy, L4Protocol::Udp, [10, 0, 0, 2], [1, 1, 1, 1]),
            ipv6(flow(EventKind::Destroy, L4Protocol::Tcp, lan, wan)),
            ipv6(flow(EventKind::New, L4Protocol::Udp, lan, wan)),
        ]
    }

    #[test]
    fn test_program_agrees_with_rule_set() {
        for protocol in [L4Protocol::Tcp, L4Protocol::Udp] {
            let rules = daemon_rules(protocol);
            let program = compile(&rules).unwrap();

            for record in samples() {
                let message = encode(&record);
                let decoded = decode_datagram(&message);
                assert_eq!(decoded.len(), 1);
                assert_eq!(decoded[0], record);
                assert_eq!(
                    run(&program, &message) != DROP,
                    rules.accepts(&record),
                    "{} filter disagrees on {:?}",
                    protocol,
                    record
                );
            }
        }
    }

    #[test]
    fn test_tcp_teardown_passes_state_rules() {
        let program = compile(&daemon_rules(L4Protocol::Tcp)).unwrap();
        let destroy = flow(
            EventKind::Destroy,
            L4Protocol::Tcp,
            [192, 168, 225, 20],
            [93, 184, 216, 34],
        );
        assert_eq!(run(&program, &encode(&destroy)), ACCEPT);
    }

    #[test]
    fn test_other_protocols_dropped() {
        let tcp = compile(&daemon_rules(L4Protocol::Tcp)).unwrap();
        let udp = flow(EventKind::New, L4Protocol::Udp, [10, 0, 0, 2], [1, 1, 1, 1]);
        assert_eq!(run(&tcp, &encode(&udp)), DROP);

        // ICMP never decodes into a record, but must not reach user space either
        let mut icmp = encode(&udp);
        let proto = icmp
            .windows(5)
            .position(|w| w == [5, 0, 1, 0, 17])
            .expect("protocol attribute");
        icmp[proto + 4] = 1;
        assert_eq!(run(&tcp, &icmp), DROP);
        assert!(decode_datagram(&icmp).is_empty());
    }

    #[test]
    fn test_message_without_tuple_accepted() {
        let program = compile(&daemon_rules(L4Protocol::Udp)).unwrap();
        let mut message = Vec::new();
        let body = [vec![libc::AF_INET as u8, 0, 0, 0], nla(CTA_STATUS, &[0; 4])].concat();
        message.extend_from_slice(&((NLMSG_HDRLEN + body.len()) as u32).to_ne_bytes());
        message.extend_from_slice(&(NFNL_SUBSYS_CTNETLINK << 8).to_ne_bytes());
        message.extend_from_slice(&[0; 10]);
        message.extend(body);
        assert_eq!(run(&program, &message), ACCEPT);
    }

    #[test]
    fn test_empty_rule_set_accepts_everything() {
        let program = compile(&FilterRuleSet::new(L4Protocol::Udp)).unwrap();
        for record in samples() {
            assert_eq!(run(&program, &encode(&record)), ACCEPT);
        }
    }

    #[test]
    fn test_large_exclusion_set_stays_in_jump_range() {
        let mut rules = FilterRuleSet::new(L4Protocol::Udp);
        builder().init_udp_baseline(&mut rules).unwrap();
        for host in 0..200u32 {
            rules
                .push(FilterRule::exclude_dst(Ipv4Addr::from(0x0a00_0000 + host)))
                .unwrap();
        }
        let program = compile(&rules).unwrap();
        assert!(program.len() <= BPF_MAXINSNS);

        let lan = [192, 168, 225, 20];
        let excluded = flow(EventKind::New, L4Protocol::Udp, lan, [10, 0, 0, 199]);
        let allowed = flow(EventKind::New, L4Protocol::Udp, lan, [10, 0, 0, 200]);
        assert_eq!(run(&program, &encode(&excluded)), DROP);
        assert_eq!(run(&program, &encode(&allowed)), ACCEPT);
    }

    #[test]
    fn test_masked_positive_rule() {
        let mut rules = FilterRuleSet::new(L4Protocol::Udp);
        rules
            .push(FilterRule::positive(Selector::SrcIpv4 {
                addr: Ipv4Addr::new(10, 1, 0, 0),
                mask: Ipv4Addr::new(255, 255, 0, 0),
            }))
            .unwrap();
        let program = compile(&rules).unwrap();

        let inside = flow(EventKind::New, L4Protocol::Udp, [10, 1, 7, 9], [1, 1, 1, 1]);
        let outside = flow(EventKind::New, L4Protocol::Udp, [10, 2, 7, 9], [1, 1, 1, 1]);
        assert_eq!(run(&program, &encode(&inside)), ACCEPT);
        assert_eq!(run(&program, &encode(&outside)), DROP);
    }

    #[test]
    fn test_oversized_positive_block_rejected() {
        let mut rules = FilterRuleSet::new(L4Protocol::Udp);
        for host in 0..150u32 {
            rules
                .push(FilterRule::positive(Selector::DstIpv4 {
                    addr: Ipv4Addr::from(0x0a00_0000 + host),
                    mask: Ipv4Addr::BROADCAST,
                }))
                .unwrap();
        }
        let err = compile(&rules).unwrap_err();
        assert!(matches!(err, CtsyncError::FilterConfig(_)));
    }
}
