// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The rule definition wire shape: match instructions, terminal
//! actions, and the `RuleDef` a control plane submits for
//! installation.
//!
//! A rule is an instruction stream: zero or more match instructions,
//! each carrying `negate`/`or` modifier flags, followed by exactly one
//! terminal action. Lengths are declared in 32-bit words alongside the
//! structured stream so the engine can cross-check what the control
//! plane thinks it encoded.

use core::fmt;
use core::fmt::Display;
use core::ops::RangeInclusive;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;

use bitflags::bitflags;
use ipnetwork::Ipv4Network;
use ipnetwork::Ipv6Network;
use serde::Deserialize;
use serde::Serialize;

use crate::ip::ExtHeaders;
use crate::ip::TcpFlags;

/// The reserved default rule number. The default rule always exists,
/// always matches, and cannot be deleted or moved.
pub const DEFAULT_RULE_NUMBER: u16 = 65535;

/// The reserved rule set. Rules in this set survive `flush` and the
/// set can never be disabled.
pub const RESERVED_SET: u8 = 31;

/// The magic operand value requesting substitution of the value most
/// recently produced by a table lookup in the same rule.
pub const TABLEARG: u32 = 0xffff;

/// Upper bound on the number of operands a single list-valued match
/// instruction may carry.
pub const MAX_OPERANDS: usize = 30;

/// One address comparison inside a source/destination address match.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AddrMatch {
    /// Exact address equality.
    Exact(IpAddr),
    /// CIDR containment, IPv4.
    Net4(Ipv4Network),
    /// CIDR containment, IPv6.
    Net6(Ipv6Network),
    /// Non-contiguous mask: `pkt & mask == addr & mask`.
    Masked4 { addr: Ipv4Addr, mask: Ipv4Addr },
    /// Matches any address of either family.
    Any,
}

impl AddrMatch {
    pub fn matches(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Self::Exact(want), got) => *want == got,
            (Self::Net4(net), IpAddr::V4(v4)) => net.contains(v4),
            (Self::Net6(net), IpAddr::V6(v6)) => net.contains(v6),
            (Self::Masked4 { addr, mask }, IpAddr::V4(v4)) => {
                let m = u32::from(*mask);
                u32::from(v4) & m == u32::from(*addr) & m
            }
            (Self::Any, _) => true,
            _ => false,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Self::Exact(IpAddr::V6(_)) | Self::Net6(_))
    }

    /// Encoded size in 32-bit words.
    pub fn words(&self) -> u16 {
        match self {
            Self::Exact(IpAddr::V4(_)) => 2,
            Self::Exact(IpAddr::V6(_)) => 5,
            Self::Net4(_) => 2,
            Self::Net6(_) => 6,
            Self::Masked4 { .. } => 3,
            Self::Any => 1,
        }
    }
}

impl Display for AddrMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exact(ip) => write!(f, "{}", ip),
            Self::Net4(net) => write!(f, "{}", net),
            Self::Net6(net) => write!(f, "{}", net),
            Self::Masked4 { addr, mask } => write!(f, "{}:{}", addr, mask),
            Self::Any => write!(f, "any"),
        }
    }
}

bitflags! {
    /// Which flow fields participate in a `Limit` instruction's
    /// conversation key.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct LimitMask: u8 {
        const SRC_ADDR = 0x01;
        const SRC_PORT = 0x02;
        const DST_ADDR = 0x04;
        const DST_PORT = 0x08;
    }
}

/// Which flow address a table lookup instruction keys on.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum LookupKey {
    SrcAddr,
    DstAddr,
}

impl Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SrcAddr => write!(f, "src-ip"),
            Self::DstAddr => write!(f, "dst-ip"),
        }
    }
}

/// A match instruction's operation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MatchOp {
    /// Always matches.
    Nop,
    /// IP protocol number, never zero.
    Proto(u8),
    /// Source address against any entry in the list (OR semantics).
    SrcIp(Vec<AddrMatch>),
    /// Destination address against any entry in the list.
    DstIp(Vec<AddrMatch>),
    /// Source port against any of the closed ranges.
    SrcPort(Vec<RangeInclusive<u16>>),
    /// Destination port against any of the closed ranges.
    DstPort(Vec<RangeInclusive<u16>>),
    /// Packet is inbound (no output interface).
    In,
    /// Packet is a fragment with non-zero offset.
    Frag,
    /// All of `set` present and none of `clear` present.
    TcpFlags { set: TcpFlags, clear: TcpFlags },
    /// TCP segment belonging to an established connection (RST or ACK
    /// set).
    Established,
    /// ICMP type bitmap; bit N set means type N matches.
    IcmpTypes(u32),
    /// Any of the given IPv6 extension headers present.
    ExtHeader(ExtHeaders),
    /// Received on this interface index.
    RecvIface(u32),
    /// Being transmitted on this interface index.
    XmitIface(u32),
    /// Either received or transmitted on this interface index.
    ViaIface(u32),
    /// Socket owner uid, TCP/UDP non-fragments only.
    Uid(u32),
    /// Socket owner gid, TCP/UDP non-fragments only.
    Gid(u32),
    /// Socket owner jail id, TCP/UDP non-fragments only.
    Jail(u32),
    /// Reverse-path verification through the route collaborator.
    ReversePathOk,
    /// Address table lookup. With an expected `value`, matches when
    /// the table maps the address to that exact value; without one,
    /// any hit matches and the found value is latched as the rule's
    /// table argument.
    Lookup { key: LookupKey, table: u16, value: Option<u32> },
    /// Create a dynamic state entry for this flow on match.
    KeepState,
    /// Like `KeepState`, but cap the number of live conversations
    /// sharing the masked flow key at `ceiling`.
    Limit { mask: LimitMask, ceiling: u16 },
    /// Consult the dynamic state table; on a hit, jump to the parent
    /// rule's action. On a miss, keep evaluating this rule.
    ProbeState,
    /// Always matches; emits a rule-match event to the log sink, at
    /// most `max` times (zero means unlimited).
    Log { max: u32 },
    /// An opcode this engine does not implement. Never installable;
    /// carried so a decoder can represent foreign streams.
    Unsupported { opcode: u8, words: u8 },
}

impl MatchOp {
    /// Encoded size in 32-bit words.
    pub fn words(&self) -> u16 {
        match self {
            Self::Nop
            | Self::Proto(_)
            | Self::In
            | Self::Frag
            | Self::TcpFlags { .. }
            | Self::Established
            | Self::ExtHeader(_)
            | Self::ReversePathOk
            | Self::KeepState
            | Self::ProbeState => 1,
            Self::IcmpTypes(_)
            | Self::RecvIface(_)
            | Self::XmitIface(_)
            | Self::ViaIface(_)
            | Self::Uid(_)
            | Self::Gid(_)
            | Self::Jail(_)
            | Self::Limit { .. }
            | Self::Log { .. } => 2,
            Self::SrcIp(list) | Self::DstIp(list) => {
                1 + list.iter().map(AddrMatch::words).sum::<u16>()
            }
            Self::SrcPort(list) | Self::DstPort(list) => 1 + list.len() as u16,
            Self::Lookup { value, .. } => {
                if value.is_some() { 2 } else { 1 }
            }
            Self::Unsupported { words, .. } => u16::from(*words),
        }
    }
}

impl Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn join<T: Display>(
            f: &mut fmt::Formatter,
            name: &str,
            list: &[T],
        ) -> fmt::Result {
            write!(f, "{} ", name)?;
            let strs: Vec<String> =
                list.iter().map(|x| x.to_string()).collect();
            write!(f, "{}", strs.join(","))
        }

        match self {
            Self::Nop => write!(f, "nop"),
            Self::Proto(p) => write!(f, "proto {}", p),
            Self::SrcIp(list) => join(f, "src-ip", list),
            Self::DstIp(list) => join(f, "dst-ip", list),
            Self::SrcPort(list) => {
                let strs: Vec<String> = list
                    .iter()
                    .map(|r| format!("{}-{}", r.start(), r.end()))
                    .collect();
                write!(f, "src-port {}", strs.join(","))
            }
            Self::DstPort(list) => {
                let strs: Vec<String> = list
                    .iter()
                    .map(|r| format!("{}-{}", r.start(), r.end()))
                    .collect();
                write!(f, "dst-port {}", strs.join(","))
            }
            Self::In => write!(f, "in"),
            Self::Frag => write!(f, "frag"),
            Self::TcpFlags { set, clear } => {
                write!(f, "tcpflags {}/!{}", set, clear)
            }
            Self::Established => write!(f, "established"),
            Self::IcmpTypes(map) => write!(f, "icmptypes {:#x}", map),
            Self::ExtHeader(hdrs) => write!(f, "ext6hdr {:?}", hdrs),
            Self::RecvIface(i) => write!(f, "recv if{}", i),
            Self::XmitIface(i) => write!(f, "xmit if{}", i),
            Self::ViaIface(i) => write!(f, "via if{}", i),
            Self::Uid(u) => write!(f, "uid {}", u),
            Self::Gid(g) => write!(f, "gid {}", g),
            Self::Jail(j) => write!(f, "jail {}", j),
            Self::ReversePathOk => write!(f, "verrevpath"),
            Self::Lookup { key, table, value: Some(v) } => {
                write!(f, "{} lookup table({}) {}", key, table, v)
            }
            Self::Lookup { key, table, value: None } => {
                write!(f, "{} lookup table({})", key, table)
            }
            Self::KeepState => write!(f, "keep-state"),
            Self::Limit { mask, ceiling } => {
                write!(f, "limit {:?} {}", mask, ceiling)
            }
            Self::ProbeState => write!(f, "probe-state"),
            Self::Log { max } => write!(f, "log logamount {}", max),
            Self::Unsupported { opcode, .. } => {
                write!(f, "unsupported({})", opcode)
            }
        }
    }
}

/// A terminal action.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ActionOp {
    Accept,
    Deny,
    /// Deny, and when the packet is eligible, ask the reject
    /// collaborator to send a notice carrying `code`.
    Reject { code: u16 },
    /// Update this rule's counters and continue with the next rule.
    Count,
    /// Continue matching at the first rule numbered `target` or
    /// higher. Forward-only.
    Skipto(u16),
    Divert(u16),
    Tee(u16),
    Pipe(u32),
    Queue(u32),
    /// Pass, routing the packet to the given next hop. An unspecified
    /// address requests substitution of the table argument.
    Forward(SocketAddrV4),
    Netgraph(u32),
    NgTee(u32),
    /// Hand the packet to the NAT collaborator instance.
    Nat(u32),
    /// Queue a fragment for reassembly; non-fragments fall through to
    /// the next rule.
    Reass,
    /// Consult the dynamic state table; on a hit, jump to the parent
    /// rule's action. On a miss, continue with the next rule.
    CheckState,
}

impl ActionOp {
    /// Encoded size in 32-bit words.
    pub fn words(&self) -> u16 {
        match self {
            Self::Accept
            | Self::Deny
            | Self::Count
            | Self::Skipto(_)
            | Self::Divert(_)
            | Self::Tee(_)
            | Self::Reass
            | Self::CheckState => 1,
            Self::Reject { .. }
            | Self::Pipe(_)
            | Self::Queue(_)
            | Self::Netgraph(_)
            | Self::NgTee(_)
            | Self::Nat(_) => 2,
            Self::Forward(_) => 3,
        }
    }
}

impl Display for ActionOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
            Self::Reject { code } => write!(f, "unreach {}", code),
            Self::Count => write!(f, "count"),
            Self::Skipto(t) => write!(f, "skipto {}", t),
            Self::Divert(p) => write!(f, "divert {}", p),
            Self::Tee(p) => write!(f, "tee {}", p),
            Self::Pipe(n) => write!(f, "pipe {}", n),
            Self::Queue(n) => write!(f, "queue {}", n),
            Self::Forward(sa) => write!(f, "fwd {}", sa),
            Self::Netgraph(c) => write!(f, "netgraph {}", c),
            Self::NgTee(c) => write!(f, "ngtee {}", c),
            Self::Nat(n) => write!(f, "nat {}", n),
            Self::Reass => write!(f, "reass"),
            Self::CheckState => write!(f, "check-state"),
        }
    }
}

/// A match instruction: an operation plus its modifier flags.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MatchInsn {
    /// Invert the match result.
    pub negate: bool,
    /// This instruction is a non-final member of an OR block.
    pub or: bool,
    pub op: MatchOp,
}

impl MatchInsn {
    pub fn new(op: MatchOp) -> Self {
        Self { negate: false, or: false, op }
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    pub fn or_chained(mut self) -> Self {
        self.or = true;
        self
    }
}

/// One element of a rule's instruction stream.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Instruction {
    Match(MatchInsn),
    Action(ActionOp),
}

impl Instruction {
    /// Encoded size in 32-bit words.
    pub fn words(&self) -> u16 {
        match self {
            Self::Match(m) => m.op.words(),
            Self::Action(a) => a.words(),
        }
    }
}

impl From<MatchOp> for Instruction {
    fn from(op: MatchOp) -> Self {
        Self::Match(MatchInsn::new(op))
    }
}

impl From<ActionOp> for Instruction {
    fn from(op: ActionOp) -> Self {
        Self::Action(op)
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Match(m) => {
                if m.negate {
                    write!(f, "not ")?;
                }
                write!(f, "{}", m.op)?;
                if m.or {
                    write!(f, " or")?;
                }
                Ok(())
            }
            Self::Action(a) => write!(f, "{}", a),
        }
    }
}

/// A rule as submitted for installation.
///
/// `insn_len` and `act_offset` are declared redundantly with the
/// structured stream, in 32-bit words, and are cross-checked during
/// validation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuleDef {
    /// Requested rule number; zero asks the engine to autonumber.
    pub number: u16,
    /// Rule set, 0..=31.
    pub set: u8,
    pub insns: Vec<Instruction>,
    /// Total encoded length of `insns` in 32-bit words.
    pub insn_len: u16,
    /// Word offset of the terminal action within the stream.
    pub act_offset: u16,
}

impl RuleDef {
    /// Build a definition with the declared lengths computed from the
    /// stream itself.
    pub fn new(number: u16, set: u8, insns: Vec<Instruction>) -> Self {
        let mut insn_len = 0;
        let mut act_offset = 0;
        for insn in &insns {
            if matches!(insn, Instruction::Action(_)) {
                act_offset = insn_len;
            }
            insn_len += insn.words();
        }
        Self { number, set, insns, insn_len, act_offset }
    }
}

impl Display for RuleDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} set {}", self.number, self.set)?;
        for insn in &self.insns {
            write!(f, " {}", insn)?;
        }
        Ok(())
    }
}
