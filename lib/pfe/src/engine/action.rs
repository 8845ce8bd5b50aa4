// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seams between the engine and the rest of the system.
//!
//! Everything the engine cannot decide from the descriptor alone is
//! asked of a collaborator trait: socket credentials, route
//! reachability, NAT, reassembly, reject notices, and diagnostics.
//! A classification call carries one [`ClassifyCtx`] naming whichever
//! collaborators the caller has; an absent collaborator degrades the
//! affected actions to deny.

use std::net::IpAddr;

use pfe_api::ActionOp;
use pfe_api::Direction;
use pfe_api::FlowId;
use pfe_api::Protocol;
use pfe_api::Verdict;

use super::packet::PacketDescriptor;

/// Socket credentials for a flow endpoint on this host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    pub jail_id: u32,
}

/// Resolves the local socket owning a flow, if any.
pub trait CredResolver {
    fn resolve(&self, flow: &FlowId, dir: Direction) -> Option<Credential>;
}

/// Answers reverse-path questions for source verification.
pub trait RouteCheck {
    /// Would a packet addressed to `src` leave through `iface_in`?
    fn reverse_path_ok(&self, src: IpAddr, iface_in: Option<u32>) -> bool;
}

/// Translates a packet through a NAT instance and reports what became
/// of it.
pub trait NatHandler {
    fn translate(&self, instance: u32, pkt: &PacketDescriptor) -> Verdict;
}

/// Queues fragments for reassembly.
pub trait ReassHandler {
    fn queue_fragment(&self, pkt: &PacketDescriptor) -> Verdict;
}

/// Sends the unreachable/reset notice a reject action asks for.
pub trait RejectNotifier {
    fn notify(&self, pkt: &PacketDescriptor, code: u16);
}

/// A diagnostic event out of the data path.
#[derive(Debug)]
pub enum Event<'a> {
    /// A rule with a log instruction matched a packet.
    RuleMatch { number: u16, flow: &'a FlowId, action: &'a ActionOp },
    /// A keep-state or limit instruction could not install its entry;
    /// the packet was denied.
    StateInstallFailed { number: u16, flow: &'a FlowId, reason: &'static str },
    /// A dynamic entry pointed at a rule the chain no longer holds.
    StateJumpBroken { parent_number: u16 },
    /// An action asked for the table argument but no lookup produced
    /// one; the packet was denied.
    TableArgMissing { number: u16 },
    /// The walk ran off the end of the chain; the packet was denied.
    RulesExhausted { flow: &'a FlowId },
}

/// Where diagnostic events go. The one collaborator every
/// classification carries.
pub trait LogSink {
    fn event(&self, event: Event<'_>);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn event(&self, _event: Event<'_>) {}
}

static NULL_SINK: NullSink = NullSink;

/// The collaborators available to one classification call.
#[derive(Clone, Copy)]
pub struct ClassifyCtx<'a> {
    pub creds: Option<&'a dyn CredResolver>,
    pub routes: Option<&'a dyn RouteCheck>,
    pub nat: Option<&'a dyn NatHandler>,
    pub reass: Option<&'a dyn ReassHandler>,
    pub reject: Option<&'a dyn RejectNotifier>,
    pub log: &'a dyn LogSink,
}

impl<'a> ClassifyCtx<'a> {
    pub fn new(log: &'a dyn LogSink) -> Self {
        Self {
            creds: None,
            routes: None,
            nat: None,
            reass: None,
            reject: None,
            log,
        }
    }

    /// A context with no collaborators at all.
    pub fn null() -> ClassifyCtx<'static> {
        ClassifyCtx::new(&NULL_SINK)
    }

    pub fn with_creds(mut self, creds: &'a dyn CredResolver) -> Self {
        self.creds = Some(creds);
        self
    }

    pub fn with_routes(mut self, routes: &'a dyn RouteCheck) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn with_nat(mut self, nat: &'a dyn NatHandler) -> Self {
        self.nat = Some(nat);
        self
    }

    pub fn with_reass(mut self, reass: &'a dyn ReassHandler) -> Self {
        self.reass = Some(reass);
        self
    }

    pub fn with_reject(mut self, reject: &'a dyn RejectNotifier) -> Self {
        self.reject = Some(reject);
        self
    }
}

/// ICMP types that are queries rather than errors. Reject never
/// answers an error with another notice.
fn is_icmp_query(ty: u8) -> bool {
    matches!(ty, 0 | 8 | 9 | 10 | 13 | 14 | 15 | 16 | 17 | 18)
}

/// Whether a reject action may send a notice for this packet. The
/// packet is consumed either way; this only gates the courtesy reply.
pub fn reject_notice_allowed(pkt: &PacketDescriptor) -> bool {
    if pkt.is_fragment() {
        return false;
    }
    if pkt.proto() == Protocol::ICMP
        && pkt.icmp_type.is_some_and(|ty| !is_icmp_query(ty))
    {
        return false;
    }
    match pkt.flow.dst_ip {
        IpAddr::V4(v4) => !v4.is_multicast() && !v4.is_broadcast(),
        IpAddr::V6(v6) => !v6.is_multicast(),
    }
}
