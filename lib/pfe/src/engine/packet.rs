// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The packet descriptor: everything the interpreter may ask about a
//! packet, extracted once by the caller's parser.

use std::net::Ipv4Addr;

use pfe_api::Direction;
use pfe_api::ExtHeaders;
use pfe_api::FlowId;
use pfe_api::Protocol;
use pfe_api::RuleRef;
use pfe_api::TcpFlags;

/// A parsed packet as the engine sees it. The engine never inspects
/// raw bytes; whoever builds one of these owns header parsing.
///
/// `resume` and `divert_cookie` carry re-entry state for packets that
/// already traversed the chain once and came back from an external
/// facility (shaper, divert socket).
#[derive(Clone, Debug)]
pub struct PacketDescriptor {
    pub flow: FlowId,
    pub tcp_flags: TcpFlags,
    pub icmp_type: Option<u8>,
    /// Fragment offset in 8-byte units; non-zero means the transport
    /// header is absent.
    pub frag_offset: u16,
    /// The more-fragments flag (IPv4) or a fragment extension header
    /// with more to come (IPv6).
    pub more_frags: bool,
    /// Total IP length, used for byte counters.
    pub ip_len: u16,
    pub ext_headers: ExtHeaders,
    pub iface_in: Option<u32>,
    pub iface_out: Option<u32>,
    /// Handle of the rule that matched on a previous traversal.
    pub resume: Option<RuleRef>,
    /// Rule number a re-injected diverted packet should resume after.
    pub divert_cookie: Option<u16>,
}

impl PacketDescriptor {
    pub fn new(flow: FlowId) -> Self {
        Self {
            flow,
            tcp_flags: TcpFlags::empty(),
            icmp_type: None,
            frag_offset: 0,
            more_frags: false,
            ip_len: 40,
            ext_headers: ExtHeaders::empty(),
            iface_in: None,
            iface_out: None,
            resume: None,
            divert_cookie: None,
        }
    }

    pub fn tcp(
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        Self::new(FlowId::tcp(src, src_port, dst, dst_port))
    }

    pub fn udp(
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        Self::new(FlowId::udp(src, src_port, dst, dst_port))
    }

    pub fn icmp(src: Ipv4Addr, dst: Ipv4Addr, icmp_type: u8) -> Self {
        let mut pkt = Self::new(FlowId::icmp(src, dst));
        pkt.icmp_type = Some(icmp_type);
        pkt
    }

    pub fn inbound(mut self, iface: u32) -> Self {
        self.iface_in = Some(iface);
        self.iface_out = None;
        self
    }

    pub fn outbound(mut self, iface: u32) -> Self {
        self.iface_out = Some(iface);
        self
    }

    pub fn with_flags(mut self, flags: TcpFlags) -> Self {
        self.tcp_flags = flags;
        self
    }

    pub fn with_len(mut self, ip_len: u16) -> Self {
        self.ip_len = ip_len;
        self
    }

    pub fn fragment(mut self, offset: u16, more: bool) -> Self {
        self.frag_offset = offset;
        self.more_frags = more;
        self
    }

    pub fn resuming(mut self, handle: RuleRef) -> Self {
        self.resume = Some(handle);
        self
    }

    pub fn direction(&self) -> Direction {
        if self.iface_out.is_some() { Direction::Out } else { Direction::In }
    }

    pub fn is_fragment(&self) -> bool {
        self.frag_offset != 0 || self.more_frags
    }

    /// Port comparisons only make sense on an unfragmented TCP/UDP
    /// packet; everything else reports ports as absent.
    pub fn has_ports(&self) -> bool {
        self.frag_offset == 0 && self.flow.proto.has_ports()
    }

    pub fn proto(&self) -> Protocol {
        self.flow.proto
    }
}
