// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flow identifiers and the small IP-level types that ride along with
//! them.

use core::fmt;
use core::fmt::Display;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;

/// An IP protocol number.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Protocol(pub u8);

impl Protocol {
    pub const ICMP: Self = Self(1);
    pub const IGMP: Self = Self(2);
    pub const TCP: Self = Self(6);
    pub const UDP: Self = Self(17);
    pub const ICMPV6: Self = Self(58);

    /// Does this protocol carry port numbers the engine understands?
    pub fn has_ports(self) -> bool {
        self == Self::TCP || self == Self::UDP
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::ICMP => write!(f, "ICMP"),
            Self::IGMP => write!(f, "IGMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::ICMPV6 => write!(f, "ICMPv6"),
            Self(n) => write!(f, "proto-{}", n),
        }
    }
}

bitflags! {
    /// TCP header flags relevant to classification.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

impl Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 6] = [
            (TcpFlags::FIN, "F"),
            (TcpFlags::SYN, "S"),
            (TcpFlags::RST, "R"),
            (TcpFlags::PSH, "P"),
            (TcpFlags::ACK, "A"),
            (TcpFlags::URG, "U"),
        ];
        for (flag, name) in NAMES {
            if self.contains(flag) {
                write!(f, "{}", name)?;
            }
        }
        Ok(())
    }
}

bitflags! {
    /// IPv6 extension headers observed while the caller parsed the
    /// packet.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct ExtHeaders: u16 {
        const FRAGMENT = 0x0001;
        const HOPOPTS = 0x0002;
        const ROUTING = 0x0004;
        const AH = 0x0008;
        const ESP = 0x0010;
        const DSTOPTS = 0x0020;
        const UNKNOWN = 0x8000;
    }
}

/// The 5-tuple identifying a flow. Ports are in host byte order and
/// zero for protocols that do not carry them.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct FlowId {
    pub proto: Protocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowId {
    pub fn new(
        proto: Protocol,
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
    ) -> Self {
        Self { proto, src_ip, dst_ip, src_port, dst_port }
    }

    pub fn tcp(
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        Self::new(Protocol::TCP, src_ip.into(), src_port, dst_ip.into(), dst_port)
    }

    pub fn udp(
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        Self::new(Protocol::UDP, src_ip.into(), src_port, dst_ip.into(), dst_port)
    }

    pub fn icmp(src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Self {
        Self::new(Protocol::ICMP, src_ip.into(), 0, dst_ip.into(), 0)
    }

    /// The same flow viewed from the other side.
    pub fn mirror(&self) -> Self {
        Self {
            proto: self.proto,
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.src_ip.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.src_ip.is_ipv6()
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.proto, self.src_ip, self.src_port, self.dst_ip, self.dst_port,
        )
    }
}

/// The unspecified IPv6 address, used as the v6 analogue of
/// `Ipv4Addr::UNSPECIFIED` in placeholder positions.
pub const ANY_ADDR6: Ipv6Addr = Ipv6Addr::UNSPECIFIED;
