// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine configuration.

use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;

bitflags! {
    /// Optional action families an engine instance supports. Rules
    /// naming an action whose family is absent are refused at
    /// installation.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
    pub struct Features: u32 {
        const IPV6 = 0x01;
        const NAT = 0x02;
        const DIVERT = 0x04;
        const DUMMYNET = 0x08;
        const NETGRAPH = 0x10;
        const FORWARD = 0x20;
    }
}

impl Default for Features {
    fn default() -> Self {
        Self::all()
    }
}

/// Dynamic state entry lifetimes, in seconds, by traffic class.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DynLifetimes {
    /// Established TCP (both directions have seen SYN).
    pub ack: u32,
    /// Embryonic TCP.
    pub syn: u32,
    /// TCP after a FIN exchange.
    pub fin: u32,
    /// TCP after an RST.
    pub rst: u32,
    pub udp: u32,
    /// Everything else.
    pub short: u32,
}

impl Default for DynLifetimes {
    fn default() -> Self {
        Self { ack: 300, syn: 20, fin: 1, rst: 1, udp: 10, short: 5 }
    }
}

/// The tunables of one engine instance. All fields have conventional
/// defaults; a `Firewall` is built from a name plus one of these.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FwConfig {
    /// Whether the immutable default rule accepts rather than denies.
    pub default_to_accept: bool,
    /// Autonumber spacing for rules submitted with number zero.
    /// Clamped to 1..=1000.
    pub autoinc_step: u16,
    /// Number of address lookup tables.
    pub tables: u16,
    /// Dynamic state hash bucket count; rounded up to a power of two.
    pub dyn_buckets: usize,
    /// Maximum live dynamic state entries.
    pub dyn_max: u32,
    pub lifetimes: DynLifetimes,
    /// When set, a packet presenting a resume handle passes without
    /// re-walking the chain.
    pub one_pass: bool,
    pub features: Features,
}

impl Default for FwConfig {
    fn default() -> Self {
        Self {
            default_to_accept: false,
            autoinc_step: 100,
            tables: 128,
            dyn_buckets: 256,
            dyn_max: 4096,
            lifetimes: DynLifetimes::default(),
            one_pass: false,
            features: Features::default(),
        }
    }
}
