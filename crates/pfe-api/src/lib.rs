// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plain-data API types shared by the packet filter engine and its
//! control plane.
//!
//! Everything in this crate is inert data: instructions, rule
//! definitions, verdicts, errors, and dump/snapshot shapes. The engine
//! itself lives in the `pfe` crate.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use std::net::SocketAddrV4;

use serde::Deserialize;
use serde::Serialize;

pub mod cmd;
pub mod config;
pub mod ip;
pub mod rule;

pub use cmd::*;
pub use config::*;
pub use ip::*;
pub use rule::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified, this number should increment. It
/// carries no semantic meaning other than as a means to verify that
/// two sides of a snapshot exchange were compiled against the same
/// API.
pub const API_VERSION: u64 = 3;

/// The direction a packet is traveling relative to the host: `In`
/// means the packet arrived on an interface, `Out` means it is about
/// to leave through one.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Direction {
    In = 1,
    Out = 2,
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            _ => Err(format!("invalid direction: {}", s)),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };

        write!(f, "{}", dirstr)
    }
}

/// The final disposition of a classified packet.
///
/// `Pass` and `Deny` are the two self-contained outcomes. The
/// remaining variants hand the packet to an external facility along
/// with that facility's argument (divert port, dummynet pipe/queue
/// number, netgraph cookie). `Reassembled` means a fragment was
/// consumed by the reassembly collaborator.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Verdict {
    Pass,
    Deny,
    Divert(u16),
    Tee(u16),
    Dummynet { id: u32, is_pipe: bool },
    Netgraph(u32),
    NgTee(u32),
    Reassembled,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Deny => write!(f, "deny"),
            Verdict::Divert(p) => write!(f, "divert {}", p),
            Verdict::Tee(p) => write!(f, "tee {}", p),
            Verdict::Dummynet { id, is_pipe: true } => {
                write!(f, "pipe {}", id)
            }
            Verdict::Dummynet { id, is_pipe: false } => {
                write!(f, "queue {}", id)
            }
            Verdict::Netgraph(c) => write!(f, "netgraph {}", c),
            Verdict::NgTee(c) => write!(f, "ngtee {}", c),
            Verdict::Reassembled => write!(f, "reass"),
        }
    }
}

/// A handle to a rule as it existed at a particular chain generation.
///
/// The handle never encodes a position: a re-entrant classification
/// re-resolves it by id, so a mutated chain can invalidate the handle
/// but never misdirect it. The generation stamp records when the
/// handle was minted, letting a caller compare it against the current
/// generation to detect that the chain changed underneath it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuleRef {
    /// The rule's user-visible number.
    pub number: u16,
    /// The rule's unique id, never reused within a chain.
    pub id: u64,
    /// The chain generation this handle was minted under.
    pub generation: u64,
}

/// The outcome of classifying one packet.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClassifyResult {
    pub verdict: Verdict,
    /// Set by a forward action: the next hop the caller should route
    /// the packet to instead of its destination address.
    pub next_hop: Option<SocketAddrV4>,
    /// The rule that produced the verdict, if any rule did. `None`
    /// only for fail-closed denials issued by the engine itself.
    pub matched: Option<RuleRef>,
}

impl ClassifyResult {
    pub fn is_pass(&self) -> bool {
        matches!(self.verdict, Verdict::Pass)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self.verdict, Verdict::Deny)
    }
}
