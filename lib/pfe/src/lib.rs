// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PFE, a packet filter decision engine.
//!
//! PFE classifies already-parsed packets against an ordered chain of
//! rules, each rule an instruction stream of match predicates plus one
//! terminal action. It keeps dynamic (stateful) entries for flows that
//! rules asked to track, and longest-prefix address tables rules can
//! consult. It never touches raw packet bytes and never sits on a
//! wire: the caller parses packets into descriptors, hands them to
//! [`engine::firewall::Firewall::classify`], and acts on the verdict.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod engine;
pub mod log;

pub use pfe_api as api;
