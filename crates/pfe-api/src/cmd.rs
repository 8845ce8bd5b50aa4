// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-plane commands, errors, and dump shapes.

use std::net::Ipv4Addr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::ip::FlowId;
use crate::rule::Instruction;

/// A rule deletion or set-manipulation command. One command, several
/// selectors, mirroring the classic firewall control interface.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DelCmd {
    /// Delete every rule with this number.
    Number(u16),
    /// Delete every rule in this set.
    Set(u8),
    /// Move all rules with this number into a new set.
    MoveRuleToSet { number: u16, set: u8 },
    /// Move every rule in `old_set` into `new_set`.
    MoveSetToSet { old_set: u8, new_set: u8 },
    /// Exchange the members of two sets.
    SwapSets { a: u8, b: u8 },
    /// Delete rules matching both number and set.
    NumberInSet { number: u16, set: u8 },
}

/// A counter-reset request. `number`/`set` narrow the target; both
/// `None` means every rule. With `log_only` only the remaining log
/// budget is replenished and packet/byte counters are left alone.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ZeroReq {
    pub number: Option<u16>,
    pub set: Option<u8>,
    pub log_only: bool,
}

/// Why a rule definition was refused. Validation is atomic: a refused
/// rule leaves the chain untouched.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum ValidationError {
    #[error("instruction stream empty or missing its action")]
    TooShort,

    #[error("declared {declared} words but stream encodes {actual}")]
    SizeMismatch { declared: u16, actual: u16 },

    #[error("action offset {offset} out of range for length {len}")]
    ActionOffsetOutOfRange { offset: u16, len: u16 },

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("bad operand for {0}")]
    WrongOperandSize(String),

    #[error("more than one terminal action")]
    MultipleActions,

    #[error("terminal action is not the last instruction")]
    ActionNotLast,

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("invalid table id {0}")]
    InvalidTableId(u16),

    #[error("invalid rule set {0}")]
    InvalidSetSize(u8),

    #[error("invalid rule number {0}")]
    BadRuleNumber(u16),
}

/// The error type for all control-plane operations. Data-path
/// failures never surface here; they become deny verdicts plus a
/// diagnostic event.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum PfeError {
    #[error("rule rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("rule {0} not found")]
    RuleNotFound(u16),

    #[error("entry already exists")]
    Exists,

    #[error("entry not found")]
    NotFound,

    #[error("invalid table id {0}")]
    InvalidTableId(u16),

    #[error("set {0} is reserved")]
    ReservedSet(u8),

    #[error("response buffer too small: needed {needed}, given {given}")]
    RespTooLarge { needed: usize, given: usize },

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// One rule as reported by a snapshot.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuleDump {
    pub number: u16,
    pub set: u8,
    /// Packets attributed to this rule.
    pub pcnt: u64,
    /// Bytes attributed to this rule.
    pub bcnt: u64,
    /// Milliseconds since engine start at the last match; zero if the
    /// rule never matched.
    pub last_match_ms: u64,
    /// The rule's effective instruction stream.
    pub insns: Vec<Instruction>,
}

/// What kind of state rule created a dynamic entry.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DynEntryKind {
    KeepState,
    Limit,
}

/// One dynamic state entry as reported by a snapshot.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DynEntryDump {
    pub flow: FlowId,
    /// The number of the rule that installed the entry.
    pub parent_number: u16,
    pub kind: DynEntryKind,
    pub pcnt: u64,
    pub bcnt: u64,
    /// Milliseconds until the entry expires, measured at dump time.
    pub expires_ms: u64,
}

/// The full control-plane view of an engine instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RulesetSnapshot {
    pub generation: u64,
    /// Bitmask of disabled sets.
    pub set_disable: u32,
    pub rules: Vec<RuleDump>,
    pub dyn_entries: Vec<DynEntryDump>,
}

/// One address table entry as reported by a table dump.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TableEntryDump {
    pub addr: Ipv4Addr,
    pub masklen: u8,
    pub value: u32,
}
