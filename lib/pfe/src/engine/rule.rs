// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rule validation and the installed rule representation.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

use pfe_api::ActionOp;
use pfe_api::DEFAULT_RULE_NUMBER;
use pfe_api::FwConfig;
use pfe_api::Features;
use pfe_api::Instruction;
use pfe_api::MatchInsn;
use pfe_api::MatchOp;
use pfe_api::MAX_OPERANDS;
use pfe_api::RESERVED_SET;
use pfe_api::RuleDef;
use pfe_api::ValidationError;

/// Check a submitted definition against the engine's invariants and
/// this instance's feature set. Nothing is mutated on failure.
pub fn validate(def: &RuleDef, cfg: &FwConfig) -> Result<(), ValidationError> {
    if def.insns.is_empty() {
        return Err(ValidationError::TooShort);
    }
    if def.set > RESERVED_SET {
        return Err(ValidationError::InvalidSetSize(def.set));
    }
    if def.number >= DEFAULT_RULE_NUMBER {
        return Err(ValidationError::BadRuleNumber(def.number));
    }

    let actual: u16 = def.insns.iter().map(Instruction::words).sum();
    if actual != def.insn_len {
        return Err(ValidationError::SizeMismatch {
            declared: def.insn_len,
            actual,
        });
    }
    if def.act_offset >= def.insn_len {
        return Err(ValidationError::ActionOffsetOutOfRange {
            offset: def.act_offset,
            len: def.insn_len,
        });
    }

    let mut offset = 0u16;
    let mut action: Option<(usize, u16, &ActionOp)> = None;
    for (i, insn) in def.insns.iter().enumerate() {
        match insn {
            Instruction::Action(a) => {
                if action.is_some() {
                    return Err(ValidationError::MultipleActions);
                }
                action = Some((i, offset, a));
            }
            Instruction::Match(m) => check_match(m, cfg)?,
        }
        offset += insn.words();
    }

    let Some((idx, act_offset, act)) = action else {
        return Err(ValidationError::TooShort);
    };
    if idx != def.insns.len() - 1 {
        return Err(ValidationError::ActionNotLast);
    }
    if act_offset != def.act_offset {
        return Err(ValidationError::ActionOffsetOutOfRange {
            offset: def.act_offset,
            len: def.insn_len,
        });
    }
    // An OR member must be followed by another match instruction; a
    // block that runs into the action would fall through to it whether
    // or not the block matched.
    if idx > 0
        && let Instruction::Match(m) = &def.insns[idx - 1]
        && m.or
    {
        return Err(bad("dangling or-block"));
    }
    check_action(act, cfg)
}

fn bad(what: &str) -> ValidationError {
    ValidationError::WrongOperandSize(what.into())
}

fn check_match(m: &MatchInsn, cfg: &FwConfig) -> Result<(), ValidationError> {
    // Negating a side-effecting instruction has no coherent meaning.
    if m.negate
        && matches!(
            m.op,
            MatchOp::KeepState
                | MatchOp::Limit { .. }
                | MatchOp::ProbeState
                | MatchOp::Log { .. }
        )
    {
        return Err(bad("negated state/log instruction"));
    }

    match &m.op {
        MatchOp::Proto(0) => Err(bad("proto 0")),
        MatchOp::SrcIp(list) | MatchOp::DstIp(list) => {
            if list.is_empty() || list.len() > MAX_OPERANDS {
                return Err(bad("address list"));
            }
            if !cfg.features.contains(Features::IPV6)
                && list.iter().any(|a| a.is_ipv6())
            {
                return Err(ValidationError::UnsupportedFeature(
                    "ipv6".into(),
                ));
            }
            Ok(())
        }
        MatchOp::SrcPort(list) | MatchOp::DstPort(list) => {
            if list.is_empty() || list.len() > MAX_OPERANDS {
                return Err(bad("port list"));
            }
            if list.iter().any(|r| r.is_empty()) {
                return Err(bad("empty port range"));
            }
            Ok(())
        }
        MatchOp::ExtHeader(_) if !cfg.features.contains(Features::IPV6) => {
            Err(ValidationError::UnsupportedFeature("ipv6".into()))
        }
        MatchOp::Lookup { table, .. } => {
            if *table >= cfg.tables {
                Err(ValidationError::InvalidTableId(*table))
            } else {
                Ok(())
            }
        }
        MatchOp::Limit { mask, ceiling } => {
            if mask.is_empty() || *ceiling == 0 {
                Err(bad("limit"))
            } else {
                Ok(())
            }
        }
        MatchOp::Unsupported { opcode, .. } => {
            Err(ValidationError::UnknownOpcode(*opcode))
        }
        _ => Ok(()),
    }
}

fn check_action(act: &ActionOp, cfg: &FwConfig) -> Result<(), ValidationError> {
    let feature = |flag: Features, name: &str| {
        if cfg.features.contains(flag) {
            Ok(())
        } else {
            Err(ValidationError::UnsupportedFeature(name.into()))
        }
    };

    match act {
        ActionOp::Nat(_) => feature(Features::NAT, "nat"),
        ActionOp::Divert(_) | ActionOp::Tee(_) => {
            feature(Features::DIVERT, "divert")
        }
        ActionOp::Pipe(_) | ActionOp::Queue(_) => {
            feature(Features::DUMMYNET, "dummynet")
        }
        ActionOp::Netgraph(_) | ActionOp::NgTee(_) => {
            feature(Features::NETGRAPH, "netgraph")
        }
        ActionOp::Forward(_) => feature(Features::FORWARD, "forward"),
        ActionOp::Skipto(0) => Err(bad("skipto 0")),
        _ => Ok(()),
    }
}

/// An installed rule. Counters are atomics so the data path can bump
/// them under the chain's read lock.
#[derive(Debug)]
pub struct Rule {
    id: u64,
    number: u16,
    set: AtomicU8,
    insns: Vec<Instruction>,
    act_index: usize,
    pcnt: AtomicU64,
    bcnt: AtomicU64,
    last_match_ms: AtomicU64,
    /// Log emissions left before the cap; `u32::MAX` means unlimited.
    log_left: AtomicU32,
    log_max: u32,
}

/// Field-wise equality for test assertions; atomics compare by their
/// current values. (A derive can't do this because the atomic types
/// don't implement `PartialEq`.)
#[cfg(test)]
impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.number == other.number
            && self.set.load(Relaxed) == other.set.load(Relaxed)
            && self.insns == other.insns
            && self.act_index == other.act_index
            && self.pcnt.load(Relaxed) == other.pcnt.load(Relaxed)
            && self.bcnt.load(Relaxed) == other.bcnt.load(Relaxed)
            && self.last_match_ms.load(Relaxed)
                == other.last_match_ms.load(Relaxed)
            && self.log_left.load(Relaxed) == other.log_left.load(Relaxed)
            && self.log_max == other.log_max
    }
}

impl Rule {
    /// Turn a validated definition into an installed rule.
    ///
    /// A rule that keeps state but never consults it would only ever
    /// see the forward direction, so a `ProbeState` is prepended
    /// unless the stream already starts the state machinery itself.
    pub(crate) fn build(def: RuleDef, number: u16, id: u64) -> Self {
        let mut insns = def.insns;

        let keeps_state = insns.iter().any(|i| {
            matches!(
                i,
                Instruction::Match(MatchInsn {
                    op: MatchOp::KeepState | MatchOp::Limit { .. },
                    ..
                })
            )
        });
        let probes_state = insns.iter().any(|i| {
            matches!(
                i,
                Instruction::Match(MatchInsn {
                    op: MatchOp::ProbeState,
                    ..
                }) | Instruction::Action(ActionOp::CheckState)
            )
        });
        if keeps_state && !probes_state {
            insns.insert(0, MatchOp::ProbeState.into());
        }

        let act_index = insns.len() - 1;

        let log_max = insns
            .iter()
            .find_map(|i| match i {
                Instruction::Match(MatchInsn {
                    op: MatchOp::Log { max },
                    ..
                }) => Some(*max),
                _ => None,
            })
            .unwrap_or(0);
        let log_left = if log_max == 0 { u32::MAX } else { log_max };

        Self {
            id,
            number,
            set: AtomicU8::new(def.set),
            insns,
            act_index,
            pcnt: AtomicU64::new(0),
            bcnt: AtomicU64::new(0),
            last_match_ms: AtomicU64::new(0),
            log_left: AtomicU32::new(log_left),
            log_max,
        }
    }

    /// The immutable, always-matching rule at the end of every chain.
    pub(crate) fn default_rule(accept: bool, id: u64) -> Self {
        let action =
            if accept { ActionOp::Accept } else { ActionOp::Deny };
        let def = RuleDef::new(0, RESERVED_SET, vec![action.into()]);
        Self::build(def, DEFAULT_RULE_NUMBER, id)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn set(&self) -> u8 {
        self.set.load(Relaxed)
    }

    pub(crate) fn move_to_set(&self, set: u8) {
        self.set.store(set, Relaxed);
    }

    pub fn insns(&self) -> &[Instruction] {
        &self.insns
    }

    pub(crate) fn act_index(&self) -> usize {
        self.act_index
    }

    pub fn action(&self) -> &ActionOp {
        match &self.insns[self.act_index] {
            Instruction::Action(a) => a,
            // build() guarantees the last instruction is the action.
            Instruction::Match(_) => unreachable!(),
        }
    }

    pub(crate) fn bump(&self, bytes: u64, now_ms: u64) {
        self.pcnt.fetch_add(1, Relaxed);
        self.bcnt.fetch_add(bytes, Relaxed);
        self.last_match_ms.store(now_ms, Relaxed);
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.pcnt.load(Relaxed),
            self.bcnt.load(Relaxed),
            self.last_match_ms.load(Relaxed),
        )
    }

    /// Take one unit of log budget. Returns whether the event should
    /// be emitted.
    pub(crate) fn log_take(&self) -> bool {
        if self.log_max == 0 {
            return true;
        }
        self.log_left
            .fetch_update(Relaxed, Relaxed, |left| left.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn zero(&self, log_only: bool) {
        if !log_only {
            self.pcnt.store(0, Relaxed);
            self.bcnt.store(0, Relaxed);
            self.last_match_ms.store(0, Relaxed);
        }
        let left = if self.log_max == 0 { u32::MAX } else { self.log_max };
        self.log_left.store(left, Relaxed);
    }
}
