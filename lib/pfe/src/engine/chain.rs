// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The rule chain: an ordered, generation-stamped list of installed
//! rules ending in the immutable default rule.

use std::sync::Arc;

use pfe_api::DEFAULT_RULE_NUMBER;
use pfe_api::DelCmd;
use pfe_api::FwConfig;
use pfe_api::PfeError;
use pfe_api::RESERVED_SET;
use pfe_api::RuleDef;
use pfe_api::RuleRef;
use pfe_api::ZeroReq;

use super::rule::Rule;

/// Rules sorted by number (ascending, stable on ties), with the
/// default rule pinned at the end. Every mutation bumps `generation`,
/// so a caller can tell that any position it cached is stale; resume
/// handles themselves are re-resolved by rule id, never by position.
#[derive(Debug)]
pub struct RuleChain {
    rules: Vec<Arc<Rule>>,
    set_disable: u32,
    generation: u64,
    next_id: u64,
    autoinc_step: u16,
}

impl RuleChain {
    pub fn new(cfg: &FwConfig) -> Self {
        let default = Arc::new(Rule::default_rule(cfg.default_to_accept, 0));
        Self {
            rules: vec![default],
            set_disable: 0,
            generation: 1,
            next_id: 1,
            autoinc_step: cfg.autoinc_step.clamp(1, 1000),
        }
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_disable_mask(&self) -> u32 {
        self.set_disable
    }

    /// The reserved set is never disabled.
    pub fn set_disabled(&self, set: u8) -> bool {
        set != RESERVED_SET && (self.set_disable >> set) & 1 == 1
    }

    fn bump_generation(&mut self) {
        self.generation += 1;
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Install a validated definition, autonumbering if requested.
    /// Returns the number the rule landed on.
    pub fn add(&mut self, def: RuleDef) -> Result<u16, PfeError> {
        let number = if def.number != 0 {
            def.number
        } else {
            // Autonumber: step past the highest non-default number,
            // saturating just below the default rule.
            let last = self
                .rules
                .iter()
                .rev()
                .find(|r| r.number() != DEFAULT_RULE_NUMBER)
                .map(|r| r.number())
                .unwrap_or(0);
            let stepped = u32::from(last) + u32::from(self.autoinc_step);
            if stepped < u32::from(DEFAULT_RULE_NUMBER) - 1 {
                stepped as u16
            } else {
                last.max(1)
            }
        };

        let id = self.take_id();
        let rule = Arc::new(Rule::build(def, number, id));
        // After existing rules with the same number, before anything
        // greater. The default rule's number exceeds every legal one.
        let pos = self.rules.partition_point(|r| r.number() <= number);
        self.rules.insert(pos, rule);
        self.bump_generation();
        Ok(number)
    }

    /// Delete and set-manipulation commands. Returns the removed
    /// rules (for dynamic-state cascade) and how many rules the
    /// command touched.
    pub fn delete(
        &mut self,
        cmd: DelCmd,
    ) -> Result<(Vec<Arc<Rule>>, usize), PfeError> {
        let touched;
        let mut removed = Vec::new();

        match cmd {
            DelCmd::Number(number) => {
                check_number(number)?;
                removed = self.remove_where(|r| r.number() == number);
                if removed.is_empty() {
                    return Err(PfeError::RuleNotFound(number));
                }
                touched = removed.len();
            }
            DelCmd::Set(set) => {
                check_set(set)?;
                removed = self.remove_where(|r| r.set() == set);
                touched = removed.len();
            }
            DelCmd::NumberInSet { number, set } => {
                check_number(number)?;
                check_set(set)?;
                removed = self
                    .remove_where(|r| r.number() == number && r.set() == set);
                if removed.is_empty() {
                    return Err(PfeError::RuleNotFound(number));
                }
                touched = removed.len();
            }
            DelCmd::MoveRuleToSet { number, set } => {
                check_number(number)?;
                check_set(set)?;
                let targets: Vec<_> = self
                    .rules
                    .iter()
                    .filter(|r| r.number() == number)
                    .collect();
                if targets.is_empty() {
                    return Err(PfeError::RuleNotFound(number));
                }
                touched = targets.len();
                for r in targets {
                    r.move_to_set(set);
                }
            }
            DelCmd::MoveSetToSet { old_set, new_set } => {
                check_set(old_set)?;
                check_set(new_set)?;
                touched = self.retag(|s| if s == old_set { new_set } else { s });
            }
            DelCmd::SwapSets { a, b } => {
                check_set(a)?;
                check_set(b)?;
                touched = self.retag(|s| {
                    if s == a {
                        b
                    } else if s == b {
                        a
                    } else {
                        s
                    }
                });
            }
        }

        self.bump_generation();
        Ok((removed, touched))
    }

    fn remove_where<F: Fn(&Rule) -> bool>(&mut self, pred: F) -> Vec<Arc<Rule>> {
        let mut removed = Vec::new();
        self.rules.retain(|r| {
            if r.number() != DEFAULT_RULE_NUMBER && pred(r) {
                removed.push(Arc::clone(r));
                false
            } else {
                true
            }
        });
        removed
    }

    fn retag<F: Fn(u8) -> u8>(&mut self, f: F) -> usize {
        let mut touched = 0;
        for r in &self.rules {
            if r.number() == DEFAULT_RULE_NUMBER {
                continue;
            }
            let new = f(r.set());
            if new != r.set() {
                r.move_to_set(new);
                touched += 1;
            }
        }
        touched
    }

    /// Remove every rule, sparing the reserved set (which includes
    /// the default rule) unless `kill_default` asks for teardown.
    pub fn flush(&mut self, kill_default: bool) -> Vec<Arc<Rule>> {
        let mut removed = Vec::new();
        self.rules.retain(|r| {
            if !kill_default && r.set() == RESERVED_SET {
                true
            } else {
                removed.push(Arc::clone(r));
                false
            }
        });
        self.bump_generation();
        removed
    }

    /// Reset counters on the selected rules. Counters are atomic, so
    /// no write access to the chain structure is needed.
    pub fn zero(&self, req: &ZeroReq) -> Result<usize, PfeError> {
        let mut touched = 0;
        for r in &self.rules {
            if let Some(number) = req.number
                && r.number() != number
            {
                continue;
            }
            if let Some(set) = req.set
                && r.set() != set
            {
                continue;
            }
            r.zero(req.log_only);
            touched += 1;
        }
        if touched == 0
            && let Some(number) = req.number
        {
            return Err(PfeError::RuleNotFound(number));
        }
        Ok(touched)
    }

    /// Atomically enable and disable sets. The reserved set's bit is
    /// silently ignored.
    pub fn set_enable(&mut self, enable: u32, disable: u32) {
        self.set_disable =
            (self.set_disable | disable) & !enable & !(1 << RESERVED_SET);
        self.bump_generation();
    }

    /// Position of a rule by (number, id); `None` if it is gone.
    pub fn index_of(&self, number: u16, id: u64) -> Option<usize> {
        let start = self.rules.partition_point(|r| r.number() < number);
        self.rules[start..]
            .iter()
            .take_while(|r| r.number() == number)
            .position(|r| r.id() == id)
            .map(|off| start + off)
    }

    /// Where a re-entrant walk should continue given a handle from a
    /// previous traversal: right after the handle's rule if it still
    /// exists, otherwise at the default rule.
    pub fn resume_after(&self, handle: &RuleRef) -> usize {
        match self.index_of(handle.number, handle.id) {
            Some(idx) => idx + 1,
            None => self.default_index(),
        }
    }

    /// Skipto target resolution: the first rule past `from` numbered
    /// `target` or higher. The default rule guarantees a landing spot
    /// on any intact chain.
    pub fn skipto_index(&self, from: usize, target: u16) -> usize {
        let rel = self.rules[from + 1..]
            .partition_point(|r| r.number() < target);
        from + 1 + rel
    }

    /// Divert re-injection start: the first rule numbered strictly
    /// above the cookie.
    pub fn first_after_number(&self, cookie: u16) -> usize {
        self.rules.partition_point(|r| r.number() <= cookie)
    }

    pub fn default_index(&self) -> usize {
        self.rules
            .partition_point(|r| r.number() < DEFAULT_RULE_NUMBER)
    }
}

fn check_number(number: u16) -> Result<(), PfeError> {
    if number == DEFAULT_RULE_NUMBER || number == 0 {
        Err(PfeError::Validation(
            pfe_api::ValidationError::BadRuleNumber(number),
        ))
    } else {
        Ok(())
    }
}

fn check_set(set: u8) -> Result<(), PfeError> {
    if set >= RESERVED_SET {
        Err(PfeError::ReservedSet(set))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use itertools::Itertools;
    use pfe_api::ActionOp;

    fn chain() -> RuleChain {
        RuleChain::new(&FwConfig::default())
    }

    fn accept(number: u16) -> RuleDef {
        RuleDef::new(number, 0, vec![ActionOp::Accept.into()])
    }

    fn accept_in_set(number: u16, set: u8) -> RuleDef {
        RuleDef::new(number, set, vec![ActionOp::Accept.into()])
    }

    #[test]
    fn stays_sorted_under_insertion() {
        let mut c = chain();
        for n in [500, 100, 300, 100, 65000, 200] {
            c.add(accept(n)).unwrap();
        }
        assert!(
            c.rules()
                .iter()
                .map(|r| r.number())
                .tuple_windows()
                .all(|(a, b)| a <= b)
        );
        assert_eq!(
            c.rules().last().unwrap().number(),
            DEFAULT_RULE_NUMBER
        );
    }

    #[test]
    fn equal_numbers_keep_insertion_order() {
        let mut c = chain();
        c.add(accept(100)).unwrap();
        c.add(accept(100)).unwrap();
        let dup: Vec<_> = c
            .rules()
            .iter()
            .filter(|r| r.number() == 100)
            .map(|r| r.id())
            .collect();
        assert_eq!(dup.len(), 2);
        assert!(dup[0] < dup[1]);
    }

    #[test]
    fn autonumber_steps_from_highest() {
        let mut c = chain();
        assert_eq!(c.add(accept(0)).unwrap(), 100);
        assert_eq!(c.add(accept(0)).unwrap(), 200);
        c.add(accept(5000)).unwrap();
        assert_eq!(c.add(accept(0)).unwrap(), 5100);
    }

    #[test]
    fn autonumber_saturates_below_default() {
        let mut c = chain();
        c.add(accept(65530)).unwrap();
        // 65530 + 100 would pass the default rule; reuse the highest.
        assert_eq!(c.add(accept(0)).unwrap(), 65530);
    }

    #[test]
    fn default_rule_survives_everything() {
        let mut c = chain();
        c.add(accept(100)).unwrap();
        assert!(matches!(
            c.delete(DelCmd::Number(DEFAULT_RULE_NUMBER)),
            Err(PfeError::Validation(_))
        ));
        c.delete(DelCmd::Number(100)).unwrap();
        c.flush(false);
        assert_eq!(c.rules().len(), 1);
        assert_eq!(c.rules()[0].number(), DEFAULT_RULE_NUMBER);
    }

    #[test]
    fn delete_by_number_removes_duplicates() {
        let mut c = chain();
        c.add(accept(100)).unwrap();
        c.add(accept(100)).unwrap();
        c.add(accept(200)).unwrap();
        let (removed, n) = c.delete(DelCmd::Number(100)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(removed.len(), 2);
        assert_eq!(c.rules().len(), 2);
    }

    #[test]
    fn delete_missing_number_errors() {
        let mut c = chain();
        assert_eq!(
            c.delete(DelCmd::Number(42)),
            Err(PfeError::RuleNotFound(42))
        );
    }

    #[test]
    fn set_move_and_swap() {
        let mut c = chain();
        c.add(accept_in_set(100, 1)).unwrap();
        c.add(accept_in_set(200, 2)).unwrap();
        c.delete(DelCmd::MoveRuleToSet { number: 100, set: 3 }).unwrap();
        assert_eq!(c.rules()[0].set(), 3);

        c.delete(DelCmd::SwapSets { a: 2, b: 3 }).unwrap();
        assert_eq!(c.rules()[0].set(), 2);
        assert_eq!(c.rules()[1].set(), 3);

        c.delete(DelCmd::MoveSetToSet { old_set: 2, new_set: 3 }).unwrap();
        assert_eq!(c.rules()[0].set(), 3);
    }

    #[test]
    fn reserved_set_is_off_limits() {
        let mut c = chain();
        assert_eq!(
            c.delete(DelCmd::Set(RESERVED_SET)),
            Err(PfeError::ReservedSet(RESERVED_SET))
        );
        c.set_enable(0, u32::MAX);
        assert!(!c.set_disabled(RESERVED_SET));
        assert!(c.set_disabled(0));
    }

    #[test]
    fn generation_bumps_on_every_mutation() {
        let mut c = chain();
        let g0 = c.generation();
        c.add(accept(100)).unwrap();
        let g1 = c.generation();
        assert!(g1 > g0);
        c.set_enable(0, 1 << 4);
        let g2 = c.generation();
        assert!(g2 > g1);
        c.delete(DelCmd::Number(100)).unwrap();
        assert!(c.generation() > g2);
    }

    #[test]
    fn skipto_lands_forward() {
        let mut c = chain();
        for n in [100, 200, 300] {
            c.add(accept(n)).unwrap();
        }
        // From rule 100 (index 0), target 300 lands at index 2.
        assert_eq!(c.skipto_index(0, 300), 2);
        // A backward target degrades to the next rule.
        assert_eq!(c.skipto_index(2, 100), 3);
        // No numbered rule >= target: lands on the default rule.
        assert_eq!(c.skipto_index(0, 40000), 3);
    }

    #[test]
    fn resume_handles_survive_unrelated_mutations() {
        let mut c = chain();
        c.add(accept(100)).unwrap();
        c.add(accept(200)).unwrap();
        let r100 = &c.rules()[0];
        let handle = RuleRef {
            number: r100.number(),
            id: r100.id(),
            generation: c.generation(),
        };
        assert_eq!(c.resume_after(&handle), 1);
        c.delete(DelCmd::Number(200)).unwrap();
        // Still findable by id even though the generation moved on.
        assert_eq!(c.resume_after(&handle), 1);
        c.delete(DelCmd::Number(100)).unwrap();
        // Gone: resume falls through to the default rule.
        assert_eq!(c.resume_after(&handle), c.default_index());
    }
}
