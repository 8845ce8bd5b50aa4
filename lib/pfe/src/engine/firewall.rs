// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The firewall instance: one rule chain, one dynamic state table,
//! one set of address tables, and the control plane over all three.
//!
//! Locking: the data path takes the chain's read lock for the length
//! of one walk; control-plane mutations serialize on `ctl` and take
//! the write lock only for the mutation itself. The dynamic state
//! table and the address tables carry their own finer locks, so
//! classification never blocks on control traffic longer than one
//! chain mutation.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Instant;

use pfe_api::ClassifyResult;
use pfe_api::DelCmd;
use pfe_api::FwConfig;
use pfe_api::PfeError;
use pfe_api::RuleDef;
use pfe_api::RuleDump;
use pfe_api::RulesetSnapshot;
use pfe_api::TableEntryDump;
use pfe_api::ZeroReq;

use super::action::ClassifyCtx;
use super::chain::RuleChain;
use super::dynamic::DynamicStateTable;
use super::interp;
use super::packet::PacketDescriptor;
use super::rule;
use super::table::AddressTableSet;

/// One firewall instance. Independent instances share nothing.
pub struct Firewall {
    name: String,
    cfg: FwConfig,
    chain: RwLock<RuleChain>,
    dyn_table: DynamicStateTable,
    tables: AddressTableSet,
    /// Serializes control-plane mutations against each other.
    ctl: Mutex<()>,
    start: Instant,
}

impl Firewall {
    pub fn new(name: &str, cfg: FwConfig) -> Self {
        Self {
            name: name.to_string(),
            chain: RwLock::new(RuleChain::new(&cfg)),
            dyn_table: DynamicStateTable::new(&cfg),
            tables: AddressTableSet::new(cfg.tables),
            ctl: Mutex::new(()),
            start: Instant::now(),
            cfg,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn uptime_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Classify one packet. Infallible: any internal trouble comes
    /// back as a deny verdict, never as an error.
    pub fn classify(
        &self,
        pkt: &PacketDescriptor,
        ctx: &ClassifyCtx<'_>,
    ) -> ClassifyResult {
        let chain = self.chain.read().expect("chain lock poisoned");
        interp::run(
            &chain,
            &self.dyn_table,
            &self.tables,
            &self.cfg,
            pkt,
            ctx,
            Instant::now(),
            self.uptime_ms(),
        )
    }

    /// Validate and install a rule. Returns the number it landed on
    /// (the requested one, or the autonumbered one for number zero).
    pub fn add_rule(&self, def: RuleDef) -> Result<u16, PfeError> {
        rule::validate(&def, &self.cfg)?;
        let _ctl = self.ctl.lock().expect("ctl lock poisoned");
        self.chain.write().expect("chain lock poisoned").add(def)
    }

    /// Delete rules or manipulate sets. Dynamic entries owned by any
    /// removed rule are dropped before this returns.
    pub fn delete_rules(&self, cmd: DelCmd) -> Result<usize, PfeError> {
        let _ctl = self.ctl.lock().expect("ctl lock poisoned");
        let (removed, touched) =
            self.chain.write().expect("chain lock poisoned").delete(cmd)?;
        if !removed.is_empty() {
            let ids: Vec<u64> = removed.iter().map(|r| r.id()).collect();
            self.dyn_table.remove_parents(&ids);
        }
        Ok(touched)
    }

    /// Remove every rule outside the reserved set, plus their dynamic
    /// state. With `kill_default` the chain is emptied entirely and
    /// every later packet is denied fail-closed; that mode exists for
    /// teardown.
    pub fn flush(&self, kill_default: bool) -> usize {
        let _ctl = self.ctl.lock().expect("ctl lock poisoned");
        let removed = self
            .chain
            .write()
            .expect("chain lock poisoned")
            .flush(kill_default);
        let ids: Vec<u64> = removed.iter().map(|r| r.id()).collect();
        self.dyn_table.remove_parents(&ids);
        removed.len()
    }

    pub fn zero_counters(&self, req: &ZeroReq) -> Result<usize, PfeError> {
        let _ctl = self.ctl.lock().expect("ctl lock poisoned");
        self.chain.read().expect("chain lock poisoned").zero(req)
    }

    /// Atomically enable and disable rule sets by bitmask.
    pub fn set_enable(&self, enable: u32, disable: u32) {
        let _ctl = self.ctl.lock().expect("ctl lock poisoned");
        self.chain
            .write()
            .expect("chain lock poisoned")
            .set_enable(enable, disable);
    }

    pub fn generation(&self) -> u64 {
        self.chain.read().expect("chain lock poisoned").generation()
    }

    /// The full control-plane view: rules with counters, dynamic
    /// entries, set state.
    pub fn get_rules(&self) -> RulesetSnapshot {
        let chain = self.chain.read().expect("chain lock poisoned");
        let rules = chain
            .rules()
            .iter()
            .map(|r| {
                let (pcnt, bcnt, last_match_ms) = r.counters();
                RuleDump {
                    number: r.number(),
                    set: r.set(),
                    pcnt,
                    bcnt,
                    last_match_ms,
                    insns: r.insns().to_vec(),
                }
            })
            .collect();
        RulesetSnapshot {
            generation: chain.generation(),
            set_disable: chain.set_disable_mask(),
            rules,
            dyn_entries: self.dyn_table.dump(Instant::now()),
        }
    }

    /// Serialize the snapshot into a caller-provided buffer. Entries
    /// that do not fit are silently omitted, tail first, matching the
    /// contract that a concurrent grower loses rather than overflows;
    /// only a buffer too small for even the header errors.
    pub fn snapshot_into(&self, buf: &mut [u8]) -> Result<usize, PfeError> {
        let mut snap = self.get_rules();
        let needed = postcard::to_allocvec(&snap)
            .map_err(|e| PfeError::Serialization(e.to_string()))?
            .len();
        loop {
            match postcard::to_slice(&snap, buf) {
                Ok(used) => return Ok(used.len()),
                Err(postcard::Error::SerializeBufferFull) => {
                    if snap.dyn_entries.pop().is_none()
                        && snap.rules.pop().is_none()
                    {
                        return Err(PfeError::RespTooLarge {
                            needed,
                            given: buf.len(),
                        });
                    }
                }
                Err(e) => {
                    return Err(PfeError::Serialization(e.to_string()));
                }
            }
        }
    }

    /// Reap expired dynamic entries; meant to be driven periodically.
    pub fn expire_dyn(&self) -> usize {
        self.dyn_table.expire(Instant::now())
    }

    pub fn dyn_len(&self) -> u32 {
        self.dyn_table.len()
    }

    pub fn table_add(
        &self,
        id: u16,
        addr: Ipv4Addr,
        masklen: u8,
        value: u32,
    ) -> Result<(), PfeError> {
        let _ctl = self.ctl.lock().expect("ctl lock poisoned");
        self.tables.add(id, addr, masklen, value)
    }

    pub fn table_remove(
        &self,
        id: u16,
        addr: Ipv4Addr,
        masklen: u8,
    ) -> Result<(), PfeError> {
        let _ctl = self.ctl.lock().expect("ctl lock poisoned");
        self.tables.remove(id, addr, masklen)
    }

    pub fn table_lookup(&self, id: u16, addr: Ipv4Addr) -> Option<u32> {
        self.tables.lookup(id, addr)
    }

    pub fn table_count(&self, id: u16) -> Result<usize, PfeError> {
        self.tables.count(id)
    }

    pub fn table_list(
        &self,
        id: u16,
        max: usize,
    ) -> Result<Vec<TableEntryDump>, PfeError> {
        self.tables.dump(id, max)
    }

    pub fn table_flush(&self, id: u16) -> Result<usize, PfeError> {
        let _ctl = self.ctl.lock().expect("ctl lock poisoned");
        self.tables.flush(id)
    }
}
