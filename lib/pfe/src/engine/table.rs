// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Numbered address tables with longest-prefix-match lookup.
//!
//! Entries are stored pre-masked, keyed by (masked address, mask
//! length). Lookup scans mask lengths longest-first, so the most
//! specific prefix always wins and a tie is impossible by
//! construction.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;

use pfe_api::PfeError;
use pfe_api::TableEntryDump;
use pfe_api::ValidationError;

fn mask_of(masklen: u8) -> u32 {
    if masklen == 0 { 0 } else { u32::MAX << (32 - masklen) }
}

fn check_masklen(masklen: u8) -> Result<(), PfeError> {
    if masklen > 32 {
        Err(ValidationError::WrongOperandSize("masklen".into()).into())
    } else {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PrefixTable {
    /// masklen -> masked address -> value.
    prefixes: BTreeMap<u8, HashMap<u32, u32>>,
    count: usize,
}

impl PrefixTable {
    fn add(&mut self, addr: u32, masklen: u8, value: u32) -> Result<(), PfeError> {
        let key = addr & mask_of(masklen);
        let map = self.prefixes.entry(masklen).or_default();
        if map.contains_key(&key) {
            return Err(PfeError::Exists);
        }
        map.insert(key, value);
        self.count += 1;
        Ok(())
    }

    fn remove(&mut self, addr: u32, masklen: u8) -> Result<(), PfeError> {
        let key = addr & mask_of(masklen);
        let removed = self
            .prefixes
            .get_mut(&masklen)
            .and_then(|map| map.remove(&key));
        match removed {
            Some(_) => {
                self.count -= 1;
                Ok(())
            }
            None => Err(PfeError::NotFound),
        }
    }

    fn lookup(&self, addr: u32) -> Option<u32> {
        for (&masklen, map) in self.prefixes.iter().rev() {
            if let Some(&value) = map.get(&(addr & mask_of(masklen))) {
                return Some(value);
            }
        }
        None
    }

    fn dump(&self, max: usize) -> Vec<TableEntryDump> {
        let mut out = Vec::with_capacity(self.count.min(max));
        for (&masklen, map) in &self.prefixes {
            for (&addr, &value) in map {
                if out.len() == max {
                    return out;
                }
                out.push(TableEntryDump {
                    addr: Ipv4Addr::from(addr),
                    masklen,
                    value,
                });
            }
        }
        out
    }
}

/// The fixed-size collection of numbered tables owned by one engine
/// instance. Each table takes its own reader/writer lock; lookups on
/// the data path only ever take read locks.
#[derive(Debug)]
pub struct AddressTableSet {
    tables: Vec<RwLock<PrefixTable>>,
}

impl AddressTableSet {
    pub fn new(count: u16) -> Self {
        let tables =
            (0..count).map(|_| RwLock::new(PrefixTable::default())).collect();
        Self { tables }
    }

    fn table(&self, id: u16) -> Result<&RwLock<PrefixTable>, PfeError> {
        self.tables
            .get(usize::from(id))
            .ok_or(PfeError::InvalidTableId(id))
    }

    pub fn add(
        &self,
        id: u16,
        addr: Ipv4Addr,
        masklen: u8,
        value: u32,
    ) -> Result<(), PfeError> {
        check_masklen(masklen)?;
        self.table(id)?
            .write()
            .expect("table lock poisoned")
            .add(u32::from(addr), masklen, value)
    }

    pub fn remove(
        &self,
        id: u16,
        addr: Ipv4Addr,
        masklen: u8,
    ) -> Result<(), PfeError> {
        check_masklen(masklen)?;
        self.table(id)?
            .write()
            .expect("table lock poisoned")
            .remove(u32::from(addr), masklen)
    }

    /// Longest-prefix lookup. An out-of-range table id is a miss, not
    /// an error: the data path never fails open.
    pub fn lookup(&self, id: u16, addr: Ipv4Addr) -> Option<u32> {
        self.tables
            .get(usize::from(id))?
            .read()
            .expect("table lock poisoned")
            .lookup(u32::from(addr))
    }

    pub fn count(&self, id: u16) -> Result<usize, PfeError> {
        Ok(self.table(id)?.read().expect("table lock poisoned").count)
    }

    pub fn dump(
        &self,
        id: u16,
        max: usize,
    ) -> Result<Vec<TableEntryDump>, PfeError> {
        Ok(self.table(id)?.read().expect("table lock poisoned").dump(max))
    }

    pub fn flush(&self, id: u16) -> Result<usize, PfeError> {
        let mut table = self.table(id)?.write().expect("table lock poisoned");
        let count = table.count;
        *table = PrefixTable::default();
        Ok(count)
    }

    pub fn flush_all(&self) {
        for table in &self.tables {
            *table.write().expect("table lock poisoned") =
                PrefixTable::default();
        }
    }
}
