// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dynamic state table: flow entries installed by keep-state and
//! limit rules, consulted by probe-state and check-state.
//!
//! Entries live in hash buckets guarded by per-bucket mutexes. The
//! bucket hash is symmetric in the two endpoints so both directions of
//! a flow land in the same bucket and a probe never takes two locks.

use std::collections::HashMap;
use std::hash::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;
use std::time::Instant;

use bitflags::bitflags;
use pfe_api::DynEntryDump;
use pfe_api::DynEntryKind;
use pfe_api::DynLifetimes;
use pfe_api::FlowId;
use pfe_api::FwConfig;
use pfe_api::LimitMask;
use pfe_api::Protocol;
use pfe_api::TcpFlags;

use super::rule::Rule;

bitflags! {
    /// Which connection milestones each direction has produced, used
    /// to pick an entry's lifetime class.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    struct TcpSeen: u8 {
        const SYN_FWD = 0x01;
        const SYN_REV = 0x02;
        const FIN_FWD = 0x04;
        const FIN_REV = 0x08;
        const RST = 0x10;
    }
}

/// Which way a probed packet is traveling relative to the packet that
/// created the entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StateDir {
    Forward,
    Reverse,
}

/// What a state-creating instruction asked for.
#[derive(Clone, Copy, Debug)]
pub enum StateSpec {
    KeepState,
    Limit { mask: LimitMask, ceiling: u16 },
}

/// Why an installation was refused. Both cases deny the packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StateError {
    TableFull,
    LimitReached,
}

impl StateError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TableFull => "dynamic table full",
            Self::LimitReached => "conversation limit reached",
        }
    }
}

/// A successful probe: the rule that owns the entry and the direction
/// the packet was traveling.
pub struct DynMatch {
    pub parent: Arc<Rule>,
    pub direction: StateDir,
}

/// The masked conversation key a limit rule counts by. Unmasked
/// fields are `None` so distinct masks never alias.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct LimitKey {
    parent_id: u64,
    src_ip: Option<IpAddr>,
    src_port: Option<u16>,
    dst_ip: Option<IpAddr>,
    dst_port: Option<u16>,
}

impl LimitKey {
    fn new(parent_id: u64, mask: LimitMask, flow: &FlowId) -> Self {
        Self {
            parent_id,
            src_ip: mask.contains(LimitMask::SRC_ADDR).then_some(flow.src_ip),
            src_port: mask
                .contains(LimitMask::SRC_PORT)
                .then_some(flow.src_port),
            dst_ip: mask.contains(LimitMask::DST_ADDR).then_some(flow.dst_ip),
            dst_port: mask
                .contains(LimitMask::DST_PORT)
                .then_some(flow.dst_port),
        }
    }
}

#[derive(Debug)]
struct DynEntry {
    flow: FlowId,
    parent: Weak<Rule>,
    parent_id: u64,
    parent_number: u16,
    limit_key: Option<LimitKey>,
    seen: TcpSeen,
    expire: Instant,
    pcnt: u64,
    bcnt: u64,
}

struct Lifetimes {
    ack: Duration,
    syn: Duration,
    fin: Duration,
    rst: Duration,
    udp: Duration,
    short: Duration,
}

impl From<&DynLifetimes> for Lifetimes {
    fn from(lt: &DynLifetimes) -> Self {
        let secs = |s: u32| Duration::from_secs(u64::from(s));
        Self {
            ack: secs(lt.ack),
            syn: secs(lt.syn),
            fin: secs(lt.fin),
            rst: secs(lt.rst),
            udp: secs(lt.udp),
            short: secs(lt.short),
        }
    }
}

impl DynEntry {
    fn note_packet(
        &mut self,
        dir: StateDir,
        proto: Protocol,
        flags: TcpFlags,
        bytes: u64,
        now: Instant,
        lt: &Lifetimes,
    ) {
        self.pcnt += 1;
        self.bcnt += bytes;

        if proto == Protocol::TCP {
            if flags.contains(TcpFlags::SYN) {
                self.seen |= match dir {
                    StateDir::Forward => TcpSeen::SYN_FWD,
                    StateDir::Reverse => TcpSeen::SYN_REV,
                };
            }
            if flags.contains(TcpFlags::FIN) {
                self.seen |= match dir {
                    StateDir::Forward => TcpSeen::FIN_FWD,
                    StateDir::Reverse => TcpSeen::FIN_REV,
                };
            }
            if flags.contains(TcpFlags::RST) {
                self.seen |= TcpSeen::RST;
            }
        }

        self.expire = now + self.lifetime(proto, lt);
    }

    fn lifetime(&self, proto: Protocol, lt: &Lifetimes) -> Duration {
        if proto == Protocol::TCP {
            let both_syn =
                self.seen.contains(TcpSeen::SYN_FWD | TcpSeen::SYN_REV);
            let both_fin =
                self.seen.contains(TcpSeen::FIN_FWD | TcpSeen::FIN_REV);
            if self.seen.contains(TcpSeen::RST) {
                lt.rst
            } else if both_syn && both_fin {
                lt.fin
            } else if both_syn {
                lt.ack
            } else {
                lt.syn
            }
        } else if proto == Protocol::UDP {
            lt.udp
        } else {
            lt.short
        }
    }

    fn kind(&self) -> DynEntryKind {
        if self.limit_key.is_some() {
            DynEntryKind::Limit
        } else {
            DynEntryKind::KeepState
        }
    }
}

/// The table itself. `probe` and `install` are the data-path entry
/// points; everything else is control plane or housekeeping.
pub struct DynamicStateTable {
    buckets: Vec<Mutex<Vec<DynEntry>>>,
    count: AtomicU32,
    max: u32,
    limits: Mutex<HashMap<LimitKey, u32>>,
    lifetimes: Lifetimes,
}

impl DynamicStateTable {
    pub fn new(cfg: &FwConfig) -> Self {
        let nbuckets = cfg.dyn_buckets.next_power_of_two().max(1);
        let buckets = (0..nbuckets).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            buckets,
            count: AtomicU32::new(0),
            max: cfg.dyn_max,
            limits: Mutex::new(HashMap::new()),
            lifetimes: Lifetimes::from(&cfg.lifetimes),
        }
    }

    /// Symmetric across mirror flows by construction: the two
    /// endpoint hashes are combined with xor.
    fn bucket_of(&self, flow: &FlowId) -> usize {
        let mut src = DefaultHasher::new();
        (flow.src_ip, flow.src_port).hash(&mut src);
        let mut dst = DefaultHasher::new();
        (flow.dst_ip, flow.dst_port).hash(&mut dst);
        let mut proto = DefaultHasher::new();
        flow.proto.hash(&mut proto);
        let h = src.finish() ^ dst.finish() ^ proto.finish();
        (h as usize) & (self.buckets.len() - 1)
    }

    pub fn len(&self) -> u32 {
        self.count.load(Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, entry: &DynEntry) {
        self.count.fetch_sub(1, Relaxed);
        if let Some(key) = &entry.limit_key {
            let mut limits = self.limits.lock().expect("limits lock poisoned");
            if let Some(n) = limits.get_mut(key) {
                *n -= 1;
                if *n == 0 {
                    limits.remove(key);
                }
            }
        }
    }

    /// Look up the flow in either direction, refreshing the entry on a
    /// hit. Expired entries encountered along the way are reaped.
    pub fn probe(
        &self,
        flow: &FlowId,
        flags: TcpFlags,
        bytes: u64,
        now: Instant,
    ) -> Option<DynMatch> {
        let mirror = flow.mirror();
        let mut bucket = self.buckets[self.bucket_of(flow)]
            .lock()
            .expect("dyn bucket poisoned");

        let mut i = 0;
        while i < bucket.len() {
            if bucket[i].expire <= now {
                let dead = bucket.swap_remove(i);
                self.forget(&dead);
                continue;
            }
            let dir = if bucket[i].flow == *flow {
                Some(StateDir::Forward)
            } else if bucket[i].flow == mirror {
                Some(StateDir::Reverse)
            } else {
                None
            };
            if let Some(direction) = dir {
                let Some(parent) = bucket[i].parent.upgrade() else {
                    // Parent rule vanished without a cascade; reap.
                    let dead = bucket.swap_remove(i);
                    self.forget(&dead);
                    continue;
                };
                bucket[i].note_packet(
                    direction,
                    flow.proto,
                    flags,
                    bytes,
                    now,
                    &self.lifetimes,
                );
                return Some(DynMatch { parent, direction });
            }
            i += 1;
        }
        None
    }

    /// Install (or refresh) the state entry for a flow on behalf of
    /// `parent`. Failure means the packet must be denied.
    pub fn install(
        &self,
        flow: &FlowId,
        parent: &Arc<Rule>,
        spec: StateSpec,
        flags: TcpFlags,
        bytes: u64,
        now: Instant,
    ) -> Result<(), StateError> {
        if self.try_install(flow, parent, spec, flags, bytes, now)? {
            return Ok(());
        }
        // At capacity: reap and try once more.
        self.expire(now);
        if self.try_install(flow, parent, spec, flags, bytes, now)? {
            Ok(())
        } else {
            Err(StateError::TableFull)
        }
    }

    /// One installation attempt. The bucket lock is held across the
    /// lookup and the insert, so a concurrent install of the same flow
    /// refreshes the entry instead of duplicating it. `Ok(false)`
    /// means the table was at capacity.
    fn try_install(
        &self,
        flow: &FlowId,
        parent: &Arc<Rule>,
        spec: StateSpec,
        flags: TcpFlags,
        bytes: u64,
        now: Instant,
    ) -> Result<bool, StateError> {
        let mirror = flow.mirror();
        let mut bucket = self.buckets[self.bucket_of(flow)]
            .lock()
            .expect("dyn bucket poisoned");

        // An existing entry (either direction) is refreshed in place.
        let mut i = 0;
        while i < bucket.len() {
            if bucket[i].expire <= now {
                let dead = bucket.swap_remove(i);
                self.forget(&dead);
                continue;
            }
            let dir = if bucket[i].flow == *flow {
                Some(StateDir::Forward)
            } else if bucket[i].flow == mirror {
                Some(StateDir::Reverse)
            } else {
                None
            };
            if let Some(direction) = dir {
                if bucket[i].parent.upgrade().is_none() {
                    let dead = bucket.swap_remove(i);
                    self.forget(&dead);
                    continue;
                }
                bucket[i].note_packet(
                    direction,
                    flow.proto,
                    flags,
                    bytes,
                    now,
                    &self.lifetimes,
                );
                return Ok(true);
            }
            i += 1;
        }

        // Reserve a slot atomically; concurrent installers contend on
        // the same counter and cannot push the table past `max`.
        if self
            .count
            .fetch_update(Relaxed, Relaxed, |c| {
                (c < self.max).then_some(c + 1)
            })
            .is_err()
        {
            return Ok(false);
        }

        let limit_key = match spec {
            StateSpec::KeepState => None,
            StateSpec::Limit { mask, ceiling } => {
                let key = LimitKey::new(parent.id(), mask, flow);
                let mut limits =
                    self.limits.lock().expect("limits lock poisoned");
                let n = limits.entry(key.clone()).or_insert(0);
                if *n >= u32::from(ceiling) {
                    self.count.fetch_sub(1, Relaxed);
                    return Err(StateError::LimitReached);
                }
                *n += 1;
                Some(key)
            }
        };

        let mut entry = DynEntry {
            flow: *flow,
            parent: Arc::downgrade(parent),
            parent_id: parent.id(),
            parent_number: parent.number(),
            limit_key,
            seen: TcpSeen::default(),
            expire: now,
            pcnt: 0,
            bcnt: 0,
        };
        entry.note_packet(
            StateDir::Forward,
            flow.proto,
            flags,
            bytes,
            now,
            &self.lifetimes,
        );
        bucket.push(entry);
        Ok(true)
    }

    /// Drop every entry whose parent rule was just removed from the
    /// chain. Called synchronously with the chain mutation.
    pub fn remove_parents(&self, parent_ids: &[u64]) {
        if parent_ids.is_empty() {
            return;
        }
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().expect("dyn bucket poisoned");
            let mut i = 0;
            while i < bucket.len() {
                if parent_ids.contains(&bucket[i].parent_id) {
                    let dead = bucket.swap_remove(i);
                    self.forget(&dead);
                } else {
                    i += 1;
                }
            }
        }
    }

    /// Reap expired entries. Returns how many were removed.
    pub fn expire(&self, now: Instant) -> usize {
        let mut reaped = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().expect("dyn bucket poisoned");
            let mut i = 0;
            while i < bucket.len() {
                if bucket[i].expire <= now {
                    let dead = bucket.swap_remove(i);
                    self.forget(&dead);
                    reaped += 1;
                } else {
                    i += 1;
                }
            }
        }
        reaped
    }

    pub fn dump(&self, now: Instant) -> Vec<DynEntryDump> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock().expect("dyn bucket poisoned");
            for entry in bucket.iter() {
                let expires_ms = entry
                    .expire
                    .saturating_duration_since(now)
                    .as_millis() as u64;
                out.push(DynEntryDump {
                    flow: entry.flow,
                    parent_number: entry.parent_number,
                    kind: entry.kind(),
                    pcnt: entry.pcnt,
                    bcnt: entry.bcnt,
                    expires_ms,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pfe_api::ActionOp;
    use pfe_api::RuleDef;

    fn cfg() -> FwConfig {
        FwConfig::default()
    }

    fn parent(number: u16, id: u64) -> Arc<Rule> {
        let def = RuleDef::new(number, 0, vec![ActionOp::Accept.into()]);
        Arc::new(Rule::build(def, number, id))
    }

    fn flow() -> FlowId {
        FlowId::tcp(
            "10.0.0.1".parse().unwrap(),
            40000,
            "192.168.0.1".parse().unwrap(),
            443,
        )
    }

    #[test]
    fn probe_sees_both_directions() {
        let table = DynamicStateTable::new(&cfg());
        let rule = parent(100, 1);
        let now = Instant::now();
        table
            .install(
                &flow(),
                &rule,
                StateSpec::KeepState,
                TcpFlags::SYN,
                40,
                now,
            )
            .unwrap();

        let fwd = table.probe(&flow(), TcpFlags::ACK, 40, now).unwrap();
        assert_eq!(fwd.direction, StateDir::Forward);
        assert_eq!(fwd.parent.number(), 100);

        let rev = table
            .probe(&flow().mirror(), TcpFlags::ACK, 40, now)
            .unwrap();
        assert_eq!(rev.direction, StateDir::Reverse);
    }

    #[test]
    fn reinstall_refreshes_instead_of_duplicating() {
        let table = DynamicStateTable::new(&cfg());
        let rule = parent(100, 1);
        let now = Instant::now();
        for _ in 0..3 {
            table
                .install(
                    &flow(),
                    &rule,
                    StateSpec::KeepState,
                    TcpFlags::SYN,
                    40,
                    now,
                )
                .unwrap();
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn limit_ceiling_is_enforced() {
        let table = DynamicStateTable::new(&cfg());
        let rule = parent(100, 1);
        let now = Instant::now();
        let spec =
            StateSpec::Limit { mask: LimitMask::SRC_ADDR, ceiling: 2 };

        let mut f = flow();
        for port in [1000, 1001] {
            f.src_port = port;
            table
                .install(&f, &rule, spec, TcpFlags::SYN, 40, now)
                .unwrap();
        }
        f.src_port = 1002;
        assert_eq!(
            table.install(&f, &rule, spec, TcpFlags::SYN, 40, now),
            Err(StateError::LimitReached)
        );

        // A different source address is a different conversation key.
        f.src_ip = "10.0.0.2".parse::<std::net::Ipv4Addr>().unwrap().into();
        table.install(&f, &rule, spec, TcpFlags::SYN, 40, now).unwrap();
    }

    #[test]
    fn table_full_denies() {
        let mut c = cfg();
        c.dyn_max = 2;
        let table = DynamicStateTable::new(&c);
        let rule = parent(100, 1);
        let now = Instant::now();

        let mut f = flow();
        for port in [1000, 1001] {
            f.src_port = port;
            table
                .install(&f, &rule, StateSpec::KeepState, TcpFlags::SYN, 40, now)
                .unwrap();
        }
        f.src_port = 1002;
        assert_eq!(
            table.install(&f, &rule, StateSpec::KeepState, TcpFlags::SYN, 40, now),
            Err(StateError::TableFull)
        );
    }

    #[test]
    fn concurrent_installs_neither_duplicate_nor_overshoot() {
        let mut c = cfg();
        c.dyn_max = 4;
        let table = DynamicStateTable::new(&c);
        let rule = parent(100, 1);
        let now = Instant::now();

        std::thread::scope(|s| {
            for t in 0u16..8 {
                let table = &table;
                let rule = &rule;
                s.spawn(move || {
                    // Everyone races on the same flow first, then
                    // contends for the remaining slots.
                    let _ = table.install(
                        &flow(),
                        rule,
                        StateSpec::KeepState,
                        TcpFlags::SYN,
                        40,
                        now,
                    );
                    let mut f = flow();
                    f.src_port = 2000 + t;
                    let _ = table.install(
                        &f,
                        rule,
                        StateSpec::KeepState,
                        TcpFlags::SYN,
                        40,
                        now,
                    );
                });
            }
        });

        assert_eq!(table.len(), 4);
        let shared = table
            .dump(now)
            .iter()
            .filter(|e| e.flow == flow())
            .count();
        assert_eq!(shared, 1);
    }

    #[test]
    fn established_outlives_embryonic() {
        let table = DynamicStateTable::new(&cfg());
        let rule = parent(100, 1);
        let now = Instant::now();
        table
            .install(&flow(), &rule, StateSpec::KeepState, TcpFlags::SYN, 40, now)
            .unwrap();

        // Embryonic: gone after the SYN lifetime.
        let later = now + Duration::from_secs(21);
        assert!(table.probe(&flow(), TcpFlags::empty(), 40, later).is_none());

        // Complete the handshake this time.
        table
            .install(&flow(), &rule, StateSpec::KeepState, TcpFlags::SYN, 40, later)
            .unwrap();
        table
            .probe(
                &flow().mirror(),
                TcpFlags::SYN | TcpFlags::ACK,
                40,
                later,
            )
            .unwrap();
        let much_later = later + Duration::from_secs(200);
        assert!(
            table.probe(&flow(), TcpFlags::ACK, 40, much_later).is_some()
        );
    }

    #[test]
    fn rst_collapses_lifetime() {
        let table = DynamicStateTable::new(&cfg());
        let rule = parent(100, 1);
        let now = Instant::now();
        table
            .install(&flow(), &rule, StateSpec::KeepState, TcpFlags::SYN, 40, now)
            .unwrap();
        table.probe(&flow(), TcpFlags::RST, 40, now).unwrap();
        let later = now + Duration::from_secs(2);
        assert!(table.probe(&flow(), TcpFlags::ACK, 40, later).is_none());
    }

    #[test]
    fn cascade_delete_frees_limit_slots() {
        let table = DynamicStateTable::new(&cfg());
        let rule = parent(100, 7);
        let now = Instant::now();
        let spec =
            StateSpec::Limit { mask: LimitMask::SRC_ADDR, ceiling: 1 };
        table.install(&flow(), &rule, spec, TcpFlags::SYN, 40, now).unwrap();

        table.remove_parents(&[7]);
        assert_eq!(table.len(), 0);
        // The limit slot must have been released with the entry.
        table.install(&flow(), &rule, spec, TcpFlags::SYN, 40, now).unwrap();
    }

    #[test]
    fn expire_reaps_udp_entries() {
        let table = DynamicStateTable::new(&cfg());
        let rule = parent(100, 1);
        let now = Instant::now();
        let f = FlowId::udp(
            "10.0.0.1".parse().unwrap(),
            53,
            "10.0.0.2".parse().unwrap(),
            53,
        );
        table
            .install(&f, &rule, StateSpec::KeepState, TcpFlags::empty(), 40, now)
            .unwrap();
        assert_eq!(table.expire(now + Duration::from_secs(11)), 1);
        assert!(table.is_empty());
    }
}
