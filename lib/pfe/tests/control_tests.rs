// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-plane tests: rule installation, deletion, set switching,
//! counter resets, and address-table maintenance through the public
//! firewall interface.

use std::net::Ipv4Addr;

use pfe::api::ActionOp;
use pfe::api::DEFAULT_RULE_NUMBER;
use pfe::api::DelCmd;
use pfe::api::DynEntryKind;
use pfe::api::FwConfig;
use pfe::api::MatchOp;
use pfe::api::PfeError;
use pfe::api::RESERVED_SET;
use pfe::api::RuleDef;
use pfe::api::RulesetSnapshot;
use pfe::api::Verdict;
use pfe::api::ZeroReq;
use pfe::engine::action::ClassifyCtx;
use pfe::engine::firewall::Firewall;
use pfe::engine::packet::PacketDescriptor;

fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn accept(number: u16) -> RuleDef {
    RuleDef::new(number, 0, vec![ActionOp::Accept.into()])
}

fn accept_in_set(number: u16, set: u8) -> RuleDef {
    RuleDef::new(number, set, vec![ActionOp::Accept.into()])
}

fn numbers(fw: &Firewall) -> Vec<u16> {
    fw.get_rules().rules.iter().map(|r| r.number).collect()
}

#[test]
fn autonumbering_spaces_rules() {
    let fw = Firewall::new("fw0", FwConfig::default());
    assert_eq!(fw.add_rule(accept(0)).unwrap(), 100);
    assert_eq!(fw.add_rule(accept(0)).unwrap(), 200);
    // An explicit number slots in wherever it belongs.
    assert_eq!(fw.add_rule(accept(150)).unwrap(), 150);
    assert_eq!(fw.add_rule(accept(0)).unwrap(), 300);
    assert_eq!(numbers(&fw), vec![100, 150, 200, 300, DEFAULT_RULE_NUMBER]);
}

#[test]
fn autonumbering_saturates_near_the_end() {
    let cfg = FwConfig { autoinc_step: 1000, ..Default::default() };
    let fw = Firewall::new("fw0", cfg);
    fw.add_rule(accept(65000)).unwrap();
    // 65000 + 1000 would land past the default rule; the new rule
    // reuses the highest ordinary number instead.
    assert_eq!(fw.add_rule(accept(0)).unwrap(), 65000);
}

#[test]
fn delete_variants() {
    let fw = Firewall::new("fw0", FwConfig::default());
    fw.add_rule(accept(100)).unwrap();
    fw.add_rule(accept(100)).unwrap();
    fw.add_rule(accept_in_set(200, 3)).unwrap();
    fw.add_rule(accept_in_set(300, 3)).unwrap();

    assert_eq!(fw.delete_rules(DelCmd::Number(100)).unwrap(), 2);
    assert_eq!(fw.delete_rules(DelCmd::Set(3)).unwrap(), 2);
    assert_eq!(numbers(&fw), vec![DEFAULT_RULE_NUMBER]);

    assert_eq!(
        fw.delete_rules(DelCmd::Number(100)),
        Err(PfeError::RuleNotFound(100))
    );
    // The default rule and the reserved set are untouchable.
    assert!(matches!(
        fw.delete_rules(DelCmd::Number(DEFAULT_RULE_NUMBER)),
        Err(PfeError::Validation(_))
    ));
    assert_eq!(
        fw.delete_rules(DelCmd::Set(RESERVED_SET)),
        Err(PfeError::ReservedSet(RESERVED_SET))
    );
}

#[test]
fn set_disable_switches_policy() {
    let fw = Firewall::new("fw0", FwConfig::default());
    // Set 1 carries the restrictive policy, set 0 the permissive one.
    fw.add_rule(RuleDef::new(
        100,
        1,
        vec![MatchOp::Proto(6).into(), ActionOp::Deny.into()],
    ))
    .unwrap();
    fw.add_rule(accept(200)).unwrap();

    let ctx = ClassifyCtx::null();
    let pkt = PacketDescriptor::tcp(addr("10.0.0.1"), 1, addr("10.0.0.2"), 2);
    assert_eq!(fw.classify(&pkt, &ctx).verdict, Verdict::Deny);

    fw.set_enable(0, 1 << 1);
    let res = fw.classify(&pkt, &ctx);
    assert_eq!(res.verdict, Verdict::Pass);
    assert_eq!(res.matched.unwrap().number, 200);

    fw.set_enable(1 << 1, 0);
    assert_eq!(fw.classify(&pkt, &ctx).verdict, Verdict::Deny);
}

#[test]
fn swap_sets_exchanges_policies() {
    let fw = Firewall::new("fw0", FwConfig::default());
    fw.add_rule(accept_in_set(100, 1)).unwrap();
    fw.add_rule(accept_in_set(200, 2)).unwrap();

    fw.delete_rules(DelCmd::SwapSets { a: 1, b: 2 }).unwrap();
    let snap = fw.get_rules();
    let set_of = |n: u16| {
        snap.rules.iter().find(|r| r.number == n).unwrap().set
    };
    assert_eq!(set_of(100), 2);
    assert_eq!(set_of(200), 1);
}

#[test]
fn move_rule_between_sets() {
    let fw = Firewall::new("fw0", FwConfig::default());
    fw.add_rule(accept(100)).unwrap();
    fw.delete_rules(DelCmd::MoveRuleToSet { number: 100, set: 5 })
        .unwrap();
    assert_eq!(fw.get_rules().rules[0].set, 5);

    fw.delete_rules(DelCmd::MoveSetToSet { old_set: 5, new_set: 0 })
        .unwrap();
    assert_eq!(fw.get_rules().rules[0].set, 0);
}

#[test]
fn deleting_a_rule_drops_its_state() {
    let fw = Firewall::new("fw0", FwConfig::default());
    fw.add_rule(RuleDef::new(
        100,
        0,
        vec![MatchOp::KeepState.into(), ActionOp::Accept.into()],
    ))
    .unwrap();

    let ctx = ClassifyCtx::null();
    let pkt = PacketDescriptor::tcp(addr("10.0.0.1"), 1, addr("10.0.0.2"), 2);
    fw.classify(&pkt, &ctx);
    assert_eq!(fw.dyn_len(), 1);

    fw.delete_rules(DelCmd::Number(100)).unwrap();
    assert_eq!(fw.dyn_len(), 0);
    // Without the parent the reply falls through to the default deny.
    let reply = PacketDescriptor::new(pkt.flow.mirror());
    assert_eq!(fw.classify(&reply, &ctx).verdict, Verdict::Deny);
}

#[test]
fn snapshot_reports_dynamic_entries() {
    let fw = Firewall::new("fw0", FwConfig::default());
    fw.add_rule(RuleDef::new(
        100,
        0,
        vec![MatchOp::KeepState.into(), ActionOp::Accept.into()],
    ))
    .unwrap();
    let pkt = PacketDescriptor::udp(addr("10.0.0.1"), 53, addr("8.8.8.8"), 53);
    fw.classify(&pkt, &ClassifyCtx::null());

    let snap = fw.get_rules();
    assert_eq!(snap.dyn_entries.len(), 1);
    let entry = &snap.dyn_entries[0];
    assert_eq!(entry.parent_number, 100);
    assert_eq!(entry.kind, DynEntryKind::KeepState);
    assert_eq!(entry.pcnt, 1);
    assert!(entry.expires_ms > 0);
}

#[test]
fn zero_log_only_preserves_counters() {
    let fw = Firewall::new("fw0", FwConfig::default());
    fw.add_rule(RuleDef::new(
        100,
        0,
        vec![MatchOp::Log { max: 1 }.into(), ActionOp::Accept.into()],
    ))
    .unwrap();

    let ctx = ClassifyCtx::null();
    let pkt = PacketDescriptor::tcp(addr("10.0.0.1"), 1, addr("10.0.0.2"), 2);
    fw.classify(&pkt, &ctx);
    fw.classify(&pkt, &ctx);
    assert_eq!(fw.get_rules().rules[0].pcnt, 2);

    fw.zero_counters(&ZeroReq { number: Some(100), set: None, log_only: true })
        .unwrap();
    assert_eq!(fw.get_rules().rules[0].pcnt, 2);
}

#[test]
fn generation_tracks_every_mutation() {
    let fw = Firewall::new("fw0", FwConfig::default());
    let g0 = fw.generation();
    fw.add_rule(accept(100)).unwrap();
    let g1 = fw.generation();
    assert!(g1 > g0);
    fw.delete_rules(DelCmd::Number(100)).unwrap();
    assert!(fw.generation() > g1);
    // Read-only operations leave it alone.
    let g2 = fw.generation();
    fw.get_rules();
    assert_eq!(fw.generation(), g2);
}

#[test]
fn table_maintenance() {
    let fw = Firewall::new("fw0", FwConfig::default());
    fw.table_add(1, addr("10.1.0.0"), 16, 7).unwrap();
    fw.table_add(1, addr("10.2.0.0"), 16, 8).unwrap();
    assert_eq!(
        fw.table_add(1, addr("10.1.0.0"), 16, 9),
        Err(PfeError::Exists)
    );

    assert_eq!(fw.table_lookup(1, addr("10.1.5.5")), Some(7));
    assert_eq!(fw.table_lookup(1, addr("10.3.0.1")), None);
    assert_eq!(fw.table_count(1).unwrap(), 2);

    let entries = fw.table_list(1, 10).unwrap();
    assert_eq!(entries.len(), 2);

    fw.table_remove(1, addr("10.2.0.0"), 16).unwrap();
    assert_eq!(
        fw.table_remove(1, addr("10.2.0.0"), 16),
        Err(PfeError::NotFound)
    );
    assert_eq!(fw.table_flush(1).unwrap(), 1);
    assert_eq!(fw.table_count(1).unwrap(), 0);

    let bad = u16::MAX;
    assert_eq!(
        fw.table_add(bad, addr("10.0.0.0"), 8, 1),
        Err(PfeError::InvalidTableId(bad))
    );
}

#[test]
fn snapshot_round_trips_through_postcard() {
    let fw = Firewall::new("fw0", FwConfig::default());
    fw.add_rule(accept(100)).unwrap();
    fw.add_rule(RuleDef::new(
        200,
        2,
        vec![
            MatchOp::Proto(17).into(),
            MatchOp::KeepState.into(),
            ActionOp::Accept.into(),
        ],
    ))
    .unwrap();
    let pkt = PacketDescriptor::udp(addr("10.0.0.1"), 53, addr("8.8.8.8"), 53);
    fw.classify(&pkt, &ClassifyCtx::null());

    let snap = fw.get_rules();
    let bytes = postcard::to_allocvec(&snap).unwrap();
    let back: RulesetSnapshot = postcard::from_bytes(&bytes).unwrap();
    assert_eq!(back, snap);
}
