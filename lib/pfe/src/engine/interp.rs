// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-packet instruction interpreter.
//!
//! One walk visits rules in chain order. Within a rule, match
//! instructions run left to right with OR-block short-circuiting and
//! per-instruction negation; the first failing non-OR instruction
//! abandons the rule. The terminal action either produces a verdict or
//! redirects the walk (skipto, count, state jumps). Running off the
//! end of the chain denies the packet.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;

use pfe_api::ActionOp;
use pfe_api::ClassifyResult;
use pfe_api::DEFAULT_RULE_NUMBER;
use pfe_api::FwConfig;
use pfe_api::Instruction;
use pfe_api::LookupKey;
use pfe_api::MatchOp;
use pfe_api::Protocol;
use pfe_api::RuleRef;
use pfe_api::TABLEARG;
use pfe_api::TcpFlags;
use pfe_api::Verdict;

use super::action::ClassifyCtx;
use super::action::Credential;
use super::action::Event;
use super::action::reject_notice_allowed;
use super::chain::RuleChain;
use super::dynamic::DynamicStateTable;
use super::dynamic::StateDir;
use super::dynamic::StateSpec;
use super::packet::PacketDescriptor;
use super::rule::Rule;
use super::table::AddressTableSet;

/// What evaluating one rule told the outer loop to do next.
enum Step {
    /// Continue with the following rule.
    Next,
    /// Continue at this index (skipto).
    Jump(usize),
    /// Continue at this index, entering at the action (state hit).
    JumpAction(usize),
    /// The walk is over.
    Done(ClassifyResult),
}

/// What one match instruction produced.
enum Ev {
    Bool(bool),
    /// A state probe hit; jump to the parent's action.
    JumpAction(usize),
    /// A state install failed; the packet is denied on the spot.
    Deny,
}

struct Walk<'a> {
    chain: &'a RuleChain,
    dyn_table: &'a DynamicStateTable,
    tables: &'a AddressTableSet,
    pkt: &'a PacketDescriptor,
    ctx: &'a ClassifyCtx<'a>,
    now: Instant,
    now_ms: u64,
    bytes: u64,
    /// Set once a state probe has hit; no further jumps this walk.
    dyn_dir: Option<StateDir>,
    /// Per-walk credential cache: at most one resolver call.
    cred: Option<Option<Credential>>,
    /// The table argument latched by the current rule's lookups.
    tablearg: Option<u32>,
}

/// Classify one packet against the chain. The caller holds the chain
/// read lock for the duration.
pub(crate) fn run(
    chain: &RuleChain,
    dyn_table: &DynamicStateTable,
    tables: &AddressTableSet,
    cfg: &FwConfig,
    pkt: &PacketDescriptor,
    ctx: &ClassifyCtx<'_>,
    now: Instant,
    now_ms: u64,
) -> ClassifyResult {
    let mut walk = Walk {
        chain,
        dyn_table,
        tables,
        pkt,
        ctx,
        now,
        now_ms,
        bytes: u64::from(pkt.ip_len),
        dyn_dir: None,
        cred: None,
        tablearg: None,
    };

    let mut idx = if let Some(handle) = &pkt.resume {
        if cfg.one_pass {
            return ClassifyResult {
                verdict: Verdict::Pass,
                next_hop: None,
                matched: Some(handle.clone()),
            };
        }
        chain.resume_after(handle)
    } else if let Some(cookie) = pkt.divert_cookie {
        if cookie >= DEFAULT_RULE_NUMBER {
            return walk.deny_unmatched();
        }
        chain.first_after_number(cookie)
    } else {
        0
    };

    let mut action_only = false;
    while idx < chain.rules().len() {
        let rule = Arc::clone(&chain.rules()[idx]);
        if !action_only && chain.set_disabled(rule.set()) {
            idx += 1;
            continue;
        }
        match walk.eval_rule(idx, &rule, action_only) {
            Step::Next => {
                idx += 1;
                action_only = false;
            }
            Step::Jump(target) => {
                idx = target;
                action_only = false;
            }
            Step::JumpAction(target) => {
                idx = target;
                action_only = true;
            }
            Step::Done(result) => return result,
        }
    }

    ctx.log.event(Event::RulesExhausted { flow: &pkt.flow });
    walk.deny_unmatched()
}

impl<'a> Walk<'a> {
    fn deny_unmatched(&self) -> ClassifyResult {
        ClassifyResult {
            verdict: Verdict::Deny,
            next_hop: None,
            matched: None,
        }
    }

    /// Produce a final verdict from `rule`, charging the packet to its
    /// counters.
    fn done(
        &self,
        rule: &Arc<Rule>,
        verdict: Verdict,
        next_hop: Option<SocketAddrV4>,
    ) -> Step {
        rule.bump(self.bytes, self.now_ms);
        Step::Done(ClassifyResult {
            verdict,
            next_hop,
            matched: Some(RuleRef {
                number: rule.number(),
                id: rule.id(),
                generation: self.chain.generation(),
            }),
        })
    }

    fn eval_rule(
        &mut self,
        idx: usize,
        rule: &Arc<Rule>,
        action_only: bool,
    ) -> Step {
        self.tablearg = None;
        let mut skip_or = false;
        let start = if action_only { rule.act_index() } else { 0 };

        for insn in &rule.insns()[start..] {
            match insn {
                Instruction::Match(m) => {
                    if skip_or {
                        // A member of this OR block already matched.
                        if !m.or {
                            skip_or = false;
                        }
                        continue;
                    }
                    let matched = match self.eval_match(rule, &m.op) {
                        Ev::Bool(b) => b,
                        Ev::JumpAction(target) => {
                            return Step::JumpAction(target);
                        }
                        Ev::Deny => {
                            return self.done(rule, Verdict::Deny, None);
                        }
                    };
                    let matched = matched != m.negate;
                    if matched {
                        if m.or {
                            skip_or = true;
                        }
                    } else if !m.or {
                        return Step::Next;
                    }
                }
                Instruction::Action(act) => {
                    return self.exec_action(idx, rule, act);
                }
            }
        }

        // Validation guarantees a trailing action.
        Step::Next
    }

    fn eval_match(&mut self, rule: &Arc<Rule>, op: &MatchOp) -> Ev {
        let pkt = self.pkt;
        let flow = &pkt.flow;

        let matched = match op {
            MatchOp::Nop => true,
            MatchOp::Proto(p) => flow.proto == Protocol(*p),
            MatchOp::SrcIp(list) => {
                list.iter().any(|a| a.matches(flow.src_ip))
            }
            MatchOp::DstIp(list) => {
                list.iter().any(|a| a.matches(flow.dst_ip))
            }
            MatchOp::SrcPort(list) => {
                pkt.has_ports()
                    && list.iter().any(|r| r.contains(&flow.src_port))
            }
            MatchOp::DstPort(list) => {
                pkt.has_ports()
                    && list.iter().any(|r| r.contains(&flow.dst_port))
            }
            MatchOp::In => pkt.iface_out.is_none(),
            MatchOp::Frag => pkt.frag_offset != 0,
            MatchOp::TcpFlags { set, clear } => {
                flow.proto == Protocol::TCP
                    && pkt.frag_offset == 0
                    && pkt.tcp_flags.contains(*set)
                    && !pkt.tcp_flags.intersects(*clear)
            }
            MatchOp::Established => {
                flow.proto == Protocol::TCP
                    && pkt.frag_offset == 0
                    && pkt
                        .tcp_flags
                        .intersects(TcpFlags::RST | TcpFlags::ACK)
            }
            MatchOp::IcmpTypes(map) => {
                flow.proto == Protocol::ICMP
                    && pkt
                        .icmp_type
                        .is_some_and(|ty| ty < 32 && map & (1 << ty) != 0)
            }
            MatchOp::ExtHeader(want) => {
                flow.is_ipv6() && pkt.ext_headers.intersects(*want)
            }
            MatchOp::RecvIface(i) => pkt.iface_in == Some(*i),
            MatchOp::XmitIface(i) => pkt.iface_out == Some(*i),
            MatchOp::ViaIface(i) => {
                pkt.iface_out == Some(*i) || pkt.iface_in == Some(*i)
            }
            MatchOp::Uid(uid) => {
                self.credential().is_some_and(|c| c.uid == *uid)
            }
            MatchOp::Gid(gid) => {
                self.credential().is_some_and(|c| c.gid == *gid)
            }
            MatchOp::Jail(jail) => {
                self.credential().is_some_and(|c| c.jail_id == *jail)
            }
            MatchOp::ReversePathOk => self
                .ctx
                .routes
                .is_some_and(|r| r.reverse_path_ok(flow.src_ip, pkt.iface_in)),
            MatchOp::Lookup { key, table, value } => {
                let addr = match key {
                    LookupKey::SrcAddr => flow.src_ip,
                    LookupKey::DstAddr => flow.dst_ip,
                };
                let IpAddr::V4(v4) = addr else {
                    return Ev::Bool(false);
                };
                match self.tables.lookup(*table, v4) {
                    Some(found) => match value {
                        Some(want) => found == *want,
                        None => {
                            self.tablearg = Some(found);
                            true
                        }
                    },
                    None => false,
                }
            }
            MatchOp::KeepState => {
                return self.install_state(rule, StateSpec::KeepState);
            }
            MatchOp::Limit { mask, ceiling } => {
                return self.install_state(
                    rule,
                    StateSpec::Limit { mask: *mask, ceiling: *ceiling },
                );
            }
            MatchOp::ProbeState => {
                return match self.probe_state() {
                    Some(target) => Ev::JumpAction(target),
                    // Miss: ignore and keep evaluating this rule.
                    None => Ev::Bool(true),
                };
            }
            MatchOp::Log { .. } => {
                if rule.log_take() {
                    self.ctx.log.event(Event::RuleMatch {
                        number: rule.number(),
                        flow,
                        action: rule.action(),
                    });
                }
                true
            }
            // Never installed; validation refuses the opcode.
            MatchOp::Unsupported { .. } => false,
        };

        Ev::Bool(matched)
    }

    /// Per-walk credential cache: the resolver is consulted at most
    /// once per packet, and only for unfragmented TCP/UDP.
    fn credential(&mut self) -> Option<Credential> {
        if !self.pkt.has_ports() {
            return None;
        }
        if let Some(cached) = self.cred {
            return cached;
        }
        let resolved = self
            .ctx
            .creds
            .and_then(|c| c.resolve(&self.pkt.flow, self.pkt.direction()));
        self.cred = Some(resolved);
        resolved
    }

    /// First probe of the walk does the lookup; a hit is consumed
    /// permanently (no second jump), a miss leaves later probes free
    /// to try again.
    fn probe_state(&mut self) -> Option<usize> {
        if self.dyn_dir.is_some() {
            return None;
        }
        let hit = self.dyn_table.probe(
            &self.pkt.flow,
            self.pkt.tcp_flags,
            self.bytes,
            self.now,
        )?;
        self.dyn_dir = Some(hit.direction);
        match self.chain.index_of(hit.parent.number(), hit.parent.id()) {
            Some(target) => Some(target),
            None => {
                self.ctx.log.event(Event::StateJumpBroken {
                    parent_number: hit.parent.number(),
                });
                None
            }
        }
    }

    fn install_state(&mut self, rule: &Arc<Rule>, spec: StateSpec) -> Ev {
        match self.dyn_table.install(
            &self.pkt.flow,
            rule,
            spec,
            self.pkt.tcp_flags,
            self.bytes,
            self.now,
        ) {
            Ok(()) => Ev::Bool(true),
            Err(err) => {
                self.ctx.log.event(Event::StateInstallFailed {
                    number: rule.number(),
                    flow: &self.pkt.flow,
                    reason: err.as_str(),
                });
                Ev::Deny
            }
        }
    }

    /// Resolve a 16-bit action operand, substituting the table
    /// argument for the marker value.
    fn arg16(&self, raw: u16, rule: &Arc<Rule>) -> Option<u16> {
        if u32::from(raw) != TABLEARG {
            return Some(raw);
        }
        match self.tablearg.and_then(|v| u16::try_from(v).ok()) {
            Some(v) => Some(v),
            None => {
                self.ctx.log.event(Event::TableArgMissing {
                    number: rule.number(),
                });
                None
            }
        }
    }

    fn arg32(&self, raw: u32, rule: &Arc<Rule>) -> Option<u32> {
        if raw != TABLEARG {
            return Some(raw);
        }
        match self.tablearg {
            Some(v) => Some(v),
            None => {
                self.ctx.log.event(Event::TableArgMissing {
                    number: rule.number(),
                });
                None
            }
        }
    }

    fn exec_action(
        &mut self,
        idx: usize,
        rule: &Arc<Rule>,
        act: &ActionOp,
    ) -> Step {
        match act {
            ActionOp::Accept => self.done(rule, Verdict::Pass, None),
            ActionOp::Deny => self.done(rule, Verdict::Deny, None),
            ActionOp::Reject { code } => {
                if let Some(notifier) = self.ctx.reject
                    && reject_notice_allowed(self.pkt)
                {
                    notifier.notify(self.pkt, *code);
                }
                self.done(rule, Verdict::Deny, None)
            }
            ActionOp::Count => {
                rule.bump(self.bytes, self.now_ms);
                Step::Next
            }
            ActionOp::Skipto(target) => {
                rule.bump(self.bytes, self.now_ms);
                match self.arg16(*target, rule) {
                    Some(t) => Step::Jump(self.chain.skipto_index(idx, t)),
                    None => self.done(rule, Verdict::Deny, None),
                }
            }
            ActionOp::Divert(port) => match self.arg16(*port, rule) {
                Some(p) => self.done(rule, Verdict::Divert(p), None),
                None => self.done(rule, Verdict::Deny, None),
            },
            ActionOp::Tee(port) => match self.arg16(*port, rule) {
                Some(p) => self.done(rule, Verdict::Tee(p), None),
                None => self.done(rule, Verdict::Deny, None),
            },
            ActionOp::Pipe(id) => match self.arg32(*id, rule) {
                Some(id) => self.done(
                    rule,
                    Verdict::Dummynet { id, is_pipe: true },
                    None,
                ),
                None => self.done(rule, Verdict::Deny, None),
            },
            ActionOp::Queue(id) => match self.arg32(*id, rule) {
                Some(id) => self.done(
                    rule,
                    Verdict::Dummynet { id, is_pipe: false },
                    None,
                ),
                None => self.done(rule, Verdict::Deny, None),
            },
            ActionOp::Forward(sa) => {
                // Replies matched through state flow back unrouted;
                // only the forward direction gets the next hop.
                let forward = self
                    .dyn_dir
                    .is_none_or(|d| d == StateDir::Forward);
                if !forward {
                    return self.done(rule, Verdict::Pass, None);
                }
                if sa.ip().is_unspecified() {
                    match self.tablearg {
                        Some(v) => {
                            let nh = SocketAddrV4::new(
                                Ipv4Addr::from(v),
                                sa.port(),
                            );
                            self.done(rule, Verdict::Pass, Some(nh))
                        }
                        None => {
                            self.ctx.log.event(Event::TableArgMissing {
                                number: rule.number(),
                            });
                            self.done(rule, Verdict::Deny, None)
                        }
                    }
                } else {
                    self.done(rule, Verdict::Pass, Some(*sa))
                }
            }
            ActionOp::Netgraph(cookie) => match self.arg32(*cookie, rule) {
                Some(c) => self.done(rule, Verdict::Netgraph(c), None),
                None => self.done(rule, Verdict::Deny, None),
            },
            ActionOp::NgTee(cookie) => match self.arg32(*cookie, rule) {
                Some(c) => self.done(rule, Verdict::NgTee(c), None),
                None => self.done(rule, Verdict::Deny, None),
            },
            ActionOp::Nat(instance) => match self.ctx.nat {
                Some(handler) => match self.arg32(*instance, rule) {
                    Some(id) => {
                        let verdict = handler.translate(id, self.pkt);
                        self.done(rule, verdict, None)
                    }
                    None => self.done(rule, Verdict::Deny, None),
                },
                // No translator: fail closed.
                None => self.done(rule, Verdict::Deny, None),
            },
            ActionOp::Reass => {
                if !self.pkt.is_fragment() {
                    rule.bump(self.bytes, self.now_ms);
                    return Step::Next;
                }
                match self.ctx.reass {
                    Some(handler) => {
                        let verdict = handler.queue_fragment(self.pkt);
                        self.done(rule, verdict, None)
                    }
                    None => self.done(rule, Verdict::Deny, None),
                }
            }
            ActionOp::CheckState => match self.probe_state() {
                Some(target) => Step::JumpAction(target),
                // Miss: abandon this rule.
                None => Step::Next,
            },
        }
    }
}
