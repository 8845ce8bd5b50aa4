// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A `slog`-backed implementation of the engine's log sink.

use slog::Logger;
use slog::info;
use slog::warn;

use crate::engine::action::Event;
use crate::engine::action::LogSink;

/// Routes engine diagnostics into a structured `slog` logger. Rule
/// matches log at info; everything else indicates trouble and logs at
/// warn.
pub struct SlogSink {
    log: Logger,
}

impl SlogSink {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

impl LogSink for SlogSink {
    fn event(&self, event: Event<'_>) {
        match event {
            Event::RuleMatch { number, flow, action } => {
                info!(self.log, "rule match";
                    "rule" => number,
                    "flow" => %flow,
                    "action" => %action,
                );
            }
            Event::StateInstallFailed { number, flow, reason } => {
                warn!(self.log, "state install failed, packet denied";
                    "rule" => number,
                    "flow" => %flow,
                    "reason" => reason,
                );
            }
            Event::StateJumpBroken { parent_number } => {
                warn!(self.log, "dynamic entry orphaned";
                    "parent" => parent_number,
                );
            }
            Event::TableArgMissing { number } => {
                warn!(self.log, "table argument requested but never set";
                    "rule" => number,
                );
            }
            Event::RulesExhausted { flow } => {
                warn!(self.log, "rule walk exhausted the chain";
                    "flow" => %flow,
                );
            }
        }
    }
}
