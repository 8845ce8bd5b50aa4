// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The engine: rule chain, per-packet interpreter, dynamic state, and
//! address tables.

pub mod action;
pub mod chain;
pub mod dynamic;
pub mod firewall;
pub mod interp;
pub mod packet;
pub mod rule;
pub mod table;
