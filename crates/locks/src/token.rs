// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 rzlock contributors
//
// This file is part of rzlock.
//
// rzlock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// rzlock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with rzlock. If not, see <https://www.gnu.org/licenses/>.

//! Holder-token generation.
//!
//! A token is `PP` + base + counter: a two-digit zero-padded priority
//! (00–99, lower wins conflicts), a per-generator base (17 random
//! alphanumerics by default), and a process-monotonic decimal counter.
//! Byte-lexicographic order over the core token decides conflict
//! resolution, so the priority prefix dominates.
//!
//! Debug mode appends `" !!DEBUG!! "` plus a JSON blob after the core
//! token; [`core_token`] strips it before any comparison.

use crate::LockRole;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::sync::atomic::{AtomicU64, Ordering};

/// Marker separating the core token from debug metadata.
pub const DEBUG_SENTINEL: &str = " !!DEBUG!! ";

/// Length of a default token base.
pub const TOKEN_BASE_LEN: usize = 17;

/// Random alphanumeric token base (well above 64 bits of entropy).
pub fn random_base() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_BASE_LEN)
        .map(char::from)
        .collect()
}

/// The core token: everything before the debug sentinel.
pub fn core_token(token: &str) -> &str {
    match token.find(DEBUG_SENTINEL) {
        Some(at) => &token[..at],
        None => token,
    }
}

/// Produces unique, comparable holder tokens.
///
/// The counter is atomic, so concurrent acquisitions on one generator
/// never reuse a token; tokens are monotone within a process lifetime.
pub struct TokenGenerator {
    base: String,
    counter: AtomicU64,
    debug: bool,
}

impl TokenGenerator {
    /// Generator with a fresh random base.
    pub fn new(debug: bool) -> Self {
        Self::with_base(random_base(), debug)
    }

    /// Generator with an explicit base (lock sets pin theirs).
    pub fn with_base(base: impl Into<String>, debug: bool) -> Self {
        Self {
            base: base.into(),
            counter: AtomicU64::new(0),
            debug,
        }
    }

    /// The generator's own base.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Next token using the generator's base.
    pub fn next(&self, priority: u8, key: &str, role: LockRole) -> String {
        self.next_with_base(&self.base, priority, key, role)
    }

    /// Next token using an overridden base but the shared counter.
    pub fn next_with_base(&self, base: &str, priority: u8, key: &str, role: LockRole) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let core = format!("{:02}{}{}", priority.min(99), base, seq);
        if !self.debug {
            return core;
        }
        let meta = serde_json::json!({
            "key": key,
            "role": role.to_string(),
            "pid": std::process::id(),
            "seq": seq,
        });
        format!("{}{}{}", core, DEBUG_SENTINEL, meta)
    }
}
