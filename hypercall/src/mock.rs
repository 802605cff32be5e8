// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! A recording transport for tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::{HypercallId, HypercallTransport};

/// Transport that records every call and replays scripted results.
///
/// Unscripted calls succeed: `CreateVm` hands out incrementing VM ids
/// starting at 1, `Gpa2Hpa` performs an identity translation, everything
/// else returns 0.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<(HypercallId, [u64; 4])>>,
    scripted: Mutex<HashMap<HypercallId, VecDeque<i64>>>,
    next_vmid: AtomicI64,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
            next_vmid: AtomicI64::new(1),
        }
    }

    /// Queue a result for the next call with this opcode.
    pub fn script(&self, id: HypercallId, ret: i64) {
        self.scripted
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .push_back(ret);
    }

    /// All calls issued so far, in order.
    pub fn calls(&self) -> Vec<(HypercallId, [u64; 4])> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls issued with this opcode.
    pub fn count(&self, id: HypercallId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == id)
            .count()
    }
}

impl HypercallTransport for MockTransport {
    fn hypercall(&self, id: HypercallId, args: [u64; 4]) -> i64 {
        self.calls.lock().unwrap().push((id, args));

        if let Some(ret) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(|q| q.pop_front())
        {
            return ret;
        }

        match id {
            HypercallId::CreateVm => self.next_vmid.fetch_add(1, Ordering::SeqCst),
            HypercallId::Gpa2Hpa => args[1] as i64,
            _ => 0,
        }
    }
}
