// Copyright 2022 The Blaze Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The memory manager collaborator: grants and revokes the pages backing
//! the external sorter. This crate only depends on the narrow interface it
//! needs; the grant/eviction policy itself lives outside this crate.

/// Page and pointer-array budget granted to one sorter. Implementations may
/// back this with a shared pool across concurrently running tasks; from the
/// sorter's point of view it only ever sees accept/deny answers.
pub trait MemoryManager: Send + Sync {
    /// Requests `size` additional bytes. Returns `true` if granted. A
    /// denial here is the sorter's cue to spill before retrying.
    fn acquire(&self, size: usize) -> bool;

    /// Releases `size` bytes previously granted via `acquire`.
    fn release(&self, size: usize);

    /// Bytes currently granted to this consumer.
    fn granted(&self) -> usize;
}

/// A simple byte-budgeted manager suitable for a single-task process: every
/// `acquire` beyond the configured budget is denied outright, leaving it to
/// the caller (the external sorter) to spill and retry. Also supports
/// forcing every insert to spill, used to exercise the "spill after every
/// record" boundary behavior.
pub struct BudgetedMemoryManager {
    inner: parking_lot::Mutex<BudgetedState>,
}

struct BudgetedState {
    budget: usize,
    granted: usize,
}

impl BudgetedMemoryManager {
    pub fn new(budget: usize) -> Self {
        BudgetedMemoryManager {
            inner: parking_lot::Mutex::new(BudgetedState { budget, granted: 0 }),
        }
    }

    /// A manager that denies every request, forcing the sorter to spill
    /// before every single insert.
    pub fn always_deny() -> Self {
        BudgetedMemoryManager::new(0)
    }
}

impl MemoryManager for BudgetedMemoryManager {
    fn acquire(&self, size: usize) -> bool {
        let mut state = self.inner.lock();
        if state.granted + size <= state.budget {
            state.granted += size;
            true
        } else {
            false
        }
    }

    fn release(&self, size: usize) {
        let mut state = self.inner.lock();
        state.granted = state.granted.saturating_sub(size);
    }

    fn granted(&self) -> usize {
        self.inner.lock().granted
    }
}
