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

//! The write-metrics collaborator. Bytes-written here is the counter the
//! merge engine's double-count correction (see [`crate::merge`]) reconciles
//! against; it must equal `sum(partition_lengths)` once the task commits.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct WriteMetricsReporter {
    bytes_written: AtomicU64,
    records_written: AtomicU64,
    write_time_ns: AtomicU64,
}

impl WriteMetricsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_bytes_written(&self, delta: u64) {
        self.bytes_written.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn dec_bytes_written(&self, delta: u64) {
        self.bytes_written.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn inc_records_written(&self, delta: u64) {
        self.records_written.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc_write_time(&self, nanos: u64) {
        self.write_time_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    pub fn write_time_ns(&self) -> u64 {
        self.write_time_ns.load(Ordering::Relaxed)
    }
}
