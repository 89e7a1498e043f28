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

//! The external partition sorter.
//!
//! Records are packed into pages as they arrive; their packed `(partition,
//! insertion index)` keys live in a separate array so that spilling only
//! has to sort and stream 8-byte words, not move payload bytes. When the
//! memory manager denies a page request, the sorter spills the sorted
//! in-memory run to a temp file and starts over with empty pages.
//!
//! Spilling may be invoked either by `insert` (when a page can't be
//! allocated) or externally by the memory manager from another thread
//! holding its own lock; either way the sorter's own state is protected by
//! a single mutex, and re-entrant `spill()` calls are rejected rather than
//! deadlocking.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, ShuffleWriteError};
use crate::memory::MemoryManager;
use crate::metrics::WriteMetricsReporter;
use crate::pointer::{encode_key, sort_keys, Page, RecordLocation};
use crate::serializer::{CompressionCodec, SerializerManager};
use crate::spill::{write_spill_file, SpillDescriptor};

const DEFAULT_PAGE_SIZE: usize = 4 << 20; // 4 MiB

struct SorterState {
    pages: Vec<Page>,
    locations: Vec<RecordLocation>,
    keys: Vec<u64>,
    spills: Vec<SpillDescriptor>,
    granted_bytes: usize,
}

impl SorterState {
    fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub struct ExternalPartitionSorter<'a> {
    memory_manager: Arc<dyn MemoryManager>,
    num_partitions: u32,
    page_size: usize,
    spill_dir: PathBuf,
    spill_seq: AtomicUsize,
    state: Mutex<SorterState>,
    spilling: AtomicBool,
    peak_memory: AtomicUsize,
    serializer_manager: &'a dyn SerializerManager,
    codec: Option<&'a dyn CompressionCodec>,
    shuffle_block_id_prefix: String,
    metrics: Arc<WriteMetricsReporter>,
}

impl<'a> fmt::Debug for ExternalPartitionSorter<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalPartitionSorter")
            .field("num_partitions", &self.num_partitions)
            .field("granted_bytes", &self.memory_manager.granted())
            .field("peak_memory", &self.peak_memory_used())
            .finish()
    }
}

impl<'a> ExternalPartitionSorter<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_partitions: u32,
        memory_manager: Arc<dyn MemoryManager>,
        spill_dir: PathBuf,
        serializer_manager: &'a dyn SerializerManager,
        codec: Option<&'a dyn CompressionCodec>,
        shuffle_block_id_prefix: String,
        metrics: Arc<WriteMetricsReporter>,
    ) -> Self {
        ExternalPartitionSorter {
            memory_manager,
            num_partitions,
            page_size: DEFAULT_PAGE_SIZE,
            spill_dir,
            spill_seq: AtomicUsize::new(0),
            state: Mutex::new(SorterState {
                pages: Vec::new(),
                locations: Vec::new(),
                keys: Vec::new(),
                spills: Vec::new(),
                granted_bytes: 0,
            }),
            spilling: AtomicBool::new(false),
            peak_memory: AtomicUsize::new(0),
            serializer_manager,
            codec,
            shuffle_block_id_prefix,
            metrics,
        }
    }

    pub fn insert(&self, payload: &[u8], partition_id: u32) -> Result<()> {
        debug_assert!(partition_id < self.num_partitions);
        let needed = 4 + payload.len();

        loop {
            {
                let mut state = self.state.lock();
                if let Some(page) = state.pages.last_mut() {
                    if page.remaining() >= needed {
                        let page_index = (state.pages.len() - 1) as u32;
                        let offset = page.push_record(payload);
                        let index = state.keys.len() as u32;
                        state.locations.push(RecordLocation { page_index, offset });
                        state.keys.push(encode_key(partition_id, index));
                        self.update_peak(state.granted_bytes);
                        return Ok(());
                    }
                }
            }

            let page_size = self.page_size.max(needed);
            if self.memory_manager.acquire(page_size) {
                let mut state = self.state.lock();
                state.pages.push(Page::with_capacity(page_size));
                state.granted_bytes += page_size;
                self.update_peak(state.granted_bytes);
                continue;
            }

            // Denied: spill to reclaim memory, then retry once more before
            // giving up with OutOfMemory.
            self.spill()?;
            if self.memory_manager.acquire(page_size) {
                let mut state = self.state.lock();
                state.pages.push(Page::with_capacity(page_size));
                state.granted_bytes += page_size;
                self.update_peak(state.granted_bytes);
                continue;
            }
            return Err(ShuffleWriteError::OutOfMemory { requested: page_size });
        }
    }

    /// Sorts the in-memory pointer array by partition, streams it to a
    /// fresh spill file, then releases all pages back to the memory
    /// manager. No-op if there is nothing buffered.
    pub fn spill(&self) -> Result<()> {
        if self
            .spilling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ShuffleWriteError::illegal_state(
                "spill() called re-entrantly on the same sorter",
            ));
        }
        let result = self.spill_inner();
        self.spilling.store(false, Ordering::SeqCst);
        result
    }

    fn spill_inner(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_empty() {
            return Ok(());
        }

        sort_keys(&mut state.keys);

        let seq = self.spill_seq.fetch_add(1, Ordering::SeqCst);
        let path = self.spill_dir.join(format!("shuffle-spill-{seq:08}.bin"));
        log::info!(
            "external partition sorter spilling {} records ({} bytes granted)",
            state.keys.len(),
            state.granted_bytes
        );

        let descriptor = write_spill_file(
            &path,
            &state.keys,
            &state.pages,
            &state.locations,
            self.num_partitions,
            self.serializer_manager,
            self.codec,
            &self.shuffle_block_id_prefix,
        )?;

        let freed = state.granted_bytes;
        state.pages.clear();
        state.locations.clear();
        state.keys.clear();
        state.granted_bytes = 0;
        state.spills.push(descriptor);
        drop(state);

        self.memory_manager.release(freed);
        Ok(())
    }

    /// Performs one final spill if records remain, then hands back every
    /// spill produced so far. That final drain -- if it actually wrote
    /// anything -- is accounted as shuffle-write bytes here, not spill
    /// bytes; the merge engine's double-count correction (see
    /// `crate::merge`) assumes this already happened by the time it runs.
    pub fn close_and_get_spills(&self) -> Result<Vec<SpillDescriptor>> {
        let spills_before = self.state.lock().spills.len();
        self.spill()?;
        let mut state = self.state.lock();
        if state.spills.len() > spills_before {
            self.metrics.inc_bytes_written(state.spills.last().unwrap().file_size());
        }
        Ok(std::mem::take(&mut state.spills))
    }

    pub fn peak_memory_used(&self) -> usize {
        self.peak_memory.load(Ordering::Relaxed)
    }

    fn update_peak(&self, current: usize) {
        self.peak_memory.fetch_max(current, Ordering::Relaxed);
    }

    /// Idempotent: deletes any spill files still owned by this sorter and
    /// releases any granted pages. Safe to call after a failed write loop
    /// or after `close_and_get_spills` has already drained everything.
    pub fn cleanup_resources(&self) {
        let mut state = self.state.lock();
        let freed = state.granted_bytes;
        state.pages.clear();
        state.locations.clear();
        state.keys.clear();
        state.granted_bytes = 0;
        if freed > 0 {
            self.memory_manager.release(freed);
        }

        for spill in state.spills.drain(..) {
            if let Err(err) = spill.delete() {
                log::warn!("failed to delete spill file {:?}: {err}", spill.file_path);
            }
        }
    }
}
