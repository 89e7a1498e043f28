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

//! The writer facade: the one entry point a map task drives. Owns the
//! sorter, orchestrates serialize -> insert -> spill -> merge -> commit,
//! and is responsible for the cleanup discipline on every exit path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::SerializationBuffer;
use crate::config::ShuffleWriterConfig;
use crate::error::{Result, ShuffleWriteError};
use crate::memory::MemoryManager;
use crate::merge::MergeEngine;
use crate::metrics::WriteMetricsReporter;
use crate::partitioner::Partitioner;
use crate::serializer::{CompressionCodec, RecordSerializer, SerializerManager};
use crate::sorter::ExternalPartitionSorter;
use crate::writer_support::{MapStatus, ShuffleWriteSupport};

pub struct ShuffleWriterFacade<'a, K, V> {
    shuffle_id: u32,
    map_id: u64,
    num_partitions: u32,
    config: ShuffleWriterConfig,
    partitioner: &'a dyn Partitioner<K>,
    record_serializer: &'a dyn RecordSerializer<K, V>,
    serializer_manager: &'a dyn SerializerManager,
    codec: Option<&'a dyn CompressionCodec>,
    write_support: &'a dyn ShuffleWriteSupport,
    metrics: Arc<WriteMetricsReporter>,
    sorter: ExternalPartitionSorter<'a>,
    buffer: SerializationBuffer,
    peak_memory: Arc<std::sync::atomic::AtomicUsize>,
    committed_status: Option<MapStatus>,
    stopped: AtomicBool,
}

impl<'a, K, V> ShuffleWriterFacade<'a, K, V> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shuffle_id: u32,
        map_id: u64,
        config: ShuffleWriterConfig,
        partitioner: &'a dyn Partitioner<K>,
        record_serializer: &'a dyn RecordSerializer<K, V>,
        serializer_manager: &'a dyn SerializerManager,
        codec: Option<&'a dyn CompressionCodec>,
        write_support: &'a dyn ShuffleWriteSupport,
        memory_manager: Arc<dyn MemoryManager>,
        spill_dir: PathBuf,
    ) -> Result<Self> {
        let num_partitions = partitioner.num_partitions();
        ShuffleWriterConfig::check_partition_ceiling(num_partitions)?;

        let shuffle_block_id_prefix = format!("shuffle_{shuffle_id}_{map_id}");
        let spill_codec = if config.compress { codec } else { None };
        let metrics = Arc::new(WriteMetricsReporter::new());

        Ok(ShuffleWriterFacade {
            shuffle_id,
            map_id,
            num_partitions,
            sorter: ExternalPartitionSorter::new(
                num_partitions,
                memory_manager,
                spill_dir,
                serializer_manager,
                spill_codec,
                shuffle_block_id_prefix,
                metrics.clone(),
            ),
            buffer: SerializationBuffer::with_capacity(config.sort_init_buffer_size.max(64) * 16),
            config,
            partitioner,
            record_serializer,
            serializer_manager,
            codec,
            write_support,
            metrics,
            peak_memory: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            committed_status: None,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn metrics(&self) -> &WriteMetricsReporter {
        &self.metrics
    }

    /// Consumes a finite sequence of `(key, value)` pairs: each is routed
    /// to its partition by the partitioner, serialized key-then-value into
    /// the reusable buffer, and handed to the sorter. On any failure the
    /// sorter's resources are released before the error is returned.
    pub fn write(&mut self, records: impl IntoIterator<Item = (K, V)>) -> Result<()> {
        if let Err(err) = self.insert_all(records) {
            self.sorter.cleanup_resources();
            return Err(err);
        }
        self.close_and_write_output()
    }

    fn insert_all(&mut self, records: impl IntoIterator<Item = (K, V)>) -> Result<()> {
        for (key, value) in records {
            let partition_id = self.partitioner.get_partition(&key);

            self.buffer.reset();
            self.record_serializer.write_key(&key, &mut self.buffer)?;
            self.record_serializer.write_value(&value, &mut self.buffer)?;

            let bytes = self.buffer.raw_view();
            debug_assert!(!bytes.is_empty(), "serialized record must be non-empty");

            self.sorter.insert(bytes, partition_id)?;
            self.metrics.inc_records_written(1);
        }
        Ok(())
    }

    /// (1) snapshots peak memory, (2) drops the serialization buffer, (3)
    /// collects spills, (4) opens a map output writer, (5) merges, (6)
    /// deletes every spill file (best effort), (7) commits. Any failure
    /// before commit triggers an abort of the map output writer.
    fn close_and_write_output(&mut self) -> Result<()> {
        self.peak_memory
            .fetch_max(self.sorter.peak_memory_used(), Ordering::Relaxed);
        self.buffer = SerializationBuffer::with_capacity(0);

        let spills = self.sorter.close_and_get_spills()?;

        let mut map_writer = self
            .write_support
            .create_map_output_writer(self.shuffle_id, self.map_id, self.num_partitions)?;

        let merge_engine = MergeEngine {
            config: &self.config,
            codec: self.codec,
            serializer_manager: self.serializer_manager,
            zero_copy_available: self.config.transfer_to_enabled,
            shuffle_block_id_prefix: &format!("shuffle_{}_{}", self.shuffle_id, self.map_id),
        };

        let merge_result = merge_engine.merge(&spills, map_writer.as_mut(), self.num_partitions, &self.metrics);

        // spill deletion failures are logged, never fail the task
        if let Err(err) = delete_spills(&spills) {
            log::warn!("failed to delete one or more spill files: {err}");
        }

        let lengths = match merge_result {
            Ok(lengths) => lengths,
            Err(err) => {
                if let Err(abort_err) = map_writer.abort(&err) {
                    log::warn!("map output writer abort failed: {abort_err}");
                }
                return Err(err);
            }
        };
        self.metrics.inc_bytes_written(lengths.iter().sum());

        match map_writer.commit_all_partitions() {
            Ok(status) => {
                self.committed_status = Some(status);
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = map_writer.abort(&err) {
                    log::warn!("map output writer abort failed: {abort_err}");
                }
                Err(err)
            }
        }
    }

    /// Idempotent. Records peak memory into the task metrics; on success
    /// returns the map status, on failure releases sorter resources and
    /// returns nothing.
    pub fn stop(&mut self, success: bool) -> Result<Option<MapStatus>> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        self.peak_memory
            .fetch_max(self.sorter.peak_memory_used(), Ordering::Relaxed);

        if success {
            if self.committed_status.is_none() {
                return Err(ShuffleWriteError::illegal_state(
                    "stop(true) called without a prior successful write()",
                ));
            }
            Ok(self.committed_status.clone())
        } else {
            self.sorter.cleanup_resources();
            Ok(None)
        }
    }

    pub fn peak_memory_used(&self) -> usize {
        self.peak_memory.load(Ordering::Relaxed)
    }
}

fn delete_spills(spills: &[crate::spill::SpillDescriptor]) -> std::result::Result<(), String> {
    let mut first_err = None;
    for spill in spills {
        if let Err(err) = spill.delete() {
            log::warn!("failed to delete spill file {:?}: {err}", spill.file_path);
            first_err.get_or_insert(err.to_string());
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
