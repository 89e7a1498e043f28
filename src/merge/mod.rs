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

//! The merge engine: selects a strategy based on spill count and
//! configuration, then drives the spills through it to produce the final
//! per-partition byte lengths.

mod stream;
mod zero_copy;

use std::io::{Read, Seek, SeekFrom, Write};

use crate::config::ShuffleWriterConfig;
use crate::error::Result;
use crate::metrics::WriteMetricsReporter;
use crate::serializer::{CompressionCodec, SerializerManager};
use crate::spill::SpillDescriptor;
use crate::writer_support::MapOutputWriter;

pub use stream::StreamMergeOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    NoSpill,
    SingleSpillFastCopy,
    ZeroCopyFastMerge,
    StreamFastMerge,
    SlowMerge,
}

pub struct MergeEngine<'a> {
    pub config: &'a ShuffleWriterConfig,
    pub codec: Option<&'a dyn CompressionCodec>,
    pub serializer_manager: &'a dyn SerializerManager,
    pub zero_copy_available: bool,
    pub shuffle_block_id_prefix: &'a str,
}

impl<'a> MergeEngine<'a> {
    /// Picks the strategy the spec's selection table assigns for this
    /// configuration, without looking at the spills themselves (only their
    /// count matters).
    pub fn select_strategy(&self, num_spills: usize) -> MergeStrategy {
        if num_spills == 0 {
            return MergeStrategy::NoSpill;
        }
        if num_spills == 1 {
            return MergeStrategy::SingleSpillFastCopy;
        }

        let concatenation_ok = !self.config.compress
            || self.codec.map(|c| c.supports_concatenation_of_serialized_streams()).unwrap_or(true);

        if self.config.fast_merge_enabled
            && concatenation_ok
            && self.zero_copy_available
            && !self.serializer_manager.encryption_enabled()
        {
            return MergeStrategy::ZeroCopyFastMerge;
        }
        if self.config.fast_merge_enabled && concatenation_ok {
            return MergeStrategy::StreamFastMerge;
        }
        MergeStrategy::SlowMerge
    }

    pub fn merge(
        &self,
        spills: &[SpillDescriptor],
        map_writer: &mut dyn MapOutputWriter,
        num_partitions: u32,
        metrics: &WriteMetricsReporter,
    ) -> Result<Vec<u64>> {
        let strategy = self.select_strategy(spills.len());
        log::info!("merge engine selected {strategy:?} for {} spills", spills.len());

        let partition_lengths = match strategy {
            MergeStrategy::NoSpill => no_spill(map_writer, num_partitions)?,
            MergeStrategy::SingleSpillFastCopy => {
                single_spill_fast_copy(&spills[0], map_writer, num_partitions)?
            }
            MergeStrategy::ZeroCopyFastMerge => zero_copy::merge(spills, map_writer, num_partitions)?,
            MergeStrategy::StreamFastMerge => {
                let opts = StreamMergeOptions {
                    serializer_manager: self.serializer_manager,
                    codec: None,
                    shuffle_block_id_prefix: self.shuffle_block_id_prefix,
                    input_buffer_size: self.config.file_buffer_size,
                };
                stream::merge(spills, map_writer, num_partitions, &opts, metrics)?
            }
            MergeStrategy::SlowMerge => {
                let opts = StreamMergeOptions {
                    serializer_manager: self.serializer_manager,
                    codec: self.codec,
                    shuffle_block_id_prefix: self.shuffle_block_id_prefix,
                    input_buffer_size: self.config.file_buffer_size,
                };
                stream::merge(spills, map_writer, num_partitions, &opts, metrics)?
            }
        };

        // The sorter's final in-memory drain is already counted as
        // shuffle-write bytes when it happened; the merge re-streams that
        // last spill's bytes through the output, double counting them
        // unless corrected here. N=1 never incremented the metric in the
        // first place, so there is nothing to undo; N=0 never wrote
        // anything.
        if spills.len() >= 2 {
            let last_spill_len = spills.last().unwrap().file_size();
            metrics.dec_bytes_written(last_spill_len);
        }

        Ok(partition_lengths)
    }
}

/// Zero records were ever inserted. Every `MapOutputWriter` implementation
/// still expects exactly `num_partitions` writers to be requested and closed
/// before `commit_all_partitions` -- skipping that here left
/// `LocalMapOutputWriter`'s own bookkeeping short and `commit_all_partitions`
/// failing with `IllegalState` on every empty write.
fn no_spill(map_writer: &mut dyn MapOutputWriter, num_partitions: u32) -> Result<Vec<u64>> {
    for _ in 0..num_partitions {
        let mut partition_writer = map_writer.get_next_partition_writer()?;
        partition_writer.close()?;
    }
    Ok(vec![0u64; num_partitions as usize])
}

/// The spill input stream is opened once, outside the per-partition loop,
/// and closed only after every partition has been copied -- the upstream
/// source this crate is modeled on nests the close inside the loop, which
/// closes the stream after the first partition and leaves later partitions
/// reading from a closed file. That's a bug; this keeps one handle open for
/// the whole copy.
fn single_spill_fast_copy(
    spill: &SpillDescriptor,
    map_writer: &mut dyn MapOutputWriter,
    num_partitions: u32,
) -> Result<Vec<u64>> {
    let mut file = spill.open_reader()?;
    let mut partition_lengths = vec![0u64; num_partitions as usize];
    let mut position = 0u64;

    for p in 0..num_partitions as usize {
        let len = spill.partition_lengths[p];
        let mut partition_writer = map_writer.get_next_partition_writer()?;

        if len > 0 {
            file.seek(SeekFrom::Start(position))?;
            let mut limited = (&file).take(len);
            let mut out = partition_writer.to_stream();
            std::io::copy(&mut limited, &mut out)?;
            position += len;
        }
        partition_writer.close()?;
        partition_lengths[p] = len;
    }
    Ok(partition_lengths)
}
