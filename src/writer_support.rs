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

//! Collaborator interfaces for the final artifact: the map output writer
//! and the per-partition sinks it hands out. This crate only consumes
//! these traits; registering the finished artifact with the driver and
//! transporting it to readers happens outside this crate.

use std::io::Write;

use crate::error::{Result, ShuffleWriteError};

/// Produces a [`MapOutputWriter`] for one map task's output.
pub trait ShuffleWriteSupport: Send + Sync {
    fn create_map_output_writer(
        &self,
        shuffle_id: u32,
        map_id: u64,
        num_partitions: u32,
    ) -> Result<Box<dyn MapOutputWriter>>;
}

/// The in-progress map output artifact. Partition writers must be consumed
/// in strict ascending partition order, exactly `num_partitions` times.
pub trait MapOutputWriter {
    fn get_next_partition_writer(&mut self) -> Result<Box<dyn PartitionWriter + '_>>;

    /// Finalizes the artifact. Only called after every partition writer has
    /// been obtained and closed.
    fn commit_all_partitions(&mut self) -> Result<MapStatus>;

    /// Discards any partial artifact. Failures here are logged, never
    /// allowed to mask the error that triggered the abort.
    fn abort(&mut self, err: &ShuffleWriteError) -> Result<()>;
}

/// A transient sink for exactly one partition's bytes. Bytes-written is
/// reported cumulative for *this* writer only -- a fresh partition writer
/// always starts its own count at zero.
pub trait PartitionWriter {
    fn to_stream(&mut self) -> Box<dyn Write + '_>;

    /// A channel usable with the host's zero-copy transfer primitive, when
    /// available.
    fn to_channel(&mut self) -> Option<&mut dyn ZeroCopyTarget>;

    fn get_num_bytes_written(&self) -> u64;

    fn close(&mut self) -> Result<()>;
}

/// The write side of a zero-copy transfer: something bytes can be moved
/// into directly from another file descriptor's current position, without
/// bouncing through a user-space buffer.
pub trait ZeroCopyTarget {
    /// Transfers exactly `count` bytes from `src` starting at `src_offset`,
    /// advancing neither the source's persistent position field the caller
    /// tracks (the caller does that) nor requiring `src` itself to be
    /// seeked first.
    fn transfer_from(
        &mut self,
        src: &std::fs::File,
        src_offset: u64,
        count: u64,
    ) -> std::io::Result<u64>;
}

/// Per-partition byte lengths, sufficient for reducers to plan fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapStatus {
    pub partition_lengths: Vec<u64>,
}
