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

//! Serialized-mode map-side shuffle writer.
//!
//! A map task's output records are routed to a partition, serialized into
//! an opaque byte payload, and handed to an external sorter that tracks
//! only `(partition_id, insertion_index)` per record -- the payload itself
//! is never inspected or deserialized again on the write side. Memory
//! pressure triggers a spill to a temp file; closing the writer drains any
//! remaining in-memory records as one final spill, then a merge engine
//! streams every spill's per-partition byte ranges through a
//! [`writer_support::MapOutputWriter`] and commits.
//!
//! [`facade::ShuffleWriterFacade`] is the entry point a map task drives
//! directly. [`pair_writer::PartitionPairWriter`] is a lighter sibling for
//! callers that already know a record's destination partition and want to
//! skip the sort/spill machinery entirely.

pub mod buffer;
pub mod config;
pub mod error;
pub mod facade;
pub mod local_output;
pub mod memory;
pub mod merge;
pub mod metrics;
pub mod pair_writer;
pub mod partitioner;
pub mod pointer;
pub mod serializer;
pub mod shield;
pub mod sorter;
pub mod spill;
pub mod writer_support;

pub use config::ShuffleWriterConfig;
pub use error::{Result, ShuffleWriteError};
pub use facade::ShuffleWriterFacade;
pub use memory::{BudgetedMemoryManager, MemoryManager};
pub use pair_writer::PartitionPairWriter;
pub use partitioner::{FnPartitioner, Partitioner, SinglePartition};
pub use serializer::{CompressionCodec, NoopSerializerManager, RecordSerializer, SerializerManager};
pub use writer_support::{MapOutputWriter, MapStatus, PartitionWriter, ShuffleWriteSupport, ZeroCopyTarget};
