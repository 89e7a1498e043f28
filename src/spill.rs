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

//! A spill descriptor: one sorted run written to a temp file, plus the
//! per-partition byte lengths needed to locate each partition's slice
//! without re-reading the whole file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::pointer::{decode_index, decode_partition, Page, RecordLocation};
use crate::serializer::{CompressionCodec, SerializerManager};
use crate::shield::ShieldedWriter;

#[derive(Debug, Clone)]
pub struct SpillDescriptor {
    pub file_path: PathBuf,
    pub partition_lengths: Vec<u64>,
}

impl SpillDescriptor {
    pub fn file_size(&self) -> u64 {
        self.partition_lengths.iter().sum()
    }

    /// Byte range of partition `p` within the spill file.
    pub fn partition_range(&self, p: usize) -> Range<u64> {
        let start: u64 = self.partition_lengths[..p].iter().sum();
        start..start + self.partition_lengths[p]
    }

    pub fn open_reader(&self) -> std::io::Result<File> {
        File::open(&self.file_path)
    }

    pub fn delete(&self) -> std::io::Result<()> {
        if self.file_path.exists() {
            std::fs::remove_file(&self.file_path)?;
        }
        Ok(())
    }
}

/// Streams records in sorted-key order to a fresh file at `path`, recording
/// per-partition byte totals. `sorted_keys` must already be sorted by
/// partition id (see [`crate::pointer::sort_keys`]).
///
/// Each partition's contiguous run of records is written through the same
/// encrypt-then-compress chain the merge engine later reverses: a fast
/// merge across several spills just needs to concatenate these segments (or,
/// when encryption is on, un/rewrap it) rather than decode anything. Spill
/// files are therefore opaque from the merge engine's point of view, the
/// same way the final shuffle output is.
#[allow(clippy::too_many_arguments)]
pub fn write_spill_file(
    path: &Path,
    sorted_keys: &[u64],
    pages: &[Page],
    locations: &[RecordLocation],
    num_partitions: u32,
    serializer_manager: &dyn SerializerManager,
    codec: Option<&dyn CompressionCodec>,
    shuffle_block_id_prefix: &str,
) -> Result<SpillDescriptor> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut partition_lengths = vec![0u64; num_partitions as usize];

    let mut i = 0;
    while i < sorted_keys.len() {
        let partition_id = decode_partition(sorted_keys[i]) as usize;
        let seg_start = i;
        while i < sorted_keys.len() && decode_partition(sorted_keys[i]) as usize == partition_id {
            i += 1;
        }

        let block_id = format!("{shuffle_block_id_prefix}-{partition_id}");
        let mut counted = CountingWriter { inner: &mut writer, count: 0 };
        {
            let shielded = ShieldedWriter::new(&mut counted);
            let mut chain = build_output_chain(shielded, serializer_manager, codec, &block_id)?;
            for &key in &sorted_keys[seg_start..i] {
                let location = locations[decode_index(key) as usize];
                let record = pages[location.page_index as usize].read_record(location.offset);
                chain.write_all(record)?;
            }
            // LIFO: dropping `chain` flushes compression/encryption trailers
            // before the shield (and thus the counter/file) goes away.
            chain.flush()?;
        }
        partition_lengths[partition_id] += counted.count;
    }
    writer.flush()?;

    Ok(SpillDescriptor {
        file_path: path.to_path_buf(),
        partition_lengths,
    })
}

struct CountingWriter<'w> {
    inner: &'w mut dyn Write,
    count: u64,
}

impl<'w> Write for CountingWriter<'w> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn build_output_chain<'a>(
    shielded: ShieldedWriter<'a>,
    serializer_manager: &dyn SerializerManager,
    codec: Option<&dyn CompressionCodec>,
    block_id: &str,
) -> Result<Box<dyn Write + 'a>> {
    let encrypted: Box<dyn Write + 'a> = if serializer_manager.encryption_enabled() {
        serializer_manager.wrap_stream(block_id, Box::new(shielded))?
    } else {
        Box::new(shielded)
    };
    Ok(match codec {
        Some(c) => c.compressed_output_stream(encrypted),
        None => encrypted,
    })
}
