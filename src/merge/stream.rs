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

//! Stream fast/slow merge.
//!
//! Both merge strategies that cannot use zero-copy transfer share this
//! path; they differ only in whether `codec` is `Some` (slow merge: fully
//! decode and re-encode) or `None` (fast merge: opaque compressed frames
//! are concatenated untouched, only encryption is unwrapped/rewrapped).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Instant;

use crate::error::Result;
use crate::metrics::WriteMetricsReporter;
use crate::serializer::{CompressionCodec, SerializerManager};
use crate::shield::ShieldedWriter;
use crate::spill::SpillDescriptor;
use crate::writer_support::MapOutputWriter;

pub struct StreamMergeOptions<'a> {
    pub serializer_manager: &'a dyn SerializerManager,
    pub codec: Option<&'a dyn CompressionCodec>,
    pub shuffle_block_id_prefix: &'a str,
    pub input_buffer_size: usize,
}

pub fn merge(
    spills: &[SpillDescriptor],
    map_writer: &mut dyn MapOutputWriter,
    num_partitions: u32,
    opts: &StreamMergeOptions<'_>,
    metrics: &WriteMetricsReporter,
) -> Result<Vec<u64>> {
    let mut files: Vec<File> = spills.iter().map(|s| s.open_reader()).collect::<std::io::Result<_>>()?;
    let mut positions = vec![0u64; spills.len()];
    let mut partition_lengths = vec![0u64; num_partitions as usize];

    let result = (|| -> Result<()> {
        for p in 0..num_partitions as usize {
            let mut partition_writer = map_writer.get_next_partition_writer()?;
            let block_id = format!("{}-{}", opts.shuffle_block_id_prefix, p);

            {
                let raw = partition_writer.to_stream();
                let shielded = ShieldedWriter::new(raw);
                let mut chain = build_output_chain(shielded, opts, &block_id)?;

                for (i, spill) in spills.iter().enumerate() {
                    let len = spill.partition_lengths[p];
                    if len == 0 {
                        continue;
                    }
                    let mut src = files[i].try_clone()?;
                    src.seek(SeekFrom::Start(positions[i]))?;
                    let limited = src.take(len);
                    let mut input_chain = build_input_chain(limited, opts, &block_id)?;

                    let started = Instant::now();
                    std::io::copy(&mut input_chain, &mut chain)?;
                    metrics.inc_write_time(started.elapsed().as_nanos() as u64);

                    positions[i] += len;
                }
                // LIFO: dropping `chain` flushes compression/encryption
                // trailers before the shield (and thus the partition sink)
                // goes out of scope.
                chain.flush()?;
            }

            partition_writer.close()?;
            partition_lengths[p] = partition_writer.get_num_bytes_written();
        }
        Ok(())
    })();

    // File handles close via Drop; any close-time error from the partition
    // writer itself was already captured above as part of the primary
    // result, so there is no secondary error left to reconcile here.
    result.map(|_| partition_lengths)
}

fn build_output_chain<'a>(
    shielded: ShieldedWriter<'a>,
    opts: &StreamMergeOptions<'_>,
    block_id: &str,
) -> Result<Box<dyn Write + 'a>> {
    let encrypted: Box<dyn Write + 'a> = if opts.serializer_manager.encryption_enabled() {
        opts.serializer_manager.wrap_stream(block_id, Box::new(shielded))?
    } else {
        Box::new(shielded)
    };
    let compressed: Box<dyn Write + 'a> = match opts.codec {
        Some(codec) => codec.compressed_output_stream(encrypted),
        None => encrypted,
    };
    Ok(compressed)
}

fn build_input_chain<'a, R: Read + 'a>(
    reader: R,
    opts: &StreamMergeOptions<'_>,
    block_id: &str,
) -> Result<Box<dyn Read + 'a>> {
    let decrypted: Box<dyn Read + 'a> = if opts.serializer_manager.encryption_enabled() {
        opts.serializer_manager.wrap_input(block_id, Box::new(reader))?
    } else {
        Box::new(reader)
    };
    let decompressed: Box<dyn Read + 'a> = match opts.codec {
        Some(codec) => codec.compressed_input_stream(decrypted),
        None => decrypted,
    };
    Ok(decompressed)
}
