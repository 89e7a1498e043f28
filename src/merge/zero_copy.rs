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

//! Zero-copy fast merge: valid only when fast-merge is enabled, nothing
//! needs decrypting, and the host's zero-copy transfer primitive is
//! available. Each spill file is opened once and its read cursor advances
//! monotonically across all partitions in order.

use std::fs::File;

use crate::error::{Result, ShuffleWriteError};
use crate::spill::SpillDescriptor;
use crate::writer_support::MapOutputWriter;

pub fn merge(
    spills: &[SpillDescriptor],
    map_writer: &mut dyn MapOutputWriter,
    num_partitions: u32,
) -> Result<Vec<u64>> {
    let mut files: Vec<File> = spills.iter().map(|s| s.open_reader()).collect::<std::io::Result<_>>()?;
    let mut positions = vec![0u64; spills.len()];
    let mut partition_lengths = vec![0u64; num_partitions as usize];

    for p in 0..num_partitions as usize {
        let mut partition_writer = map_writer.get_next_partition_writer()?;
        let mut total_for_partition = 0u64;

        for (i, spill) in spills.iter().enumerate() {
            let len = spill.partition_lengths[p];
            if len == 0 {
                continue;
            }
            let channel = partition_writer.to_channel().ok_or_else(|| {
                ShuffleWriteError::illegal_state("zero-copy transfer requested but no channel available")
            })?;
            let transferred = channel.transfer_from(&files[i], positions[i], len)?;
            if transferred != len {
                return Err(ShuffleWriteError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("zero-copy transfer of partition {p} from spill {i} was truncated"),
                )));
            }
            positions[i] += len;
            total_for_partition += len;
        }

        partition_writer.close()?;
        debug_assert_eq!(partition_writer.get_num_bytes_written(), total_for_partition);
        partition_lengths[p] = total_for_partition;
    }

    for (i, file) in files.iter_mut().enumerate() {
        let file_len = file.metadata()?.len();
        if positions[i] != file_len {
            return Err(ShuffleWriteError::illegal_state(format!(
                "spill {i} was not fully consumed: read {} of {file_len} bytes",
                positions[i]
            )));
        }
    }

    Ok(partition_lengths)
}
