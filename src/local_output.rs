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

//! A filesystem-backed [`ShuffleWriteSupport`] implementation: one data
//! file with partitions concatenated in ascending order, plus an index
//! file of `num_partitions + 1` little-endian `u64` cumulative offsets —
//! the layout this crate's tests and doctests exercise end to end. Real
//! deployments plug in their own writer (object store, RDMA, whatever);
//! this one stands in for "out of scope" components listed in the spec.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{Result, ShuffleWriteError};
use crate::writer_support::{
    MapOutputWriter, MapStatus, PartitionWriter, ShuffleWriteSupport, ZeroCopyTarget,
};

pub struct LocalDiskShuffleWriteSupport {
    pub base_dir: PathBuf,
}

impl LocalDiskShuffleWriteSupport {
    pub fn new(base_dir: PathBuf) -> Self {
        LocalDiskShuffleWriteSupport { base_dir }
    }
}

impl ShuffleWriteSupport for LocalDiskShuffleWriteSupport {
    fn create_map_output_writer(
        &self,
        shuffle_id: u32,
        map_id: u64,
        num_partitions: u32,
    ) -> Result<Box<dyn MapOutputWriter>> {
        let data_path = self.base_dir.join(format!("shuffle_{shuffle_id}_{map_id}.data"));
        let index_path = self.base_dir.join(format!("shuffle_{shuffle_id}_{map_id}.index"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;
        Ok(Box::new(LocalMapOutputWriter {
            data_path,
            index_path,
            file,
            num_partitions,
            next_partition: 0,
            partition_lengths: vec![0; num_partitions as usize],
        }))
    }
}

pub struct LocalMapOutputWriter {
    data_path: PathBuf,
    index_path: PathBuf,
    file: File,
    num_partitions: u32,
    next_partition: u32,
    partition_lengths: Vec<u64>,
}

impl MapOutputWriter for LocalMapOutputWriter {
    fn get_next_partition_writer(&mut self) -> Result<Box<dyn PartitionWriter + '_>> {
        if self.next_partition >= self.num_partitions {
            return Err(ShuffleWriteError::illegal_state(
                "get_next_partition_writer called more than num_partitions times",
            ));
        }
        let idx = self.next_partition as usize;
        self.next_partition += 1;

        let mut clone = self.file.try_clone()?;
        clone.seek(SeekFrom::End(0))?;

        Ok(Box::new(LocalPartitionWriter {
            file: clone,
            bytes_written: 0,
            length_slot: &mut self.partition_lengths[idx],
        }))
    }

    fn commit_all_partitions(&mut self) -> Result<MapStatus> {
        if self.next_partition != self.num_partitions {
            return Err(ShuffleWriteError::illegal_state(format!(
                "commit requested after only {} of {} partition writers were consumed",
                self.next_partition, self.num_partitions
            )));
        }
        self.file.flush()?;
        write_index_file(&self.index_path, &self.partition_lengths)?;
        Ok(MapStatus {
            partition_lengths: self.partition_lengths.clone(),
        })
    }

    fn abort(&mut self, err: &ShuffleWriteError) -> Result<()> {
        log::warn!("aborting map output writer after error: {err}");
        let _ = std::fs::remove_file(&self.data_path);
        let _ = std::fs::remove_file(&self.index_path);
        Ok(())
    }
}

fn write_index_file(path: &Path, partition_lengths: &[u64]) -> Result<()> {
    let mut index = File::create(path)?;
    let mut offset = 0u64;
    index.write_u64::<LittleEndian>(offset)?;
    for &len in partition_lengths {
        offset += len;
        index.write_u64::<LittleEndian>(offset)?;
    }
    index.flush()?;
    Ok(())
}

struct LocalPartitionWriter<'a> {
    file: File,
    bytes_written: u64,
    length_slot: &'a mut u64,
}

impl<'a> PartitionWriter for LocalPartitionWriter<'a> {
    fn to_stream(&mut self) -> Box<dyn Write + '_> {
        Box::new(CountingWriter {
            inner: &mut self.file,
            counter: &mut self.bytes_written,
        })
    }

    fn to_channel(&mut self) -> Option<&mut dyn ZeroCopyTarget> {
        Some(self)
    }

    fn get_num_bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn close(&mut self) -> Result<()> {
        self.file.flush()?;
        *self.length_slot = self.bytes_written;
        Ok(())
    }
}

impl<'a> ZeroCopyTarget for LocalPartitionWriter<'a> {
    fn transfer_from(
        &mut self,
        src: &File,
        src_offset: u64,
        count: u64,
    ) -> std::io::Result<u64> {
        // Portable stand-in for a true kernel zero-copy primitive
        // (sendfile/copy_file_range): still avoids an intermediate
        // user-space Vec by streaming through a small fixed buffer.
        let mut src = src.try_clone()?;
        src.seek(SeekFrom::Start(src_offset))?;
        let mut remaining = count;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let to_read = remaining.min(buf.len() as u64) as usize;
            src.read_exact(&mut buf[..to_read])?;
            self.file.write_all(&buf[..to_read])?;
            remaining -= to_read as u64;
        }
        self.bytes_written += count;
        Ok(count)
    }
}

struct CountingWriter<'w> {
    inner: &'w mut File,
    counter: &'w mut u64,
}

impl<'w> Write for CountingWriter<'w> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        *self.counter += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_partitions_in_order_and_builds_index() {
        let dir = tempfile::tempdir().unwrap();
        let support = LocalDiskShuffleWriteSupport::new(dir.path().to_path_buf());
        let mut writer = support.create_map_output_writer(0, 0, 3).unwrap();

        for payload in [b"aa".as_slice(), b"b".as_slice(), b"".as_slice()] {
            let mut p = writer.get_next_partition_writer().unwrap();
            p.to_stream().write_all(payload).unwrap();
            p.close().unwrap();
        }

        let status = writer.commit_all_partitions().unwrap();
        assert_eq!(status.partition_lengths, vec![2, 1, 0]);
    }

    #[test]
    fn commit_before_all_partitions_written_fails() {
        let dir = tempfile::tempdir().unwrap();
        let support = LocalDiskShuffleWriteSupport::new(dir.path().to_path_buf());
        let mut writer = support.create_map_output_writer(0, 0, 2).unwrap();
        let _ = writer.get_next_partition_writer().unwrap();
        assert!(writer.commit_all_partitions().is_err());
    }
}
