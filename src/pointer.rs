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

//! Packed sort keys and page bookkeeping for the external sorter.
//!
//! Each inserted record gets a single `u64` sort key: `partition_id` in the
//! high 32 bits, insertion index in the low 32 bits. Sorting that array of
//! words ascending orders entries by partition, and — because the low bits
//! are the insertion index — ties within a partition resolve in insertion
//! order without a separate stable-sort pass. The actual bytes live in a
//! side table of page-relative locations, indexed by insertion index, so
//! sorting the keys never has to move record payloads around.

/// Where one record's length-prefixed bytes begin within a [`Page`].
#[derive(Clone, Copy, Debug)]
pub struct RecordLocation {
    pub page_index: u32,
    pub offset: u32,
}

/// A contiguous byte region records are packed into back-to-back as
/// `{length: u32 LE}{bytes}`. A page never spans records: if a record does
/// not fit in the current page's remaining capacity, a new page is
/// allocated for it.
pub struct Page {
    data: Vec<u8>,
}

impl Page {
    pub fn with_capacity(capacity: usize) -> Self {
        Page {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub fn byte_size(&self) -> usize {
        self.data.capacity()
    }

    /// Appends one length-prefixed record, returning the offset it was
    /// written at. Caller must have already checked `remaining()`.
    pub fn push_record(&mut self, payload: &[u8]) -> u32 {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.data.extend_from_slice(payload);
        offset
    }

    pub fn read_record(&self, offset: u32) -> &[u8] {
        let offset = offset as usize;
        let len = u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap()) as usize;
        &self.data[offset + 4..offset + 4 + len]
    }
}

const KEY_INDEX_BITS: u32 = 32;

pub fn encode_key(partition_id: u32, insertion_index: u32) -> u64 {
    ((partition_id as u64) << KEY_INDEX_BITS) | insertion_index as u64
}

pub fn decode_partition(key: u64) -> u32 {
    (key >> KEY_INDEX_BITS) as u32
}

pub fn decode_index(key: u64) -> u32 {
    (key & u32::MAX as u64) as u32
}

/// Sorts the packed keys by partition id (then insertion order, implied by
/// the low bits) using an unsigned radix sort over the full word.
pub fn sort_keys(keys: &mut [u64]) {
    radsort::sort(keys);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let key = encode_key(7, 12345);
        assert_eq!(decode_partition(key), 7);
        assert_eq!(decode_index(key), 12345);
    }

    #[test]
    fn sort_orders_by_partition_then_insertion() {
        let mut keys = vec![
            encode_key(2, 0),
            encode_key(0, 1),
            encode_key(1, 2),
            encode_key(0, 3),
        ];
        sort_keys(&mut keys);
        let partitions: Vec<u32> = keys.iter().map(|&k| decode_partition(k)).collect();
        assert_eq!(partitions, vec![0, 0, 1, 2]);
        // within partition 0, insertion order (1 before 3) is preserved
        let indices: Vec<u32> = keys
            .iter()
            .filter(|&&k| decode_partition(k) == 0)
            .map(|&k| decode_index(k))
            .collect();
        assert_eq!(indices, vec![1, 3]);
    }

    #[test]
    fn page_round_trips_records() {
        let mut page = Page::with_capacity(64);
        let off1 = page.push_record(b"hello");
        let off2 = page.push_record(b"world!");
        assert_eq!(page.read_record(off1), b"hello");
        assert_eq!(page.read_record(off2), b"world!");
    }
}
