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

//! The partitioner collaborator: maps a record's key to a destination
//! partition. Routing is the only thing the external sorter cares about the
//! key for -- the sort itself never looks past `partition_id`.

pub trait Partitioner<K: ?Sized>: Send + Sync {
    fn get_partition(&self, key: &K) -> u32;

    fn num_partitions(&self) -> u32;
}

/// A partitioner that sends every record to partition 0, useful for `P = 1`
/// boundary tests and single-partition map tasks.
pub struct SinglePartition;

impl<K: ?Sized> Partitioner<K> for SinglePartition {
    fn get_partition(&self, _key: &K) -> u32 {
        0
    }

    fn num_partitions(&self) -> u32 {
        1
    }
}

/// A partitioner driven by an explicit `key -> partition` function, handy
/// for tests that need deterministic routing without hashing.
pub struct FnPartitioner<K: ?Sized, F> {
    func: F,
    num_partitions: u32,
    _marker: std::marker::PhantomData<fn(&K)>,
}

impl<K: ?Sized, F> FnPartitioner<K, F>
where
    F: Fn(&K) -> u32 + Send + Sync,
{
    pub fn new(num_partitions: u32, func: F) -> Self {
        FnPartitioner {
            func,
            num_partitions,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<K: ?Sized, F> Partitioner<K> for FnPartitioner<K, F>
where
    F: Fn(&K) -> u32 + Send + Sync,
{
    fn get_partition(&self, key: &K) -> u32 {
        (self.func)(key) % self.num_partitions.max(1)
    }

    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }
}
