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

//! A reusable growable byte sink records are serialized into before being
//! handed to the external sorter. Exposing the backing storage directly
//! lets the sorter copy straight out of it instead of through another
//! intermediate buffer.

const DEFAULT_INITIAL_CAPACITY: usize = 1 << 20; // 1 MiB

pub struct SerializationBuffer {
    data: Vec<u8>,
}

impl SerializationBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SerializationBuffer {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Resets the length to zero without releasing capacity.
    pub fn reset(&mut self) {
        self.data.clear();
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// An immutable view of the first `len()` bytes of the underlying
    /// storage, avoiding a copy into the sorter.
    pub fn raw_view(&self) -> &[u8] {
        &self.data
    }
}

impl Default for SerializationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::io::Write for SerializationBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
