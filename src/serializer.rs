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

//! Serialization and stream-wrapping collaborators. This crate treats the
//! actual encoding, compression, and encryption as external: it only needs
//! a narrow seam to drive them against a [`SerializationBuffer`] or a
//! partition sink.

use std::io::{Read, Write};

use crate::buffer::SerializationBuffer;
use crate::error::Result;

/// Encodes one key and one value into a [`SerializationBuffer`]. Kept
/// generic over `K`/`V` rather than boxed so callers can specialize per
/// record type without paying for dynamic dispatch on the hot path.
pub trait RecordSerializer<K, V> {
    fn write_key(&self, key: &K, buf: &mut SerializationBuffer) -> Result<()>;

    fn write_value(&self, value: &V, buf: &mut SerializationBuffer) -> Result<()>;
}

/// Wraps a partition sink with encryption (and, for the non-serialized
/// sibling path, compression). The serialized-mode merge engine calls this
/// once per partition stream rather than once per record.
pub trait SerializerManager: Send + Sync {
    fn wrap_stream<'a>(
        &self,
        block_id: &str,
        stream: Box<dyn Write + 'a>,
    ) -> Result<Box<dyn Write + 'a>>;

    fn wrap_input<'a>(
        &self,
        block_id: &str,
        stream: Box<dyn Read + 'a>,
    ) -> Result<Box<dyn Read + 'a>>;

    fn encryption_enabled(&self) -> bool;
}

/// A pass-through manager used when encryption is disabled; the default for
/// tests and for deployments that never enable it.
pub struct NoopSerializerManager;

impl SerializerManager for NoopSerializerManager {
    fn wrap_stream<'a>(
        &self,
        _block_id: &str,
        stream: Box<dyn Write + 'a>,
    ) -> Result<Box<dyn Write + 'a>> {
        Ok(stream)
    }

    fn wrap_input<'a>(
        &self,
        _block_id: &str,
        stream: Box<dyn Read + 'a>,
    ) -> Result<Box<dyn Read + 'a>> {
        Ok(stream)
    }

    fn encryption_enabled(&self) -> bool {
        false
    }
}

/// A compression codec able to wrap output/input streams, plus the single
/// static fact the merge engine's strategy selection depends on: whether
/// concatenating opaque compressed frames produced independently is a valid
/// compressed stream in its own right.
pub trait CompressionCodec: Send + Sync {
    fn compressed_output_stream<'a>(&self, stream: Box<dyn Write + 'a>) -> Box<dyn Write + 'a>;

    fn compressed_input_stream<'a>(&self, stream: Box<dyn Read + 'a>) -> Box<dyn Read + 'a>;

    /// Whether frames produced by independent encoder instances can be
    /// concatenated and decoded back as a single logical stream.
    fn supports_concatenation_of_serialized_streams(&self) -> bool;
}
