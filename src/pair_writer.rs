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

//! The non-serialized sibling path: writes `(key, value)` pairs directly
//! into one partition's sink rather than through the external sorter.
//! Shares the sorter-adjacent components' stream-ownership and
//! metrics-accounting discipline, but has no sort or spill step of its
//! own -- callers that already know a record's destination partition (for
//! example a single-partition shuffle, or a partitioner applied upstream)
//! use this instead of the full [`crate::facade::ShuffleWriterFacade`].

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

use crate::buffer::SerializationBuffer;
use crate::error::Result;
use crate::metrics::WriteMetricsReporter;
use crate::serializer::{CompressionCodec, RecordSerializer, SerializerManager};
use crate::writer_support::PartitionWriter;

/// How often, in records written, the bytes-written metric is refreshed
/// from the partition writer without waiting for `close()`.
const BYTES_WRITTEN_POLL_INTERVAL: u64 = 16384;

pub struct PartitionPairWriter<'a, K, V> {
    partition_writer: Rc<RefCell<Box<dyn PartitionWriter + 'a>>>,
    serializer_manager: &'a dyn SerializerManager,
    codec: Option<&'a dyn CompressionCodec>,
    record_serializer: &'a dyn RecordSerializer<K, V>,
    block_id: String,
    chain: Option<Box<dyn Write + 'a>>,
    scratch: SerializationBuffer,
    metrics: Arc<WriteMetricsReporter>,
    last_polled_bytes: u64,
    records_since_poll: u64,
    closed: bool,
}

impl<'a, K, V> PartitionPairWriter<'a, K, V> {
    pub fn new(
        partition_writer: Box<dyn PartitionWriter + 'a>,
        serializer_manager: &'a dyn SerializerManager,
        codec: Option<&'a dyn CompressionCodec>,
        record_serializer: &'a dyn RecordSerializer<K, V>,
        block_id: impl Into<String>,
        metrics: Arc<WriteMetricsReporter>,
    ) -> Self {
        PartitionPairWriter {
            partition_writer: Rc::new(RefCell::new(partition_writer)),
            serializer_manager,
            codec,
            record_serializer,
            block_id: block_id.into(),
            chain: None,
            scratch: SerializationBuffer::with_capacity(4096),
            metrics,
            last_polled_bytes: 0,
            records_since_poll: 0,
            closed: false,
        }
    }

    /// Encodes `key` then `value` and writes the pair into the partition's
    /// wrapper chain, opening the chain lazily on the first call.
    pub fn write(&mut self, key: &K, value: &V) -> Result<()> {
        if self.chain.is_none() {
            self.chain = Some(self.open_chain()?);
        }

        self.scratch.reset();
        self.record_serializer.write_key(key, &mut self.scratch)?;
        self.record_serializer.write_value(value, &mut self.scratch)?;

        let chain = self.chain.as_mut().expect("chain opened above");
        chain.write_all(self.scratch.raw_view())?;

        self.records_since_poll += 1;
        if self.records_since_poll >= BYTES_WRITTEN_POLL_INTERVAL {
            self.poll_bytes_written();
        }
        Ok(())
    }

    fn open_chain(&self) -> Result<Box<dyn Write + 'a>> {
        let sink: Box<dyn Write + 'a> = Box::new(PartitionSink {
            inner: self.partition_writer.clone(),
        });
        let encrypted: Box<dyn Write + 'a> = if self.serializer_manager.encryption_enabled() {
            self.serializer_manager.wrap_stream(&self.block_id, sink)?
        } else {
            sink
        };
        let compressed: Box<dyn Write + 'a> = match self.codec {
            Some(codec) => codec.compressed_output_stream(encrypted),
            None => encrypted,
        };
        Ok(compressed)
    }

    fn poll_bytes_written(&mut self) {
        let total = self.partition_writer.borrow().get_num_bytes_written();
        let delta = total.saturating_sub(self.last_polled_bytes);
        if delta > 0 {
            self.metrics.inc_bytes_written(delta);
        }
        self.last_polled_bytes = total;
        self.records_since_poll = 0;
    }

    /// Idempotent. Flushing the chain is best-effort and logged rather than
    /// propagated, so a codec trailer failure never hides whether the
    /// partition writer itself closed cleanly; the bytes-written metric is
    /// refreshed either way.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(mut chain) = self.chain.take() {
            if let Err(err) = chain.flush() {
                log::warn!("partition pair writer: flushing wrapper chain failed: {err}");
            }
        }

        let result = self.partition_writer.borrow_mut().close();
        self.poll_bytes_written();
        result
    }
}

/// Forwards writes to the shared partition writer's current stream view,
/// re-borrowing it on every call instead of holding one open for the
/// writer's whole lifetime -- `to_stream` is cheap to re-derive and this
/// keeps the chain's ownership independent of the partition writer's.
struct PartitionSink<'a> {
    inner: Rc<RefCell<Box<dyn PartitionWriter + 'a>>>,
}

impl<'a> Write for PartitionSink<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.borrow_mut().to_stream().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.borrow_mut().to_stream().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::NoopSerializerManager;
    use crate::writer_support::ZeroCopyTarget;

    struct VecPartitionWriter {
        data: Vec<u8>,
        closed: bool,
    }

    impl PartitionWriter for VecPartitionWriter {
        fn to_stream(&mut self) -> Box<dyn Write + '_> {
            Box::new(&mut self.data)
        }

        fn to_channel(&mut self) -> Option<&mut dyn ZeroCopyTarget> {
            None
        }

        fn get_num_bytes_written(&self) -> u64 {
            self.data.len() as u64
        }

        fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    struct StrPair;
    impl RecordSerializer<String, String> for StrPair {
        fn write_key(&self, key: &String, buf: &mut SerializationBuffer) -> Result<()> {
            buf.write_all(key.as_bytes())?;
            buf.write_all(b"|")?;
            Ok(())
        }
        fn write_value(&self, value: &String, buf: &mut SerializationBuffer) -> Result<()> {
            buf.write_all(value.as_bytes())?;
            buf.write_all(b"\n")?;
            Ok(())
        }
    }

    #[test]
    fn writes_key_then_value_for_each_pair_and_closes_once() {
        let partition_writer: Box<dyn PartitionWriter> = Box::new(VecPartitionWriter {
            data: Vec::new(),
            closed: false,
        });
        let mgr = NoopSerializerManager;
        let ser = StrPair;
        let metrics = Arc::new(WriteMetricsReporter::new());

        let mut writer =
            PartitionPairWriter::new(partition_writer, &mgr, None, &ser, "shuffle_0_0-1", metrics.clone());

        writer.write(&"a".to_string(), &"1".to_string()).unwrap();
        writer.write(&"b".to_string(), &"2".to_string()).unwrap();
        writer.close().unwrap();
        // a second close must be a no-op, not a panic or double-close error
        writer.close().unwrap();

        assert_eq!(metrics.bytes_written(), "a|1\nb|2\n".len() as u64);
    }

    #[test]
    fn bytes_written_metric_only_counts_the_delta_since_last_poll() {
        let partition_writer: Box<dyn PartitionWriter> = Box::new(VecPartitionWriter {
            data: Vec::new(),
            closed: false,
        });
        let mgr = NoopSerializerManager;
        let ser = StrPair;
        let metrics = Arc::new(WriteMetricsReporter::new());

        let mut writer =
            PartitionPairWriter::new(partition_writer, &mgr, None, &ser, "shuffle_0_0-1", metrics.clone());
        writer.write(&"x".to_string(), &"y".to_string()).unwrap();
        writer.close().unwrap();

        assert_eq!(metrics.bytes_written(), "x|y\n".len() as u64);
    }
}
