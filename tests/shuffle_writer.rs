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

//! End-to-end tests driving [`ShuffleWriterFacade`] against
//! [`LocalDiskShuffleWriteSupport`], covering the concrete scenarios and
//! boundary behaviors spelled out in the spec's testable-properties section.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use shuffle_writer::config::ShuffleWriterConfig;
use shuffle_writer::error::{Result, ShuffleWriteError};
use shuffle_writer::local_output::LocalDiskShuffleWriteSupport;
use shuffle_writer::memory::BudgetedMemoryManager;
use shuffle_writer::merge::{MergeEngine, MergeStrategy};
use shuffle_writer::metrics::WriteMetricsReporter;
use shuffle_writer::partitioner::FnPartitioner;
use shuffle_writer::pointer::{encode_key, sort_keys, Page, RecordLocation};
use shuffle_writer::serializer::{CompressionCodec, NoopSerializerManager, RecordSerializer, SerializerManager};
use shuffle_writer::spill::{write_spill_file, SpillDescriptor};
use shuffle_writer::writer_support::{MapOutputWriter, ShuffleWriteSupport};
use shuffle_writer::{MemoryManager, ShuffleWriterFacade};

struct StrIntSerializer;

impl RecordSerializer<String, i32> for StrIntSerializer {
    fn write_key(&self, key: &String, buf: &mut shuffle_writer::buffer::SerializationBuffer) -> Result<()> {
        let bytes = key.as_bytes();
        buf.write(&(bytes.len() as u32).to_le_bytes());
        buf.write(bytes);
        Ok(())
    }

    fn write_value(&self, value: &i32, buf: &mut shuffle_writer::buffer::SerializationBuffer) -> Result<()> {
        buf.write(&value.to_le_bytes());
        Ok(())
    }
}

/// Fails serialization of the value once a caller-chosen number of records
/// has already been written, standing in for "the record iterator raises" in
/// an API where `write` takes an `IntoIterator`, not a fallible one.
struct FailingAfter {
    limit: usize,
    seen: std::cell::Cell<usize>,
}

impl RecordSerializer<String, i32> for FailingAfter {
    fn write_key(&self, key: &String, buf: &mut shuffle_writer::buffer::SerializationBuffer) -> Result<()> {
        StrIntSerializer.write_key(key, buf)
    }

    fn write_value(&self, value: &i32, buf: &mut shuffle_writer::buffer::SerializationBuffer) -> Result<()> {
        let n = self.seen.get() + 1;
        self.seen.set(n);
        if n > self.limit {
            return Err(ShuffleWriteError::illegal_state("simulated failure from the record source"));
        }
        StrIntSerializer.write_value(value, buf)
    }
}

/// Reversible, stateless (per-call) XOR stream wrapper standing in for a
/// real encryption layer -- stateless because a single fixed key byte does
/// not depend on stream position, so partial `write`/`read` calls never
/// desync it.
struct XorSerializerManager {
    key: u8,
}

struct XorWriter<'a> {
    inner: Box<dyn Write + 'a>,
    key: u8,
}

impl<'a> Write for XorWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let xored: Vec<u8> = buf.iter().map(|b| b ^ self.key).collect();
        self.inner.write(&xored)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct XorReader<'a> {
    inner: Box<dyn Read + 'a>,
    key: u8,
}

impl<'a> Read for XorReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        for b in &mut buf[..n] {
            *b ^= self.key;
        }
        Ok(n)
    }
}

impl SerializerManager for XorSerializerManager {
    fn wrap_stream<'a>(&self, _block_id: &str, stream: Box<dyn Write + 'a>) -> Result<Box<dyn Write + 'a>> {
        Ok(Box::new(XorWriter { inner: stream, key: self.key }))
    }

    fn wrap_input<'a>(&self, _block_id: &str, stream: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
        Ok(Box::new(XorReader { inner: stream, key: self.key }))
    }

    fn encryption_enabled(&self) -> bool {
        true
    }
}

/// A toy codec (add 1 mod 256 on compress, subtract on decompress) that
/// declares itself unable to concatenate, forcing the merge engine's slow
/// path regardless of the fast-merge/zero-copy config flags.
struct NonConcatenatingCodec;

struct IncWriter<'a>(Box<dyn Write + 'a>);
impl<'a> Write for IncWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mapped: Vec<u8> = buf.iter().map(|b| b.wrapping_add(1)).collect();
        self.0.write(&mapped)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

struct DecReader<'a>(Box<dyn Read + 'a>);
impl<'a> Read for DecReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.0.read(buf)?;
        for b in &mut buf[..n] {
            *b = b.wrapping_sub(1);
        }
        Ok(n)
    }
}

impl CompressionCodec for NonConcatenatingCodec {
    fn compressed_output_stream<'a>(&self, stream: Box<dyn Write + 'a>) -> Box<dyn Write + 'a> {
        Box::new(IncWriter(stream))
    }
    fn compressed_input_stream<'a>(&self, stream: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
        Box::new(DecReader(stream))
    }
    fn supports_concatenation_of_serialized_streams(&self) -> bool {
        false
    }
}

fn decode_records(mut bytes: &[u8]) -> Vec<(String, i32)> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let key = String::from_utf8(bytes[4..4 + len].to_vec()).unwrap();
        let value = i32::from_le_bytes(bytes[4 + len..8 + len].try_into().unwrap());
        out.push((key, value));
        bytes = &bytes[8 + len..];
    }
    out
}

/// Serializes one `(String, i32)` record the same way [`StrIntSerializer`]
/// does, for tests that build spill files directly instead of going through
/// a writer's insert path.
fn encode_record(key: &str, value: i32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(&value.to_le_bytes());
    buf
}

/// Packs `entries` (each a destination partition plus an already-serialized
/// payload) into one page and streams it out as a spill file, exactly the
/// shape [`shuffle_writer::sorter::ExternalPartitionSorter`] produces --
/// lets merge-engine tests exercise a chosen spill count directly instead of
/// depending on memory-pressure timing to produce it. `entries` are raw
/// (unencoded) payloads; the encryption/compression chain named by
/// `serializer_manager`/`codec` is applied per-partition segment exactly as
/// the real sorter applies it when it spills, so the spill file this
/// produces is just as opaque to the merge engine as a real one.
fn build_spill(
    path: &Path,
    entries: &[(u32, Vec<u8>)],
    num_partitions: u32,
    serializer_manager: &dyn SerializerManager,
    codec: Option<&dyn CompressionCodec>,
    block_id_prefix: &str,
) -> SpillDescriptor {
    let total: usize = entries.iter().map(|(_, p)| 4 + p.len()).sum();
    let mut page = Page::with_capacity(total.max(16));
    let mut locations = Vec::new();
    let mut keys = Vec::new();
    for (i, (partition_id, payload)) in entries.iter().enumerate() {
        let offset = page.push_record(payload);
        locations.push(RecordLocation { page_index: 0, offset });
        keys.push(encode_key(*partition_id, i as u32));
    }
    sort_keys(&mut keys);
    write_spill_file(
        path,
        &keys,
        &[page],
        &locations,
        num_partitions,
        serializer_manager,
        codec,
        block_id_prefix,
    )
    .unwrap()
}

fn read_partition_bytes(data_path: &Path, index_path: &Path, partition: u32) -> Vec<u8> {
    let index_bytes = std::fs::read(index_path).unwrap();
    let offsets: Vec<u64> = index_bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let start = offsets[partition as usize] as usize;
    let end = offsets[partition as usize + 1] as usize;
    let data = std::fs::read(data_path).unwrap();
    data[start..end].to_vec()
}

fn partitioner_ab_c() -> FnPartitioner<String, impl Fn(&String) -> u32> {
    FnPartitioner::new(2, |k: &String| if k == "b" { 1 } else { 0 })
}

fn sample_records() -> Vec<(String, i32)> {
    vec![("a".to_string(), 1), ("b".to_string(), 2), ("c".to_string(), 3)]
}

/// Scenario 1: basic routing, no compression, no encryption, fast-merge off.
#[test]
fn scenario_1_basic_two_partition_routing() {
    let tmp = tempfile::tempdir().unwrap();
    let support = LocalDiskShuffleWriteSupport::new(tmp.path().to_path_buf());
    let partitioner = partitioner_ab_c();
    let serializer = StrIntSerializer;
    let mgr = NoopSerializerManager;
    let mem: Arc<dyn MemoryManager> = Arc::new(BudgetedMemoryManager::new(64 << 20));
    let spill_dir = tmp.path().join("spills");
    std::fs::create_dir_all(&spill_dir).unwrap();

    let mut writer = ShuffleWriterFacade::new(
        0,
        0,
        ShuffleWriterConfig::default(),
        &partitioner,
        &serializer,
        &mgr,
        None,
        &support,
        mem,
        spill_dir,
    )
    .unwrap();

    writer.write(sample_records()).unwrap();
    let status = writer.stop(true).unwrap().expect("stop(true) after a successful write");

    let data_path = tmp.path().join("shuffle_0_0.data");
    let index_path = tmp.path().join("shuffle_0_0.index");
    let p0 = decode_records(&read_partition_bytes(&data_path, &index_path, 0));
    let p1 = decode_records(&read_partition_bytes(&data_path, &index_path, 1));

    assert_eq!(p0, vec![("a".to_string(), 1), ("c".to_string(), 3)]);
    assert_eq!(p1, vec![("b".to_string(), 2)]);
    let data_len = std::fs::metadata(&data_path).unwrap().len();
    assert_eq!(status.partition_lengths.iter().sum::<u64>(), data_len);
}

/// Scenario 2: 3 spills (one record each, the same shape the sorter
/// produces when memory pressure forces a spill after every insert),
/// fast-merge + zero-copy on, no encryption -- output must match scenario
/// 1's byte-identical layout regardless of how many spills it came from.
#[test]
fn scenario_2_three_spills_match_no_spill_baseline() {
    let tmp = tempfile::tempdir().unwrap();
    let support = LocalDiskShuffleWriteSupport::new(tmp.path().to_path_buf());
    let mgr = NoopSerializerManager;

    let mut config = ShuffleWriterConfig::default();
    config.fast_merge_enabled = true;
    config.transfer_to_enabled = true;

    let spills = vec![
        build_spill(&tmp.path().join("spill-0.bin"), &[(0, encode_record("a", 1))], 2, &mgr, None, "shuffle_0_0"),
        build_spill(&tmp.path().join("spill-1.bin"), &[(1, encode_record("b", 2))], 2, &mgr, None, "shuffle_0_0"),
        build_spill(&tmp.path().join("spill-2.bin"), &[(0, encode_record("c", 3))], 2, &mgr, None, "shuffle_0_0"),
    ];

    let engine = MergeEngine {
        config: &config,
        codec: None,
        serializer_manager: &mgr,
        zero_copy_available: true,
        shuffle_block_id_prefix: "shuffle_0_0",
    };
    assert_eq!(engine.select_strategy(spills.len()), MergeStrategy::ZeroCopyFastMerge);

    let metrics = WriteMetricsReporter::new();
    let mut map_writer = support.create_map_output_writer(0, 0, 2).unwrap();
    engine.merge(&spills, map_writer.as_mut(), 2, &metrics).unwrap();
    map_writer.commit_all_partitions().unwrap();

    let data_path = tmp.path().join("shuffle_0_0.data");
    let index_path = tmp.path().join("shuffle_0_0.index");
    let p0 = decode_records(&read_partition_bytes(&data_path, &index_path, 0));
    let p1 = decode_records(&read_partition_bytes(&data_path, &index_path, 1));

    assert_eq!(p0, vec![("a".to_string(), 1), ("c".to_string(), 3)]);
    assert_eq!(p1, vec![("b".to_string(), 2)]);
}

/// Scenario 3: encryption enabled rules out the zero-copy path even with
/// fast-merge and transferTo both on; stream fast merge is used instead, and
/// decrypting the output reproduces the original payloads.
#[test]
fn scenario_3_encryption_forces_stream_merge() {
    let tmp = tempfile::tempdir().unwrap();
    let support = LocalDiskShuffleWriteSupport::new(tmp.path().to_path_buf());
    let mgr = XorSerializerManager { key: 0x5a };

    let mut config = ShuffleWriterConfig::default();
    config.fast_merge_enabled = true;
    config.transfer_to_enabled = true;

    let spills = vec![
        build_spill(
            &tmp.path().join("spill-0.bin"),
            &[(0, encode_record("a", 1)), (1, encode_record("b", 2))],
            2,
            &mgr,
            None,
            "shuffle_0_0",
        ),
        build_spill(
            &tmp.path().join("spill-1.bin"),
            &[(0, encode_record("c", 3))],
            2,
            &mgr,
            None,
            "shuffle_0_0",
        ),
    ];

    let engine = MergeEngine {
        config: &config,
        codec: None,
        serializer_manager: &mgr,
        zero_copy_available: true,
        shuffle_block_id_prefix: "shuffle_0_0",
    };
    assert_eq!(engine.select_strategy(spills.len()), MergeStrategy::StreamFastMerge);

    let metrics = WriteMetricsReporter::new();
    let mut map_writer = support.create_map_output_writer(0, 0, 2).unwrap();
    engine.merge(&spills, map_writer.as_mut(), 2, &metrics).unwrap();
    map_writer.commit_all_partitions().unwrap();

    let data_path = tmp.path().join("shuffle_0_0.data");
    let index_path = tmp.path().join("shuffle_0_0.index");
    let raw0 = read_partition_bytes(&data_path, &index_path, 0);
    let decrypted0: Vec<u8> = raw0.iter().map(|b| b ^ 0x5a).collect();
    assert_eq!(decode_records(&decrypted0), vec![("a".to_string(), 1), ("c".to_string(), 3)]);
}

/// Scenario 4: 5 spills with a codec that cannot concatenate -> slow merge
/// even though fast-merge is on; decompressing the output reproduces every
/// record regardless of which spill it originally landed in.
#[test]
fn scenario_4_non_concatenating_codec_forces_slow_merge() {
    let tmp = tempfile::tempdir().unwrap();
    let support = LocalDiskShuffleWriteSupport::new(tmp.path().to_path_buf());
    let mgr = NoopSerializerManager;
    let codec = NonConcatenatingCodec;

    let mut config = ShuffleWriterConfig::default();
    config.compress = true;
    config.fast_merge_enabled = true;

    let records: Vec<(String, i32)> = (0..5).map(|i| (format!("k{i}"), i)).collect();
    let spills: Vec<SpillDescriptor> = records
        .iter()
        .enumerate()
        .map(|(i, (k, v))| {
            let partition = (i as u32) % 2;
            build_spill(
                &tmp.path().join(format!("spill-{i}.bin")),
                &[(partition, encode_record(k, *v))],
                2,
                &mgr,
                Some(&codec),
                "shuffle_0_0",
            )
        })
        .collect();

    let engine = MergeEngine {
        config: &config,
        codec: Some(&codec),
        serializer_manager: &mgr,
        zero_copy_available: true,
        shuffle_block_id_prefix: "shuffle_0_0",
    };
    assert_eq!(engine.select_strategy(spills.len()), MergeStrategy::SlowMerge);

    let metrics = WriteMetricsReporter::new();
    let mut map_writer = support.create_map_output_writer(0, 0, 2).unwrap();
    engine.merge(&spills, map_writer.as_mut(), 2, &metrics).unwrap();
    map_writer.commit_all_partitions().unwrap();

    let data_path = tmp.path().join("shuffle_0_0.data");
    let index_path = tmp.path().join("shuffle_0_0.index");
    let mut all = Vec::new();
    for p in 0..2u32 {
        let raw = read_partition_bytes(&data_path, &index_path, p);
        let decompressed: Vec<u8> = raw.iter().map(|b| b.wrapping_sub(1)).collect();
        all.extend(decode_records(&decompressed));
    }
    all.sort();
    let mut expected = records;
    expected.sort();
    assert_eq!(all, expected);
}

/// Scenario 5: the record source fails partway through; `stop(false)` must
/// still succeed and leave no spill files, and a subsequent `stop(true)`
/// must raise `IllegalState` since no write ever committed.
#[test]
fn scenario_5_mid_stream_failure_then_stop_false() {
    let tmp = tempfile::tempdir().unwrap();
    let support = LocalDiskShuffleWriteSupport::new(tmp.path().to_path_buf());
    let partitioner = partitioner_ab_c();
    let mgr = NoopSerializerManager;
    let spill_dir = tmp.path().join("spills");
    std::fs::create_dir_all(&spill_dir).unwrap();

    // First writer: the failed write already cleans up the sorter's
    // resources, so stop(false) is a no-op and leaves no spill files.
    let serializer = FailingAfter { limit: 2, seen: std::cell::Cell::new(0) };
    let mem: Arc<dyn MemoryManager> = Arc::new(BudgetedMemoryManager::new(64 << 20));
    let mut writer = ShuffleWriterFacade::new(
        0,
        0,
        ShuffleWriterConfig::default(),
        &partitioner,
        &serializer,
        &mgr,
        None,
        &support,
        mem,
        spill_dir.clone(),
    )
    .unwrap();

    let err = writer.write(sample_records()).unwrap_err();
    assert!(matches!(err, ShuffleWriteError::IllegalState(_)));

    assert!(writer.stop(false).unwrap().is_none());
    let remaining_spills: Vec<_> = std::fs::read_dir(&spill_dir).unwrap().collect();
    assert!(remaining_spills.is_empty());

    // Second writer: since no write ever committed, the very first stop
    // call made with `success = true` must itself report IllegalState.
    let serializer2 = FailingAfter { limit: 2, seen: std::cell::Cell::new(0) };
    let mem2: Arc<dyn MemoryManager> = Arc::new(BudgetedMemoryManager::new(64 << 20));
    let mut writer2 = ShuffleWriterFacade::new(
        1,
        0,
        ShuffleWriterConfig::default(),
        &partitioner,
        &serializer2,
        &mgr,
        None,
        &support,
        mem2,
        spill_dir,
    )
    .unwrap();
    let err = writer2.write(sample_records()).unwrap_err();
    assert!(matches!(err, ShuffleWriteError::IllegalState(_)));
    let err = writer2.stop(true).unwrap_err();
    assert!(matches!(err, ShuffleWriteError::IllegalState(_)));
}

/// Scenario 6: constructing with `P` above the serialized-mode ceiling fails
/// before any resource (sorter, spill directory use) is allocated.
#[test]
fn scenario_6_partition_ceiling_rejected_at_construction() {
    let tmp = tempfile::tempdir().unwrap();
    let support = LocalDiskShuffleWriteSupport::new(tmp.path().to_path_buf());
    let ceiling = shuffle_writer::config::MAX_SHUFFLE_OUTPUT_PARTITIONS;
    let partitioner = FnPartitioner::new(ceiling + 1, |_: &String| 0);
    let serializer = StrIntSerializer;
    let mgr = NoopSerializerManager;
    let mem: Arc<dyn MemoryManager> = Arc::new(BudgetedMemoryManager::new(64 << 20));

    let result = ShuffleWriterFacade::new(
        0,
        0,
        ShuffleWriterConfig::default(),
        &partitioner,
        &serializer,
        &mgr,
        None,
        &support,
        mem,
        tmp.path().to_path_buf(),
    );
    assert!(matches!(result.unwrap_err(), ShuffleWriteError::Configuration(_)));
}

/// Boundary: zero records still produces every partition writer and a
/// well-formed (all-zero) map status.
#[test]
fn zero_records_yields_zero_length_partitions() {
    let tmp = tempfile::tempdir().unwrap();
    let support = LocalDiskShuffleWriteSupport::new(tmp.path().to_path_buf());
    let partitioner = partitioner_ab_c();
    let serializer = StrIntSerializer;
    let mgr = NoopSerializerManager;
    let mem: Arc<dyn MemoryManager> = Arc::new(BudgetedMemoryManager::new(64 << 20));
    let spill_dir = tmp.path().join("spills");
    std::fs::create_dir_all(&spill_dir).unwrap();

    let mut writer = ShuffleWriterFacade::new(
        0,
        0,
        ShuffleWriterConfig::default(),
        &partitioner,
        &serializer,
        &mgr,
        None,
        &support,
        mem,
        spill_dir,
    )
    .unwrap();

    writer.write(Vec::<(String, i32)>::new()).unwrap();
    let status = writer.stop(true).unwrap().unwrap();
    assert_eq!(status.partition_lengths, vec![0, 0]);
}

/// `stop` is idempotent: a second call is a no-op regardless of the first
/// call's outcome.
#[test]
fn stop_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let support = LocalDiskShuffleWriteSupport::new(tmp.path().to_path_buf());
    let partitioner = partitioner_ab_c();
    let serializer = StrIntSerializer;
    let mgr = NoopSerializerManager;
    let mem: Arc<dyn MemoryManager> = Arc::new(BudgetedMemoryManager::new(64 << 20));
    let spill_dir = tmp.path().join("spills");
    std::fs::create_dir_all(&spill_dir).unwrap();

    let mut writer = ShuffleWriterFacade::new(
        0,
        0,
        ShuffleWriterConfig::default(),
        &partitioner,
        &serializer,
        &mgr,
        None,
        &support,
        mem,
        spill_dir,
    )
    .unwrap();

    writer.write(sample_records()).unwrap();
    let first = writer.stop(true).unwrap();
    let second = writer.stop(true).unwrap();
    assert!(first.is_some());
    assert!(second.is_none());
}
