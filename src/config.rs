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

//! Recognized configuration options.
//!
//! Values are read from a flat string map the way `SparkConf`-style
//! configuration is consulted elsewhere in the stack: callers hand in
//! whatever key/value properties they already have and we parse the handful
//! we understand, falling back to documented defaults.

use std::collections::HashMap;

use crate::error::{Result, ShuffleWriteError};

/// The canonical name for the fast-merge toggle. The upstream source this
/// writer is modeled on carries a misspelled key for historical reasons; we
/// keep reading it as an alias so existing deployments do not silently lose
/// the setting.
pub const SHUFFLE_FAST_MERGE_ENABLED: &str = "shuffle.unsafe.fast-merge.enabled";
const SHUFFLE_FAST_MERGE_ENABLED_ALIAS: &str = "shuffle.unsafe.fast-merge.enable";

pub const SHUFFLE_COMPRESS: &str = "shuffle.compress";
pub const SHUFFLE_TRANSFER_TO: &str = "shuffle.file.transferTo";
pub const SHUFFLE_SORT_INIT_BUFFER_SIZE: &str = "shuffle.sort.init-buffer-size";
pub const SHUFFLE_FILE_BUFFER_SIZE: &str = "shuffle.file.buffer-size";
pub const SHUFFLE_OUTPUT_BUFFER_SIZE: &str = "shuffle.unsafe.file.output-buffer-size";

/// Ceiling on the number of output partitions a serialized-mode writer will
/// accept. Chosen so partition ids pack comfortably alongside a 32-bit
/// insertion index in one sort key word (see [`crate::pointer`]).
pub const MAX_SHUFFLE_OUTPUT_PARTITIONS: u32 = 1 << 24;

const DEFAULT_SORT_INIT_BUFFER_SIZE: usize = 4096;
const DEFAULT_FILE_BUFFER_SIZE_KIB: usize = 32;
const DEFAULT_OUTPUT_BUFFER_SIZE_KIB: usize = 32;

#[derive(Debug, Clone)]
pub struct ShuffleWriterConfig {
    pub compress: bool,
    pub fast_merge_enabled: bool,
    pub transfer_to_enabled: bool,
    pub sort_init_buffer_size: usize,
    pub file_buffer_size: usize,
    pub output_buffer_size: usize,
}

impl Default for ShuffleWriterConfig {
    fn default() -> Self {
        ShuffleWriterConfig {
            compress: false,
            fast_merge_enabled: false,
            transfer_to_enabled: false,
            sort_init_buffer_size: DEFAULT_SORT_INIT_BUFFER_SIZE,
            file_buffer_size: DEFAULT_FILE_BUFFER_SIZE_KIB * 1024,
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE_KIB * 1024,
        }
    }
}

impl ShuffleWriterConfig {
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut cfg = ShuffleWriterConfig::default();

        if let Some(v) = props.get(SHUFFLE_COMPRESS) {
            cfg.compress = parse_bool(SHUFFLE_COMPRESS, v)?;
        }
        let fast_merge = props
            .get(SHUFFLE_FAST_MERGE_ENABLED)
            .or_else(|| props.get(SHUFFLE_FAST_MERGE_ENABLED_ALIAS));
        if let Some(v) = fast_merge {
            cfg.fast_merge_enabled = parse_bool(SHUFFLE_FAST_MERGE_ENABLED, v)?;
        }
        if let Some(v) = props.get(SHUFFLE_TRANSFER_TO) {
            cfg.transfer_to_enabled = parse_bool(SHUFFLE_TRANSFER_TO, v)?;
        }
        if let Some(v) = props.get(SHUFFLE_SORT_INIT_BUFFER_SIZE) {
            cfg.sort_init_buffer_size = parse_usize(SHUFFLE_SORT_INIT_BUFFER_SIZE, v)?;
        }
        if let Some(v) = props.get(SHUFFLE_FILE_BUFFER_SIZE) {
            cfg.file_buffer_size = parse_usize(SHUFFLE_FILE_BUFFER_SIZE, v)? * 1024;
        }
        if let Some(v) = props.get(SHUFFLE_OUTPUT_BUFFER_SIZE) {
            cfg.output_buffer_size = parse_usize(SHUFFLE_OUTPUT_BUFFER_SIZE, v)? * 1024;
        }
        Ok(cfg)
    }

    /// Validates `num_partitions` against the serialized-mode ceiling.
    /// Construction must fail before any resource (sorter, memory grant,
    /// spill file) is allocated.
    pub fn check_partition_ceiling(num_partitions: u32) -> Result<()> {
        if num_partitions > MAX_SHUFFLE_OUTPUT_PARTITIONS {
            return Err(ShuffleWriteError::configuration(format!(
                "cannot use serialized-mode shuffle writer with {num_partitions} partitions, \
                 the ceiling is {MAX_SHUFFLE_OUTPUT_PARTITIONS}"
            )));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value
        .trim()
        .parse::<bool>()
        .map_err(|_| ShuffleWriteError::configuration(format!("invalid boolean for {key}: {value}")))
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ShuffleWriteError::configuration(format!("invalid integer for {key}: {value}")))
}
