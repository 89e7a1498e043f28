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

//! Error taxonomy for the shuffle writer.
//!
//! Mirrors the failure modes a map task can hit: bad configuration at
//! construction time, I/O failures against spill files and the map output
//! writer, memory denial from the memory manager, illegal use of the public
//! API, and secondary errors raised while cleaning up after a primary
//! failure.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, ShuffleWriteError>;

#[derive(thiserror::Error, Debug)]
pub enum ShuffleWriteError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("memory manager denied allocation of {requested} bytes after spilling")]
    OutOfMemory { requested: usize },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("cleanup error: {0}")]
    Cleanup(String),
}

impl ShuffleWriteError {
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        ShuffleWriteError::IllegalState(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        ShuffleWriteError::Configuration(msg.into())
    }

    pub fn cleanup(msg: impl Into<String>) -> Self {
        ShuffleWriteError::Cleanup(msg.into())
    }
}

/// Runs `cleanup`, folding its outcome into an already-in-flight primary
/// result the way the writer facade's `finally` blocks do: a cleanup failure
/// is only surfaced when the primary action had *succeeded*; otherwise it is
/// logged and swallowed so the root cause is not masked.
pub fn merge_cleanup_outcome<T>(
    primary: Result<T>,
    cleanup: std::result::Result<(), impl fmt::Display>,
) -> Result<T> {
    match (primary, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup_err)) => Err(ShuffleWriteError::cleanup(cleanup_err.to_string())),
        (Err(primary_err), Ok(())) => Err(primary_err),
        (Err(primary_err), Err(cleanup_err)) => {
            log::warn!(
                "suppressing cleanup error because a primary error is already in flight: {cleanup_err}"
            );
            Err(primary_err)
        }
    }
}
