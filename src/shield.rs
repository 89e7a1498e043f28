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

//! Terminates a wrapper chain without closing the sink underneath it.
//!
//! Codec and encryption layers flush their trailing state on `close`, but
//! the partition sink they write into must survive until the merge engine
//! decides to move on to the next partition. Wrapping the sink in a
//! [`ShieldedWriter`] before building the encrypt/compress chain makes
//! `close()`/`flush()` calls from the outer layers land on a no-op instead
//! of on the sink.

use std::io::Write;

pub struct ShieldedWriter<'w> {
    inner: &'w mut dyn Write,
}

impl<'w> ShieldedWriter<'w> {
    pub fn new(inner: &'w mut dyn Write) -> Self {
        ShieldedWriter { inner }
    }
}

impl<'w> Write for ShieldedWriter<'w> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    /// A real flush still has to propagate so codec buffers empty out; only
    /// `close` is shielded. Forwarding here is deliberate, not an oversight.
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
