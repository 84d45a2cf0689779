// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-request I/O descriptor.
//!
//! A [`RuntimeIO`] bundles everything one inference needs on the wire: the
//! target model handle (rewritten in place from the primary to the active
//! duplicate by the device scheduler), the input payloads, the shared-memory
//! output bindings, the driver cookie of an outstanding post, and coarse
//! timing marks for latency logs.

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use crate::driver::{InferRequest, IoDesc, IoSource};

#[derive(Debug, Default, Clone)]
pub struct Timestamps {
    enter: Option<Instant>,
    above_post: Option<Instant>,
    below_wait: Option<Instant>,
    exit: Option<Instant>,
}

impl Timestamps {
    pub fn mark_enter(&mut self) {
        self.enter = Some(Instant::now());
    }

    pub fn mark_above_post(&mut self) {
        self.above_post = Some(Instant::now());
    }

    pub fn mark_below_wait(&mut self) {
        self.below_wait = Some(Instant::now());
    }

    pub fn mark_exit(&mut self) {
        self.exit = Some(Instant::now());
    }

    /// Coarse phase breakdown for trace logs.
    pub fn timing_string(&self) -> String {
        fn span(a: Option<Instant>, b: Option<Instant>) -> String {
            match (a, b) {
                (Some(a), Some(b)) => format!("{:?}", b.duration_since(a)),
                _ => "-".to_string(),
            }
        }
        format!(
            "queue={} device={} drain={}",
            span(self.enter, self.above_post),
            span(self.above_post, self.below_wait),
            span(self.below_wait, self.exit),
        )
    }
}

/// One request in flight between the operator and the driver.
#[derive(Debug, Default)]
pub struct RuntimeIO {
    /// Model handle this request targets. Callers set the primary id; the
    /// scheduler rewrites it to the active duplicate while posting.
    pub nn_id: u32,
    ifmap: Vec<IoDesc>,
    shm_ofmap: Vec<IoDesc>,
    payload: BytesMut,
    /// Outstanding-post cookie; present between post and wait.
    pub cookie: Option<u64>,
    pub timestamps: Timestamps,
}

impl RuntimeIO {
    pub fn new(nn_id: u32) -> RuntimeIO {
        let mut io = RuntimeIO {
            nn_id,
            ..RuntimeIO::default()
        };
        io.timestamps.mark_enter();
        io
    }

    /// Attach an input carried inline in the request payload.
    pub fn add_inline_input(&mut self, name: impl Into<String>, data: &[u8]) {
        self.ifmap.push(IoDesc {
            name: name.into(),
            source: IoSource::Inline {
                size: data.len() as u64,
            },
        });
        self.payload.extend_from_slice(data);
    }

    /// Attach an input already staged in a registered shared-memory object.
    pub fn add_shm_input(&mut self, name: impl Into<String>, path: impl Into<String>) {
        self.ifmap.push(IoDesc {
            name: name.into(),
            source: IoSource::Shm { path: path.into() },
        });
    }

    /// Bind an output to a registered shared-memory object; the driver writes
    /// it there instead of returning bytes inline.
    pub fn add_shm_output(&mut self, name: impl Into<String>, path: impl Into<String>) {
        self.shm_ofmap.push(IoDesc {
            name: name.into(),
            source: IoSource::Shm { path: path.into() },
        });
    }

    pub fn num_inputs(&self) -> usize {
        self.ifmap.len()
    }

    /// Render the wire request. The descriptor stays usable for retries; the
    /// payload is cheaply shared, not copied.
    pub fn to_request(&self) -> (InferRequest, Bytes) {
        (
            InferRequest {
                nn_id: self.nn_id,
                ifmap: self.ifmap.clone(),
                shm_ofmap: self.shm_ofmap.clone(),
            },
            self.payload.clone().freeze(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_inputs_concatenate_in_order() {
        let mut io = RuntimeIO::new(7);
        io.add_inline_input("a", &[1, 2]);
        io.add_inline_input("b", &[3]);
        let (request, payload) = io.to_request();
        assert_eq!(request.nn_id, 7);
        assert_eq!(request.ifmap.len(), 2);
        assert!(matches!(
            request.ifmap[0].source,
            IoSource::Inline { size: 2 }
        ));
        assert_eq!(&payload[..], &[1, 2, 3]);
    }

    #[test]
    fn shm_bindings_carry_no_payload() {
        let mut io = RuntimeIO::new(1);
        io.add_shm_input("x", "/neuron_clib_a");
        io.add_shm_output("y", "/neuron_clib_b");
        let (request, payload) = io.to_request();
        assert!(payload.is_empty());
        assert!(matches!(request.ifmap[0].source, IoSource::Shm { .. }));
        assert_eq!(request.shm_ofmap.len(), 1);
    }

    #[test]
    fn timing_string_tolerates_missing_marks() {
        let io = RuntimeIO::new(1);
        assert!(io.timestamps.timing_string().contains('-'));
    }
}
