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

//! Typed façade over the out-of-process driver daemon.
//!
//! [`DriverApi`] is the surface the rest of the runtime programs against.
//! [`client::Client`] implements it over one framed socket connection per
//! process; [`emulator::DriverEmulator`] implements the same state machine in
//! process for tests and the `mock-driver` binary.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

pub mod client;
pub mod codec;
pub mod emulator;
pub mod protocol;

pub use client::{Client, ClientOptions};
pub use protocol::{InferRequest, IoDesc, IoSource, ModelParams, INVALID_EG_ID, INVALID_NN_ID};

/// Outcome of registering a shared-memory object with the driver.
/// `Unsupported` is the permanent signal: the driver build cannot do shared
/// memory at all, as opposed to a transient map failure (an `Err`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMapOutcome {
    Mapped { mapping_id: u64 },
    Unsupported,
}

/// Inline outputs of one completed inference, in driver `ofmap` order.
#[derive(Debug, Clone, Default)]
pub struct InferOutputs {
    pub ofmap: Vec<(String, Bytes)>,
}

impl InferOutputs {
    pub fn take(&mut self, name: &str) -> Option<Bytes> {
        let idx = self.ofmap.iter().position(|(n, _)| n == name)?;
        Some(self.ofmap.remove(idx).1)
    }

    /// Reassemble named output buffers from an infer response: the payload
    /// carries the concatenated bytes in `ofmap` declaration order.
    pub fn from_parts(
        operation: &str,
        ofmap: Vec<protocol::OfmapDesc>,
        mut payload: Bytes,
    ) -> Result<InferOutputs> {
        let total: u64 = ofmap.iter().map(|desc| desc.size).sum();
        if total != payload.len() as u64 {
            return Err(crate::error::Error::internal(format!(
                "driver {operation} response payload is {} bytes but ofmap declares {total}",
                payload.len()
            )));
        }
        let mut outputs = Vec::with_capacity(ofmap.len());
        for desc in ofmap {
            let buf = payload.split_to(desc.size as usize);
            outputs.push((desc.name, buf));
        }
        Ok(InferOutputs { ofmap: outputs })
    }
}

/// The driver RPC surface consumed by the runtime. Thread-safe; every method
/// maps driver failures into the status taxonomy, with the distinguished
/// numerical-anomaly completion treated as success.
#[async_trait]
pub trait DriverApi: Send + Sync {
    /// Create an execution group of `requested_cores` physical cores
    /// (`0` = the largest the driver can form). Returns the group handle and
    /// the granted core count.
    async fn create_eg(&self, requested_cores: u32) -> Result<(u32, u32)>;

    /// Destroy an execution group. With `from_shutdown`, an already-destroyed
    /// handle is not an error.
    async fn destroy_eg(&self, eg_id: u32, from_shutdown: bool) -> Result<()>;

    /// Stream a compiled artifact onto an execution group.
    async fn load(&self, eg_id: u32, artifact: &[u8], params: ModelParams) -> Result<u32>;

    /// Unload a model. With `from_shutdown`, an unknown handle is tolerated.
    async fn unload(&self, nn_id: u32, from_shutdown: bool) -> Result<()>;

    async fn start(&self, nn_id: u32) -> Result<()>;

    async fn stop(&self, nn_id: u32) -> Result<()>;

    /// Synchronous inference; `payload` carries the inline input bytes in
    /// `ifmap` order.
    async fn infer(&self, request: InferRequest, payload: Bytes) -> Result<InferOutputs>;

    /// Post one request into the model's driver-side queue; returns the
    /// cookie for [`DriverApi::infer_wait`].
    async fn infer_post(&self, request: InferRequest, payload: Bytes) -> Result<u64>;

    /// Block until the posted request identified by `cookie` completes.
    async fn infer_wait(&self, cookie: u64) -> Result<InferOutputs>;

    /// Register a shared-memory object with the driver.
    async fn shm_map(&self, path: &str, prot: u32) -> Result<ShmMapOutcome>;

    async fn shm_unmap(&self, path: &str, prot: u32) -> Result<()>;
}
