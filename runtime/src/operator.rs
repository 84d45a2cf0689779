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

//! Inference operator.
//!
//! One instance per fused subgraph node. The first compute lazily claims a
//! device, uploads the compiled artifact, and preallocates reusable I/O
//! buffers; every compute after that validates shapes, splits oversized
//! batches into compiled-size micro-batches, streams them through the
//! device's pipelined post/wait queue under admission control, and stitches
//! the results back into caller-shaped output tensors.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio::sync::{Mutex, Semaphore};

use crate::device::Device;
use crate::device_manager::DeviceManager;
use crate::driver::ModelParams;
use crate::error::Error;
use crate::profiler::Profiler;
use crate::runtime_io::RuntimeIO;
use crate::shm::SharedMemoryBuffer;
use crate::tensor::{byte_len, DType, Tensor};
use crate::Result;

/// Accelerator-side execution timeout per request, seconds.
const INFER_TIMEOUT: u32 = 10;

/// Driver queue depth: deeper when the batch dimension is dynamic and the
/// operator will pipeline micro-batches, shallow otherwise.
const MAX_IN_FLIGHT_DYNAMIC: usize = 4;
const MAX_IN_FLIGHT_STATIC: usize = 1;

/// Attributes stamped on the fused graph node.
#[derive(Debug, Clone)]
pub struct OperatorAttributes {
    pub node_name: String,
    /// Compiled artifact; dropped after the first load.
    pub executable: Bytes,
    pub input_names: Vec<String>,
    pub input_dtypes: Vec<DType>,
    pub input_shapes: Vec<Vec<usize>>,
    /// `0` marks the leading dimension as the batch dimension; `-1` means
    /// the input is not batched.
    pub input_batch_axis: Vec<i64>,
    pub output_names: Vec<String>,
    pub output_dtypes: Vec<DType>,
    pub output_shapes: Vec<Vec<usize>>,
    pub output_batch_axis: Vec<i64>,
    /// Serialized subgraph, only consumed by the profile dump.
    pub graph_def: Bytes,
    /// Device-placement hints handed to the manager on first use.
    pub opt_device_size: i64,
    pub max_num_duplicates: i64,
    pub device_index: i64,
}

/// Everything that exists only after the lazy first-compute initialisation.
struct Ready {
    device: Arc<Device>,
    nn_id: u32,
    input_tensor_sizes: Vec<usize>,
    max_in_flight: usize,
    infer_sem: Arc<Semaphore>,
    use_shared_memory: bool,
    /// Reusable staging buffers, index-aligned with inputs/outputs. Guarded
    /// by their own lock: the sync path writes inputs before taking the
    /// device mutex.
    input_buffers: Mutex<Vec<SharedMemoryBuffer>>,
    output_buffers: Mutex<Vec<SharedMemoryBuffer>>,
    profiler: Mutex<Profiler>,
}

pub struct InferenceOperator {
    attrs: OperatorAttributes,
    manager: Option<Arc<DeviceManager>>,
    executable: Mutex<Option<Bytes>>,
    init_mutex: Mutex<()>,
    ready: OnceCell<Ready>,
    profile_enabled: bool,
}

impl InferenceOperator {
    /// Build an operator against the process-wide device manager.
    pub fn new(attrs: OperatorAttributes) -> InferenceOperator {
        Self::build(attrs, None)
    }

    /// Build an operator against a caller-owned manager.
    pub fn with_manager(attrs: OperatorAttributes, manager: Arc<DeviceManager>) -> InferenceOperator {
        Self::build(attrs, Some(manager))
    }

    fn build(mut attrs: OperatorAttributes, manager: Option<Arc<DeviceManager>>) -> InferenceOperator {
        let profiler = Profiler::from_env(&attrs.node_name);
        let profile_enabled = profiler.enabled();
        if profile_enabled {
            profiler.dump_info(&attrs.graph_def, &attrs.executable);
        }
        let executable = std::mem::take(&mut attrs.executable);
        InferenceOperator {
            attrs,
            manager,
            executable: Mutex::new(Some(executable)),
            init_mutex: Mutex::new(()),
            ready: OnceCell::new(),
            profile_enabled,
        }
    }

    fn manager(&self) -> &DeviceManager {
        match &self.manager {
            Some(manager) => manager,
            None => DeviceManager::global(),
        }
    }

    /// The loaded model's primary handle; `None` before the first compute.
    pub fn nn_id(&self) -> Option<u32> {
        self.ready.get().map(|ready| ready.nn_id)
    }

    async fn ensure_ready(&self) -> Result<&Ready> {
        if let Some(ready) = self.ready.get() {
            return Ok(ready);
        }
        let _guard = self.init_mutex.lock().await;
        if let Some(ready) = self.ready.get() {
            return Ok(ready);
        }
        let ready = self.initialize().await?;
        let _ = self.ready.set(ready);
        Ok(self.ready.get().expect("just initialised"))
    }

    async fn initialize(&self) -> Result<Ready> {
        let attrs = &self.attrs;
        if attrs.input_names.len() != attrs.input_dtypes.len()
            || attrs.input_names.len() != attrs.input_shapes.len()
        {
            return Err(Error::failed_precondition(format!(
                "incorrect number of inputs: {} names, {} dtypes, {} shapes",
                attrs.input_names.len(),
                attrs.input_dtypes.len(),
                attrs.input_shapes.len()
            )));
        }
        if attrs.output_names.len() != attrs.output_dtypes.len()
            || attrs.output_names.len() != attrs.output_shapes.len()
        {
            return Err(Error::failed_precondition(format!(
                "incorrect number of outputs: {} names, {} dtypes, {} shapes",
                attrs.output_names.len(),
                attrs.output_dtypes.len(),
                attrs.output_shapes.len()
            )));
        }

        let executable = self
            .executable
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::failed_precondition("operator has no executable"))?;

        let device = self
            .manager()
            .apply_for_device(
                attrs.opt_device_size,
                attrs.max_num_duplicates,
                attrs.device_index,
            )
            .await?;

        let dynamic_batch = attrs.input_batch_axis.iter().any(|axis| *axis != -1);
        let max_in_flight = if dynamic_batch {
            MAX_IN_FLIGHT_DYNAMIC
        } else {
            MAX_IN_FLIGHT_STATIC
        };

        let nn_id = device
            .load(
                &executable,
                ModelParams {
                    timeout: INFER_TIMEOUT,
                    max_in_flight: max_in_flight as u32,
                    profile_enabled: self.profile_enabled,
                },
            )
            .await?;

        let input_tensor_sizes: Vec<usize> = attrs
            .input_dtypes
            .iter()
            .zip(&attrs.input_shapes)
            .map(|(dtype, shape)| byte_len(*dtype, shape))
            .collect();
        let output_tensor_sizes: Vec<usize> = attrs
            .output_dtypes
            .iter()
            .zip(&attrs.output_shapes)
            .map(|(dtype, shape)| byte_len(*dtype, shape))
            .collect();

        // preallocate reusable staging buffers in shared memory when the
        // device pool is usable; plain heap tensors otherwise
        let mut use_shared_memory = false;
        let mut input_buffers = Vec::new();
        let mut output_buffers = Vec::new();
        if let Some(pool) = device.shm_pool() {
            match allocate_all(pool, &input_tensor_sizes, &output_tensor_sizes).await {
                Ok(Some((inputs, outputs))) => {
                    input_buffers = inputs;
                    output_buffers = outputs;
                    use_shared_memory = true;
                }
                Ok(None) => {
                    tracing::warn!(
                        "shared memory is requested but is not available; \
                         using inline transport for input/output tensors"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "shared-memory setup failed ({e}); \
                         using inline transport for input/output tensors"
                    );
                }
            }
        }

        // the artifact is no longer needed once the driver holds it
        self.executable.lock().await.take();

        tracing::debug!(
            "operator {} ready: model {nn_id}, max_in_flight {max_in_flight}, shm {use_shared_memory}",
            attrs.node_name
        );

        Ok(Ready {
            device,
            nn_id,
            input_tensor_sizes,
            max_in_flight,
            infer_sem: Arc::new(Semaphore::new(max_in_flight)),
            use_shared_memory,
            input_buffers: Mutex::new(input_buffers),
            output_buffers: Mutex::new(output_buffers),
            profiler: Mutex::new(Profiler::from_env(&attrs.node_name)),
        })
    }

    /// Run one inference over the node's input tensors.
    pub async fn compute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let ready = self.ensure_ready().await?;
        if inputs.len() != self.attrs.input_names.len() {
            return Err(Error::invalid_argument(format!(
                "incorrect number of input tensors: got {}, expected {}",
                inputs.len(),
                self.attrs.input_names.len()
            )));
        }

        let plan = self.validate_shapes(inputs)?;
        match plan.request_batch_size {
            Some(batch_size) => self.compute_batched(ready, inputs, batch_size, &plan).await,
            None => self.compute_single(ready, inputs).await,
        }
    }

    /// Shape validation per the stored attributes. Returns the batch plan:
    /// `request_batch_size` is set only when the request must be split.
    fn validate_shapes(&self, inputs: &[Tensor]) -> Result<BatchPlan> {
        let attrs = &self.attrs;
        let mut plan = BatchPlan::default();

        if attrs.input_names.len() != attrs.input_batch_axis.len()
            || attrs.output_names.len() != attrs.output_batch_axis.len()
        {
            // no usable batch hints; shapes must match exactly
            for (idx, tensor) in inputs.iter().enumerate() {
                if tensor.shape() != attrs.input_shapes[idx].as_slice() {
                    return Err(Error::invalid_argument(format!(
                        "incorrect shape found on input tensor {}: got {:?}, expected {:?}",
                        attrs.input_names[idx],
                        tensor.shape(),
                        attrs.input_shapes[idx]
                    )));
                }
            }
            return Ok(plan);
        }

        let mut batch_size: Option<usize> = None;
        let mut compiled_batch_size = 0usize;

        for (idx, tensor) in inputs.iter().enumerate() {
            let stored = &attrs.input_shapes[idx];
            let mut is_batch = false;
            if attrs.input_batch_axis[idx] == 0 {
                if tensor.shape().is_empty() || stored.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "no batch-dimension found on input tensor {} with shape {:?}",
                        attrs.input_names[idx],
                        tensor.shape()
                    )));
                }
                let dim0 = tensor.shape()[0];
                match batch_size {
                    None => {
                        if dim0 < 1 {
                            return Err(Error::invalid_argument(format!(
                                "incorrect batch size inferred from input tensor {} with shape {:?}",
                                attrs.input_names[idx],
                                tensor.shape()
                            )));
                        }
                        batch_size = Some(dim0);
                        compiled_batch_size = stored[0];
                    }
                    Some(expected) => {
                        if dim0 != expected {
                            return Err(Error::invalid_argument(format!(
                                "incorrect batch size found on input tensor {}: \
                                 shape {:?}, request batch size {expected}",
                                attrs.input_names[idx],
                                tensor.shape()
                            )));
                        }
                    }
                }
                if tensor.shape()[1..] != stored[1..] {
                    return Err(Error::invalid_argument(format!(
                        "incorrect shape found on input tensor {}: got {:?}, expected {:?}",
                        attrs.input_names[idx],
                        tensor.shape(),
                        stored
                    )));
                }
                is_batch = batch_size != Some(compiled_batch_size);
            } else if tensor.shape() != stored.as_slice() {
                return Err(Error::invalid_argument(format!(
                    "incorrect shape found on input tensor {}: got {:?}, expected {:?}",
                    attrs.input_names[idx],
                    tensor.shape(),
                    stored
                )));
            }
            plan.is_batch_input.push(is_batch);
        }

        let (Some(batch_size), true) = (batch_size, compiled_batch_size > 0) else {
            return Ok(plan);
        };

        for (idx, stored) in attrs.output_shapes.iter().enumerate() {
            let mut is_batch = false;
            if attrs.output_batch_axis[idx] == 0 {
                if stored.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "no batch-dimension found on output tensor {} with shape {:?}",
                        attrs.output_names[idx], stored
                    )));
                }
                if stored[0] != compiled_batch_size {
                    return Err(Error::invalid_argument(format!(
                        "incorrect batch size found on output tensor {}: \
                         shape {:?}, compiled batch size {compiled_batch_size}",
                        attrs.output_names[idx], stored
                    )));
                }
                is_batch = batch_size != compiled_batch_size;
            }
            plan.is_batch_output.push(is_batch);
        }

        if batch_size != compiled_batch_size {
            plan.request_batch_size = Some(batch_size);
            plan.compiled_batch_size = compiled_batch_size;
        }
        Ok(plan)
    }

    /// Single-request path: one synchronous infer under the device mutex,
    /// shared-memory staging when the pool is usable.
    async fn compute_single(&self, ready: &Ready, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let attrs = &self.attrs;
        let mut io = RuntimeIO::new(ready.nn_id);

        let use_shm = ready.use_shared_memory
            && ready
                .device
                .shm_pool()
                .map(|pool| pool.is_valid())
                .unwrap_or(false);

        // staged buffers are shared operator state: hold them across the call
        let mut input_buffers = ready.input_buffers.lock().await;
        let mut output_buffers = ready.output_buffers.lock().await;

        for (idx, tensor) in inputs.iter().enumerate() {
            if tensor.byte_len() != ready.input_tensor_sizes[idx] {
                return Err(Error::internal(format!(
                    "incorrect input tensor size {} found on {} ({} expected)",
                    tensor.byte_len(),
                    attrs.input_names[idx],
                    ready.input_tensor_sizes[idx]
                )));
            }
            if use_shm {
                let buffer = &mut input_buffers[idx];
                buffer.write(tensor.data())?;
                io.add_shm_input(attrs.input_names[idx].clone(), buffer.path());
            } else {
                io.add_inline_input(attrs.input_names[idx].clone(), tensor.data());
            }
        }
        if use_shm {
            for (idx, name) in attrs.output_names.iter().enumerate() {
                io.add_shm_output(name.clone(), output_buffers[idx].path());
            }
        }

        let mut profiler = ready.profiler.lock().await;
        profiler
            .start_session(ready.device.address(), ready.nn_id)
            .await;
        let result = ready.device.infer(&mut io).await;
        profiler.stop_session().await;
        drop(profiler);
        let mut outputs = result?;

        io.timestamps.mark_exit();
        tracing::trace!(
            "operator {}: {}",
            attrs.node_name,
            io.timestamps.timing_string()
        );

        let mut output_tensors = Vec::with_capacity(attrs.output_names.len());
        for (idx, name) in attrs.output_names.iter().enumerate() {
            let mut tensor = Tensor::zeroed(attrs.output_dtypes[idx], attrs.output_shapes[idx].clone());
            if use_shm {
                tensor.copy_from(output_buffers[idx].as_slice(), None)?;
            } else {
                let bytes = outputs.take(name).ok_or_else(|| {
                    Error::internal(format!("tensor name {name} not found in infer response"))
                })?;
                tensor.copy_from(&bytes, None)?;
            }
            output_tensors.push(tensor);
        }
        Ok(output_tensors)
    }

    /// Batch-split path: slice every batched input into compiled-size
    /// windows (padding the last), then stream the windows through the
    /// pipelined post/wait queue while holding the device mutex once for the
    /// whole request.
    async fn compute_batched(
        &self,
        ready: &Ready,
        inputs: &[Tensor],
        batch_size: usize,
        plan: &BatchPlan,
    ) -> Result<Vec<Tensor>> {
        let attrs = &self.attrs;
        let k = plan.compiled_batch_size;
        let num_batches = batch_size.div_ceil(k);

        // build one descriptor per micro-batch; inputs travel inline on this
        // path because windows of several requests are in flight at once
        let mut ios: Vec<RuntimeIO> = Vec::with_capacity(num_batches);
        for batch_idx in 0..num_batches {
            let row_start = batch_idx * k;
            let row_limit = ((batch_idx + 1) * k).min(batch_size);
            let mut io = RuntimeIO::new(ready.nn_id);
            for (idx, tensor) in inputs.iter().enumerate() {
                let name = attrs.input_names[idx].clone();
                if !plan.is_batch_input[idx] {
                    io.add_inline_input(name, tensor.data());
                    continue;
                }
                if row_limit - row_start == k {
                    io.add_inline_input(name, tensor.rows(row_start, row_limit)?);
                } else {
                    // residual window: copy the tail rows and zero the pad
                    let row_bytes = tensor.row_bytes()?;
                    let mut padded = vec![0u8; k * row_bytes];
                    let tail = tensor.rows(row_start, row_limit)?;
                    padded[..tail.len()].copy_from_slice(tail);
                    io.add_inline_input(name, &padded);
                }
            }
            ios.push(io);
        }

        // caller-shaped outputs: batched ones get the request batch size,
        // non-batched ones keep the compiled shape
        let mut output_tensors: Vec<Tensor> = attrs
            .output_names
            .iter()
            .enumerate()
            .map(|(idx, _)| {
                let mut shape = attrs.output_shapes[idx].clone();
                if plan.is_batch_output[idx] {
                    shape[0] = batch_size;
                }
                Tensor::zeroed(attrs.output_dtypes[idx], shape)
            })
            .collect();

        let output_row_bytes: Vec<usize> = attrs
            .output_shapes
            .iter()
            .zip(&attrs.output_dtypes)
            .map(|(shape, dtype)| byte_len(*dtype, shape) / shape.first().copied().unwrap_or(1).max(1))
            .collect();

        // one scheduler acquisition for the whole batch
        let mut sched = ready.device.lock_scheduler().await;
        let mut permits = VecDeque::with_capacity(ready.max_in_flight);

        let mut start = 0usize;
        while start < num_batches {
            let end = (start + ready.max_in_flight).min(num_batches);
            for io in ios.iter_mut().take(end).skip(start) {
                let permit = ready
                    .device
                    .infer_post(&mut sched, &ready.infer_sem, io)
                    .await?;
                permits.push_back(permit);
            }
            for batch_idx in start..end {
                let mut outputs = ready.device.infer_wait(&mut ios[batch_idx]).await?;
                permits.pop_front();

                let row_start = batch_idx * k;
                let row_limit = ((batch_idx + 1) * k).min(batch_size);
                for (idx, name) in attrs.output_names.iter().enumerate() {
                    let bytes = outputs.take(name).ok_or_else(|| {
                        Error::internal(format!(
                            "tensor name {name} not found in infer response"
                        ))
                    })?;
                    if plan.is_batch_output[idx] {
                        // truncate the final window to the residual rows
                        let copy_len = (row_limit - row_start) * output_row_bytes[idx];
                        if copy_len > bytes.len() {
                            return Err(Error::out_of_range(format!(
                                "driver returned {} bytes for {name}, {copy_len} required",
                                bytes.len()
                            )));
                        }
                        output_tensors[idx].copy_rows_from(row_start, &bytes[..copy_len])?;
                    } else {
                        output_tensors[idx].copy_from(&bytes, None)?;
                    }
                }
            }
            start = end;
        }
        drop(sched);

        Ok(output_tensors)
    }

    /// Release the model and its buffers. Mirrors the framework destroying
    /// the graph node; without it the device keeps the model until teardown.
    pub async fn close(&self) {
        let Some(ready) = self.ready.get() else {
            return;
        };
        ready.device.unload(ready.nn_id).await;
        if let Some(pool) = ready.device.shm_pool() {
            for buffer in ready.input_buffers.lock().await.drain(..) {
                pool.free(buffer);
            }
            for buffer in ready.output_buffers.lock().await.drain(..) {
                pool.free(buffer);
            }
        }
        self.manager().clear_if_empty().await;
    }
}

#[derive(Debug, Default)]
struct BatchPlan {
    /// Set only when the request batch differs from the compiled batch.
    request_batch_size: Option<usize>,
    compiled_batch_size: usize,
    is_batch_input: Vec<bool>,
    is_batch_output: Vec<bool>,
}

/// Allocate the full staging set, or roll back to nothing. `Ok(None)` means
/// the pool has gone permanently invalid.
async fn allocate_all(
    pool: &Arc<crate::shm::SharedMemoryPool>,
    input_sizes: &[usize],
    output_sizes: &[usize],
) -> Result<Option<(Vec<SharedMemoryBuffer>, Vec<SharedMemoryBuffer>)>> {
    let mut buffers = Vec::with_capacity(input_sizes.len() + output_sizes.len());
    for size in input_sizes.iter().chain(output_sizes) {
        match pool.allocate(*size).await {
            Ok(Some(buffer)) => buffers.push(buffer),
            Ok(None) => {
                for buffer in buffers {
                    pool.free(buffer);
                }
                return Ok(None);
            }
            Err(e) => {
                for buffer in buffers {
                    pool.free(buffer);
                }
                return Err(e);
            }
        }
    }
    let outputs = buffers.split_off(input_sizes.len());
    Ok(Some((buffers, outputs)))
}
