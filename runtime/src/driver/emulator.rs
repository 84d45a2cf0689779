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

//! In-process driver emulator.
//!
//! Implements the driver state machine — execution groups, loaded models,
//! at-most-one-started-model-per-group, ordered per-model post queues, real
//! shared-memory access through mapped paths — without accelerator hardware.
//! Backs the integration tests (through [`DriverApi`]) and the `mock-driver`
//! binary (through [`DriverEmulator::serve`]).
//!
//! An "artifact" for the emulator is a json [`EmulatedExecutable`] naming the
//! model's outputs. Compute is deterministic: output `j` is input `j`'s bytes
//! cycled to the declared output size, so identity-shaped models echo their
//! inputs and slicing/stitching is observable bitwise.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::fd::FromRawFd;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use tokio::net::UnixListener;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{Frame, FrameCodec};
use super::protocol::{
    code, DriverStatus, InferRequest, IoSource, ModelParams, OfmapDesc, RequestBody, RequestFrame,
    ResponseBody, ResponseFrame,
};
use super::{DriverApi, InferOutputs, ShmMapOutcome};
use crate::Result;

/// Artifact format understood by the emulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatedExecutable {
    pub outputs: Vec<EmulatedOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatedOutput {
    pub name: String,
    pub size: usize,
}

impl EmulatedExecutable {
    pub fn new<S: Into<String>>(outputs: Vec<(S, usize)>) -> EmulatedExecutable {
        EmulatedExecutable {
            outputs: outputs
                .into_iter()
                .map(|(name, size)| EmulatedOutput {
                    name: name.into(),
                    size,
                })
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("emulated executable serializes")
    }
}

/// One observed driver call, recorded after validation succeeds. Tests use
/// the log to assert ordering properties (stop-before-start on a model swap,
/// round-robin dispatch across duplicates).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOp {
    CreateEg { num_cores: u32 },
    DestroyEg(u32),
    Load(u32),
    Unload(u32),
    Start(u32),
    Stop(u32),
    Infer(u32),
    InferPost(u32),
    InferWait(u64),
    ShmMap(String),
    ShmUnmap(String),
}

struct Model {
    eg_id: u32,
    #[allow(dead_code)]
    params: ModelParams,
    started: bool,
    outputs: Vec<EmulatedOutput>,
}

struct Completed {
    nn_id: u32,
    ofmap: Vec<OfmapDesc>,
    payload: Bytes,
}

#[derive(Default)]
struct State {
    next_eg_id: u32,
    next_nn_id: u32,
    next_cookie: u64,
    next_mapping_id: u64,
    cores_free: u32,
    egs: HashMap<u32, u32>,
    models: HashMap<u32, Model>,
    completed: HashMap<u64, Completed>,
    shm: HashMap<String, MmapMut>,
    ops: Vec<DriverOp>,
    outstanding: HashMap<u32, usize>,
    max_outstanding: HashMap<u32, usize>,
    load_failure_plan: VecDeque<Option<i32>>,
}

pub struct DriverEmulator {
    state: Mutex<State>,
    shm_supported: bool,
}

type DriverResult<T> = std::result::Result<T, DriverStatus>;

fn status_err<T>(status_code: i32, message: impl Into<String>) -> DriverResult<T> {
    Err(DriverStatus::new(status_code, message))
}

impl DriverEmulator {
    pub fn new(total_cores: u32) -> DriverEmulator {
        DriverEmulator {
            state: Mutex::new(State {
                next_eg_id: 1,
                next_nn_id: 1000,
                next_cookie: 1,
                next_mapping_id: 1,
                cores_free: total_cores,
                ..State::default()
            }),
            shm_supported: true,
        }
    }

    /// An emulator whose `shm_map` reports the permanent unsupported code.
    pub fn without_shm(total_cores: u32) -> DriverEmulator {
        DriverEmulator {
            shm_supported: false,
            ..DriverEmulator::new(total_cores)
        }
    }

    /// Schedule failures for upcoming `load` calls: each entry covers one
    /// call in order, `Some(code)` failing it and `None` letting it through.
    pub fn plan_load_failures(&self, plan: Vec<Option<i32>>) {
        self.state.lock().unwrap().load_failure_plan = plan.into();
    }

    /// Drain the recorded call log.
    pub fn take_ops(&self) -> Vec<DriverOp> {
        std::mem::take(&mut self.state.lock().unwrap().ops)
    }

    pub fn ops(&self) -> Vec<DriverOp> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Highest number of simultaneously outstanding posts observed for a
    /// model so far.
    pub fn max_outstanding(&self, nn_id: u32) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_outstanding
            .get(&nn_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn loaded_models(&self) -> usize {
        self.state.lock().unwrap().models.len()
    }

    fn do_create_eg(&self, requested: u32) -> DriverResult<(u32, u32)> {
        let mut state = self.state.lock().unwrap();
        let granted = if requested == 0 {
            state.cores_free
        } else {
            requested
        };
        if granted == 0 || granted > state.cores_free {
            return status_err(
                code::RESOURCE_EXHAUSTED,
                format!(
                    "no grouping of {requested} cores available ({} free)",
                    state.cores_free
                ),
            );
        }
        state.cores_free -= granted;
        let eg_id = state.next_eg_id;
        state.next_eg_id += 1;
        state.egs.insert(eg_id, granted);
        state.ops.push(DriverOp::CreateEg { num_cores: granted });
        Ok((eg_id, granted))
    }

    fn do_destroy_eg(&self, eg_id: u32, from_shutdown: bool) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(granted) = state.egs.remove(&eg_id) else {
            if from_shutdown {
                return Ok(());
            }
            return status_err(code::INVALID_ARGUMENT, format!("unknown eg {eg_id}"));
        };
        if !from_shutdown && state.models.values().any(|m| m.eg_id == eg_id) {
            state.egs.insert(eg_id, granted);
            return status_err(
                code::FAILED_PRECONDITION,
                format!("eg {eg_id} still has loaded models"),
            );
        }
        state.models.retain(|_, m| m.eg_id != eg_id);
        state.cores_free += granted;
        state.ops.push(DriverOp::DestroyEg(eg_id));
        Ok(())
    }

    fn do_load(&self, eg_id: u32, artifact: &[u8], params: ModelParams) -> DriverResult<u32> {
        let mut state = self.state.lock().unwrap();
        if let Some(Some(fail_code)) = state.load_failure_plan.pop_front() {
            return status_err(fail_code, "injected load failure");
        }
        if !state.egs.contains_key(&eg_id) {
            return status_err(code::INVALID_ARGUMENT, format!("unknown eg {eg_id}"));
        }
        let executable: EmulatedExecutable = serde_json::from_slice(artifact).map_err(|e| {
            DriverStatus::new(code::INVALID_ARGUMENT, format!("unreadable artifact: {e}"))
        })?;
        let nn_id = state.next_nn_id;
        state.next_nn_id += 1;
        state.models.insert(
            nn_id,
            Model {
                eg_id,
                params,
                started: false,
                outputs: executable.outputs,
            },
        );
        state.ops.push(DriverOp::Load(nn_id));
        Ok(nn_id)
    }

    fn do_unload(&self, nn_id: u32, from_shutdown: bool) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.models.get(&nn_id) {
            None if from_shutdown => return Ok(()),
            None => return status_err(code::INVALID_ARGUMENT, format!("unknown model {nn_id}")),
            Some(model) if model.started && !from_shutdown => {
                return status_err(
                    code::FAILED_PRECONDITION,
                    format!("model {nn_id} is still started"),
                );
            }
            Some(_) => {}
        }
        state.models.remove(&nn_id);
        state.ops.push(DriverOp::Unload(nn_id));
        Ok(())
    }

    fn do_start(&self, nn_id: u32) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(model) = state.models.get(&nn_id) else {
            return status_err(code::INVALID_ARGUMENT, format!("unknown model {nn_id}"));
        };
        let eg_id = model.eg_id;
        let conflict = state
            .models
            .iter()
            .any(|(id, m)| *id != nn_id && m.eg_id == eg_id && m.started);
        if conflict {
            return status_err(
                code::FAILED_PRECONDITION,
                format!("another model is already started on eg {eg_id}"),
            );
        }
        state.models.get_mut(&nn_id).unwrap().started = true;
        state.ops.push(DriverOp::Start(nn_id));
        Ok(())
    }

    fn do_stop(&self, nn_id: u32) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(model) = state.models.get_mut(&nn_id) else {
            return status_err(code::INVALID_ARGUMENT, format!("unknown model {nn_id}"));
        };
        model.started = false;
        state.ops.push(DriverOp::Stop(nn_id));
        Ok(())
    }

    /// Run the deterministic compute for one request.
    fn execute(
        state: &mut State,
        request: &InferRequest,
        mut payload: Bytes,
    ) -> DriverResult<(Vec<OfmapDesc>, Bytes)> {
        let Some(model) = state.models.get(&request.nn_id) else {
            return status_err(
                code::INVALID_ARGUMENT,
                format!("unknown model {}", request.nn_id),
            );
        };
        if !model.started {
            return status_err(
                code::FAILED_PRECONDITION,
                format!("model {} is not started", request.nn_id),
            );
        }
        let outputs = model.outputs.clone();

        let mut inputs: Vec<Bytes> = Vec::with_capacity(request.ifmap.len());
        for desc in &request.ifmap {
            match &desc.source {
                IoSource::Inline { size } => {
                    if payload.len() < *size as usize {
                        return status_err(
                            code::INVALID_ARGUMENT,
                            format!("inline payload underrun on input {}", desc.name),
                        );
                    }
                    inputs.push(payload.split_to(*size as usize));
                }
                IoSource::Shm { path } => {
                    let Some(mapping) = state.shm.get(path) else {
                        return status_err(
                            code::INVALID_ARGUMENT,
                            format!("input {} references unmapped shm {path}", desc.name),
                        );
                    };
                    inputs.push(Bytes::copy_from_slice(&mapping[..]));
                }
            }
        }

        let mut ofmap = Vec::new();
        let mut inline = BytesMut::new();
        for (idx, output) in outputs.iter().enumerate() {
            let source = inputs
                .get(idx)
                .or_else(|| inputs.last())
                .cloned()
                .unwrap_or_default();
            let produced = cycle_to_size(&source, output.size);

            let shm_target = request
                .shm_ofmap
                .iter()
                .find(|desc| desc.name == output.name);
            match shm_target.map(|desc| &desc.source) {
                Some(IoSource::Shm { path }) => {
                    let Some(mapping) = state.shm.get_mut(path) else {
                        return status_err(
                            code::INVALID_ARGUMENT,
                            format!("output {} references unmapped shm {path}", output.name),
                        );
                    };
                    if mapping.len() < produced.len() {
                        return status_err(
                            code::OUT_OF_RANGE,
                            format!("shm object {path} smaller than output {}", output.name),
                        );
                    }
                    mapping[..produced.len()].copy_from_slice(&produced);
                }
                _ => {
                    ofmap.push(OfmapDesc {
                        name: output.name.clone(),
                        size: produced.len() as u64,
                    });
                    inline.extend_from_slice(&produced);
                }
            }
        }
        Ok((ofmap, inline.freeze()))
    }

    fn do_infer(
        &self,
        request: InferRequest,
        payload: Bytes,
    ) -> DriverResult<(Vec<OfmapDesc>, Bytes)> {
        let mut state = self.state.lock().unwrap();
        let result = Self::execute(&mut state, &request, payload)?;
        state.ops.push(DriverOp::Infer(request.nn_id));
        Ok(result)
    }

    fn do_infer_post(&self, request: InferRequest, payload: Bytes) -> DriverResult<u64> {
        let mut state = self.state.lock().unwrap();
        let (ofmap, out_payload) = Self::execute(&mut state, &request, payload)?;
        let cookie = state.next_cookie;
        state.next_cookie += 1;
        state.completed.insert(
            cookie,
            Completed {
                nn_id: request.nn_id,
                ofmap,
                payload: out_payload,
            },
        );
        let outstanding = state.outstanding.entry(request.nn_id).or_insert(0);
        *outstanding += 1;
        let outstanding = *outstanding;
        let peak = state.max_outstanding.entry(request.nn_id).or_insert(0);
        *peak = (*peak).max(outstanding);
        state.ops.push(DriverOp::InferPost(request.nn_id));
        Ok(cookie)
    }

    fn do_infer_wait(&self, cookie: u64) -> DriverResult<(Vec<OfmapDesc>, Bytes)> {
        let mut state = self.state.lock().unwrap();
        let Some(completed) = state.completed.remove(&cookie) else {
            return status_err(code::INVALID_ARGUMENT, format!("unknown cookie {cookie}"));
        };
        if let Some(outstanding) = state.outstanding.get_mut(&completed.nn_id) {
            *outstanding = outstanding.saturating_sub(1);
        }
        state.ops.push(DriverOp::InferWait(cookie));
        Ok((completed.ofmap, completed.payload))
    }

    fn do_shm_map(&self, path: &str) -> DriverResult<u64> {
        if !self.shm_supported {
            return status_err(
                code::SHM_UNSUPPORTED,
                "shared memory is not supported by this driver build",
            );
        }
        let mapping = open_shm(path)?;
        let mut state = self.state.lock().unwrap();
        let mapping_id = state.next_mapping_id;
        state.next_mapping_id += 1;
        state.shm.insert(path.to_string(), mapping);
        state.ops.push(DriverOp::ShmMap(path.to_string()));
        Ok(mapping_id)
    }

    fn do_shm_unmap(&self, path: &str) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.shm.remove(path).is_none() {
            return status_err(code::INVALID_ARGUMENT, format!("shm {path} is not mapped"));
        }
        state.ops.push(DriverOp::ShmUnmap(path.to_string()));
        Ok(())
    }
}

/// Map an existing named shared-memory object writable.
fn open_shm(path: &str) -> DriverResult<MmapMut> {
    let name = std::ffi::CString::new(path)
        .map_err(|_| DriverStatus::new(code::INVALID_ARGUMENT, "shm path contains NUL"))?;
    let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0) };
    if fd < 0 {
        return status_err(
            code::INVALID_ARGUMENT,
            format!(
                "shm_open({path}) failed: {}",
                std::io::Error::last_os_error()
            ),
        );
    }
    let file = unsafe { File::from_raw_fd(fd) };
    let mapping = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
        DriverStatus::new(code::INTERNAL, format!("mmap of shm {path} failed: {e}"))
    })?;
    Ok(mapping)
}

fn cycle_to_size(source: &[u8], size: usize) -> Vec<u8> {
    if source.is_empty() {
        return vec![0u8; size];
    }
    let mut out = Vec::with_capacity(size);
    while out.len() < size {
        let take = (size - out.len()).min(source.len());
        out.extend_from_slice(&source[..take]);
    }
    out
}

#[async_trait]
impl DriverApi for DriverEmulator {
    async fn create_eg(&self, requested_cores: u32) -> Result<(u32, u32)> {
        self.do_create_eg(requested_cores)
            .map_err(|s| s.to_error("create_eg"))
    }

    async fn destroy_eg(&self, eg_id: u32, from_shutdown: bool) -> Result<()> {
        self.do_destroy_eg(eg_id, from_shutdown)
            .map_err(|s| s.to_error("destroy_eg"))
    }

    async fn load(&self, eg_id: u32, artifact: &[u8], params: ModelParams) -> Result<u32> {
        self.do_load(eg_id, artifact, params)
            .map_err(|s| s.to_error("load"))
    }

    async fn unload(&self, nn_id: u32, from_shutdown: bool) -> Result<()> {
        self.do_unload(nn_id, from_shutdown)
            .map_err(|s| s.to_error("unload"))
    }

    async fn start(&self, nn_id: u32) -> Result<()> {
        self.do_start(nn_id).map_err(|s| s.to_error("start"))
    }

    async fn stop(&self, nn_id: u32) -> Result<()> {
        self.do_stop(nn_id).map_err(|s| s.to_error("stop"))
    }

    async fn infer(&self, request: InferRequest, payload: Bytes) -> Result<InferOutputs> {
        let (ofmap, data) = self
            .do_infer(request, payload)
            .map_err(|s| s.to_error("infer"))?;
        InferOutputs::from_parts("infer", ofmap, data)
    }

    async fn infer_post(&self, request: InferRequest, payload: Bytes) -> Result<u64> {
        self.do_infer_post(request, payload)
            .map_err(|s| s.to_error("infer_post"))
    }

    async fn infer_wait(&self, cookie: u64) -> Result<InferOutputs> {
        let (ofmap, data) = self
            .do_infer_wait(cookie)
            .map_err(|s| s.to_error("infer_wait"))?;
        InferOutputs::from_parts("infer_wait", ofmap, data)
    }

    async fn shm_map(&self, path: &str, _prot: u32) -> Result<ShmMapOutcome> {
        match self.do_shm_map(path) {
            Ok(mapping_id) => Ok(ShmMapOutcome::Mapped { mapping_id }),
            Err(status) if status.code == code::SHM_UNSUPPORTED => Ok(ShmMapOutcome::Unsupported),
            Err(status) => Err(status.to_error("shm_map")),
        }
    }

    async fn shm_unmap(&self, path: &str, _prot: u32) -> Result<()> {
        self.do_shm_unmap(path).map_err(|s| s.to_error("shm_unmap"))
    }
}

/// Partially uploaded artifact on one connection.
struct PendingLoad {
    id: u64,
    eg_id: u32,
    total_size: u64,
    params: ModelParams,
    buffer: BytesMut,
}

impl DriverEmulator {
    /// Serve the wire protocol on a unix listener until the task is dropped.
    pub async fn serve(self: std::sync::Arc<Self>, listener: UnixListener) {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("mock driver accept failed: {e}");
                    return;
                }
            };
            let emulator = self.clone();
            tokio::spawn(async move {
                if let Err(e) = emulator.serve_connection(stream).await {
                    tracing::debug!("mock driver connection ended: {e}");
                }
            });
        }
    }

    async fn serve_connection(&self, stream: tokio::net::UnixStream) -> std::io::Result<()> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::default());
        let mut writer = FramedWrite::new(write_half, FrameCodec::default());
        let mut pending_load: Option<PendingLoad> = None;

        while let Some(frame) = reader.next().await {
            let frame = frame.map_err(std::io::Error::other)?;
            let request: RequestFrame = match serde_json::from_slice(&frame.header) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!("mock driver dropping undecodable request: {e}");
                    continue;
                }
            };

            let reply = match request.body {
                RequestBody::LoadBegin {
                    eg_id,
                    total_size,
                    params,
                } => {
                    pending_load = Some(PendingLoad {
                        id: request.id,
                        eg_id,
                        total_size,
                        params,
                        buffer: BytesMut::new(),
                    });
                    None
                }
                RequestBody::LoadChunk { last } => {
                    let stream_matches = pending_load
                        .as_ref()
                        .is_some_and(|load| load.id == request.id);
                    if !stream_matches {
                        Some((
                            ResponseBody::Load {
                                status: DriverStatus::new(
                                    code::FAILED_PRECONDITION,
                                    "chunk without a matching load stream",
                                ),
                                nn_id: super::INVALID_NN_ID,
                            },
                            Bytes::new(),
                        ))
                    } else {
                        let mut load = pending_load.take().unwrap();
                        load.buffer.extend_from_slice(&frame.payload);
                        if !last {
                            pending_load = Some(load);
                            None
                        } else {
                            let body = if load.buffer.len() as u64 != load.total_size {
                                ResponseBody::Load {
                                    status: DriverStatus::new(
                                        code::INVALID_ARGUMENT,
                                        format!(
                                            "artifact stream is {} bytes, header declared {}",
                                            load.buffer.len(),
                                            load.total_size
                                        ),
                                    ),
                                    nn_id: super::INVALID_NN_ID,
                                }
                            } else {
                                match self.do_load(load.eg_id, &load.buffer, load.params) {
                                    Ok(nn_id) => ResponseBody::Load {
                                        status: DriverStatus::ok(),
                                        nn_id,
                                    },
                                    Err(status) => ResponseBody::Load {
                                        status,
                                        nn_id: super::INVALID_NN_ID,
                                    },
                                }
                            };
                            Some((body, Bytes::new()))
                        }
                    }
                }
                RequestBody::CreateEg { num_cores } => Some(match self.do_create_eg(num_cores) {
                    Ok((eg_id, granted)) => (
                        ResponseBody::CreateEg {
                            status: DriverStatus::ok(),
                            eg_id,
                            num_cores: granted,
                        },
                        Bytes::new(),
                    ),
                    Err(status) => (
                        ResponseBody::CreateEg {
                            status,
                            eg_id: super::INVALID_EG_ID,
                            num_cores: 0,
                        },
                        Bytes::new(),
                    ),
                }),
                RequestBody::DestroyEg {
                    eg_id,
                    from_shutdown,
                } => Some(status_reply(self.do_destroy_eg(eg_id, from_shutdown))),
                RequestBody::Start { nn_id } => Some(status_reply(self.do_start(nn_id))),
                RequestBody::Stop { nn_id } => Some(status_reply(self.do_stop(nn_id))),
                RequestBody::Unload {
                    nn_id,
                    from_shutdown,
                } => Some(status_reply(self.do_unload(nn_id, from_shutdown))),
                RequestBody::Infer(infer) => Some(infer_reply(self.do_infer(infer, frame.payload))),
                RequestBody::InferPost(infer) => {
                    Some(match self.do_infer_post(infer, frame.payload) {
                        Ok(cookie) => (
                            ResponseBody::InferPost {
                                status: DriverStatus::ok(),
                                cookie,
                            },
                            Bytes::new(),
                        ),
                        Err(status) => (
                            ResponseBody::InferPost { status, cookie: 0 },
                            Bytes::new(),
                        ),
                    })
                }
                RequestBody::InferWait { cookie } => Some(infer_reply(self.do_infer_wait(cookie))),
                RequestBody::ShmMap { path, .. } => Some(match self.do_shm_map(&path) {
                    Ok(mapping_id) => (
                        ResponseBody::ShmMap {
                            status: DriverStatus::ok(),
                            mapping_id,
                        },
                        Bytes::new(),
                    ),
                    Err(status) => (
                        ResponseBody::ShmMap {
                            status,
                            mapping_id: 0,
                        },
                        Bytes::new(),
                    ),
                }),
                RequestBody::ShmUnmap { path, .. } => Some(status_reply(self.do_shm_unmap(&path))),
            };

            if let Some((body, payload)) = reply {
                let header = serde_json::to_vec(&ResponseFrame {
                    id: request.id,
                    body,
                })
                .map_err(std::io::Error::other)?;
                writer
                    .send(Frame::new(header.into(), payload))
                    .await
                    .map_err(std::io::Error::other)?;
            }
        }
        Ok(())
    }
}

fn status_reply(result: DriverResult<()>) -> (ResponseBody, Bytes) {
    let status = match result {
        Ok(()) => DriverStatus::ok(),
        Err(status) => status,
    };
    (ResponseBody::Status { status }, Bytes::new())
}

fn infer_reply(result: DriverResult<(Vec<OfmapDesc>, Bytes)>) -> (ResponseBody, Bytes) {
    match result {
        Ok((ofmap, payload)) => (
            ResponseBody::Infer {
                status: DriverStatus::ok(),
                ofmap,
            },
            payload,
        ),
        Err(status) => (
            ResponseBody::Infer {
                status,
                ofmap: Vec::new(),
            },
            Bytes::new(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::IoDesc;
    use crate::error::ErrorKind;

    fn identity_artifact(name: &str, size: usize) -> Vec<u8> {
        EmulatedExecutable::new(vec![(name, size)]).to_bytes()
    }

    fn inline_request(nn_id: u32, name: &str, data: &[u8]) -> (InferRequest, Bytes) {
        (
            InferRequest {
                nn_id,
                ifmap: vec![IoDesc {
                    name: name.to_string(),
                    source: IoSource::Inline {
                        size: data.len() as u64,
                    },
                }],
                shm_ofmap: vec![],
            },
            Bytes::copy_from_slice(data),
        )
    }

    #[tokio::test]
    async fn eg_capacity_is_enforced() {
        let driver = DriverEmulator::new(2);
        let (_, granted) = driver.create_eg(1).await.unwrap();
        assert_eq!(granted, 1);
        let err = driver.create_eg(4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn one_started_model_per_eg() {
        let driver = DriverEmulator::new(1);
        let (eg, _) = driver.create_eg(1).await.unwrap();
        let params = ModelParams {
            timeout: 10,
            max_in_flight: 1,
            profile_enabled: false,
        };
        let a = driver.load(eg, &identity_artifact("y", 4), params).await.unwrap();
        let b = driver.load(eg, &identity_artifact("y", 4), params).await.unwrap();
        driver.start(a).await.unwrap();
        let err = driver.start(b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        driver.stop(a).await.unwrap();
        driver.start(b).await.unwrap();
    }

    #[tokio::test]
    async fn post_wait_round_trip_echoes_input() {
        let driver = DriverEmulator::new(1);
        let (eg, _) = driver.create_eg(1).await.unwrap();
        let params = ModelParams {
            timeout: 10,
            max_in_flight: 2,
            profile_enabled: false,
        };
        let nn = driver.load(eg, &identity_artifact("y", 4), params).await.unwrap();
        driver.start(nn).await.unwrap();

        let (request, payload) = inline_request(nn, "x", &[1, 2, 3, 4]);
        let cookie = driver.infer_post(request, payload).await.unwrap();
        let mut outputs = driver.infer_wait(cookie).await.unwrap();
        assert_eq!(outputs.take("y").unwrap(), Bytes::from_static(&[1, 2, 3, 4]));
        assert_eq!(driver.max_outstanding(nn), 1);
    }

    #[tokio::test]
    async fn infer_on_stopped_model_is_rejected() {
        let driver = DriverEmulator::new(1);
        let (eg, _) = driver.create_eg(1).await.unwrap();
        let params = ModelParams {
            timeout: 10,
            max_in_flight: 1,
            profile_enabled: false,
        };
        let nn = driver.load(eg, &identity_artifact("y", 4), params).await.unwrap();
        let (request, payload) = inline_request(nn, "x", &[0; 4]);
        let err = driver.infer(request, payload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }

    #[tokio::test]
    async fn shutdown_paths_are_tolerant() {
        let driver = DriverEmulator::new(1);
        driver.unload(42, true).await.unwrap();
        driver.destroy_eg(42, true).await.unwrap();
        assert_eq!(driver.unload(42, false).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
}
