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

//! Driver daemon client.
//!
//! One framed connection per process, no reconnection. Requests carry an id;
//! a background reader task routes each response frame to the caller's
//! oneshot channel, so a caller blocked in `infer_wait` never stalls an
//! unrelated `infer_post` on the same connection. Artifact uploads hold the
//! writer across the whole chunk stream so frames of one load never
//! interleave with another upload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use derive_builder::Builder;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite};
use validator::{Validate, ValidationError};

use super::codec::{Frame, FrameCodec};
use super::protocol::{
    InferRequest, ModelParams, RequestBody, RequestFrame, ResponseBody, ResponseFrame,
    LOAD_MAX_CHUNK_SIZE,
};
use super::{DriverApi, InferOutputs, ShmMapOutcome};
use crate::config;
use crate::error::Error;
use crate::Result;

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;
type PendingMap = HashMap<u64, oneshot::Sender<(ResponseBody, Bytes)>>;

/// Driver client options.
///
/// The address defaults from the `DRIVER_ADDRESS` environment variable and
/// must carry a `unix:` or `tcp:` scheme.
#[derive(Debug, Clone, Builder, Validate)]
pub struct ClientOptions {
    #[builder(setter(into), default = "config::driver_address()")]
    #[validate(custom(function = "validate_address"))]
    address: String,
}

fn validate_address(address: &str) -> std::result::Result<(), ValidationError> {
    if address.starts_with("unix:") || address.starts_with("tcp:") {
        Ok(())
    } else {
        Err(ValidationError::new(
            "driver address must start with 'unix:' or 'tcp:'",
        ))
    }
}

impl ClientOptions {
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Validate the options and establish the connection.
    pub async fn connect(self) -> Result<Client> {
        self.validate()
            .map_err(|e| Error::invalid_argument(format!("driver client options: {e}")))?;

        let stream: BoxedStream = if let Some(path) = self.address.strip_prefix("unix:") {
            Box::new(UnixStream::connect(path).await.map_err(|e| {
                Error::unavailable(format!("cannot connect to driver at {}: {e}", self.address))
            })?)
        } else if let Some(addr) = self.address.strip_prefix("tcp:") {
            let stream = TcpStream::connect(addr).await.map_err(|e| {
                Error::unavailable(format!("cannot connect to driver at {}: {e}", self.address))
            })?;
            stream.set_nodelay(true)?;
            Box::new(stream)
        } else {
            return Err(Error::invalid_argument(format!(
                "unsupported driver address {}",
                self.address
            )));
        };

        Ok(Client::from_stream(stream, self.address))
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            address: config::driver_address(),
        }
    }
}

struct Shared {
    writer: tokio::sync::Mutex<FramedWrite<WriteHalf<BoxedStream>, FrameCodec>>,
    /// `None` once the reader task has observed the connection closing.
    pending: Mutex<Option<PendingMap>>,
    next_id: AtomicU64,
    address: String,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to the process-wide driver connection. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Connect with the environment-derived defaults.
    pub async fn from_settings() -> Result<Client> {
        ClientOptions::default().connect().await
    }

    fn from_stream(stream: BoxedStream, address: String) -> Client {
        let (read_half, write_half) = tokio::io::split(stream);
        let framed_writer = FramedWrite::new(write_half, FrameCodec::default());
        let framed_reader = FramedRead::new(read_half, FrameCodec::default());

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(framed_writer),
            pending: Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(1),
            address,
            reader: Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(framed_reader, shared.clone()));
        *shared.reader.lock().unwrap() = Some(task);

        Client { shared }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    fn register(&self) -> Result<(u64, oneshot::Receiver<(ResponseBody, Bytes)>)> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut pending = self.shared.pending.lock().unwrap();
        match pending.as_mut() {
            Some(map) => {
                map.insert(id, tx);
                Ok((id, rx))
            }
            None => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> Error {
        Error::unavailable(format!(
            "driver connection to {} is closed",
            self.shared.address
        ))
    }

    async fn await_response(
        &self,
        id: u64,
        rx: oneshot::Receiver<(ResponseBody, Bytes)>,
    ) -> Result<(ResponseBody, Bytes)> {
        match rx.await {
            Ok(reply) => Ok(reply),
            Err(_) => {
                // reader dropped the sender: connection is gone
                if let Some(map) = self.shared.pending.lock().unwrap().as_mut() {
                    map.remove(&id);
                }
                Err(self.closed_error())
            }
        }
    }

    async fn send_frame(&self, id: u64, body: &RequestBody, payload: Bytes) -> Result<()> {
        let header = serde_json::to_vec(&RequestFrame {
            id,
            body: body.clone(),
        })?;
        let mut writer = self.shared.writer.lock().await;
        writer
            .send(Frame::new(header.into(), payload))
            .await
            .map_err(|e| Error::unavailable(format!("driver send failed: {e}")))
    }

    /// One request, one response.
    async fn unary(&self, body: RequestBody, payload: Bytes) -> Result<(ResponseBody, Bytes)> {
        let (id, rx) = self.register()?;
        self.send_frame(id, &body, payload).await?;
        self.await_response(id, rx).await
    }

    /// Expect a bare-status response and surface the driver status.
    async fn unary_status(&self, operation: &str, body: RequestBody) -> Result<()> {
        let (body, _) = self.unary(body, Bytes::new()).await?;
        match body {
            ResponseBody::Status { status } if status.is_ok() => Ok(()),
            ResponseBody::Status { status } => Err(status.to_error(operation)),
            other => Err(unexpected_response(operation, &other)),
        }
    }
}

fn unexpected_response(operation: &str, body: &ResponseBody) -> Error {
    Error::internal(format!(
        "driver returned a mismatched response for {operation}: {body:?}"
    ))
}

async fn read_loop(mut reader: FramedRead<ReadHalf<BoxedStream>, FrameCodec>, shared: Arc<Shared>) {
    while let Some(next) = reader.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("driver connection read error: {e}");
                break;
            }
        };
        let envelope: ResponseFrame = match serde_json::from_slice(&frame.header) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("undecodable driver response header: {e}");
                break;
            }
        };
        let waiter = shared
            .pending
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|map| map.remove(&envelope.id));
        match waiter {
            Some(tx) => {
                let _ = tx.send((envelope.body, frame.payload));
            }
            None => {
                tracing::warn!(id = envelope.id, "driver response with no waiter");
            }
        }
    }
    // connection gone; fail everything still in flight
    shared.pending.lock().unwrap().take();
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.reader.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl DriverApi for Client {
    async fn create_eg(&self, requested_cores: u32) -> Result<(u32, u32)> {
        let (body, _) = self
            .unary(
                RequestBody::CreateEg {
                    num_cores: requested_cores,
                },
                Bytes::new(),
            )
            .await?;
        match body {
            ResponseBody::CreateEg {
                status,
                eg_id,
                num_cores,
            } if status.is_ok() => Ok((eg_id, num_cores)),
            ResponseBody::CreateEg { status, .. } => Err(status.to_error("create_eg")),
            other => Err(unexpected_response("create_eg", &other)),
        }
    }

    async fn destroy_eg(&self, eg_id: u32, from_shutdown: bool) -> Result<()> {
        self.unary_status(
            "destroy_eg",
            RequestBody::DestroyEg {
                eg_id,
                from_shutdown,
            },
        )
        .await
    }

    async fn load(&self, eg_id: u32, artifact: &[u8], params: ModelParams) -> Result<u32> {
        let (id, rx) = self.register()?;

        {
            // hold the writer across the whole upload stream
            let mut writer = self.shared.writer.lock().await;

            let begin = serde_json::to_vec(&RequestFrame {
                id,
                body: RequestBody::LoadBegin {
                    eg_id,
                    total_size: artifact.len() as u64,
                    params,
                },
            })?;
            writer
                .send(Frame::header_only(begin.into()))
                .await
                .map_err(|e| Error::unavailable(format!("driver send failed: {e}")))?;

            let mut pos = 0usize;
            loop {
                let remaining = artifact.len() - pos;
                let chunk_size = remaining.min(LOAD_MAX_CHUNK_SIZE);
                let last = pos + chunk_size == artifact.len();
                let header = serde_json::to_vec(&RequestFrame {
                    id,
                    body: RequestBody::LoadChunk { last },
                })?;
                writer
                    .send(Frame::new(
                        header.into(),
                        Bytes::copy_from_slice(&artifact[pos..pos + chunk_size]),
                    ))
                    .await
                    .map_err(|e| Error::unavailable(format!("driver send failed: {e}")))?;
                pos += chunk_size;
                if last {
                    break;
                }
            }
        }

        let (body, _) = self.await_response(id, rx).await?;
        match body {
            ResponseBody::Load { status, nn_id } if status.is_ok() => Ok(nn_id),
            ResponseBody::Load { status, .. } => Err(status.to_error("load")),
            other => Err(unexpected_response("load", &other)),
        }
    }

    async fn unload(&self, nn_id: u32, from_shutdown: bool) -> Result<()> {
        self.unary_status(
            "unload",
            RequestBody::Unload {
                nn_id,
                from_shutdown,
            },
        )
        .await
    }

    async fn start(&self, nn_id: u32) -> Result<()> {
        self.unary_status("start", RequestBody::Start { nn_id }).await
    }

    async fn stop(&self, nn_id: u32) -> Result<()> {
        self.unary_status("stop", RequestBody::Stop { nn_id }).await
    }

    async fn infer(&self, request: InferRequest, payload: Bytes) -> Result<InferOutputs> {
        let (body, data) = self.unary(RequestBody::Infer(request), payload).await?;
        match body {
            ResponseBody::Infer { status, ofmap } if status.is_ok() => {
                InferOutputs::from_parts("infer", ofmap, data)
            }
            ResponseBody::Infer { status, .. } => Err(status.to_error("infer")),
            other => Err(unexpected_response("infer", &other)),
        }
    }

    async fn infer_post(&self, request: InferRequest, payload: Bytes) -> Result<u64> {
        let (body, _) = self.unary(RequestBody::InferPost(request), payload).await?;
        match body {
            ResponseBody::InferPost { status, cookie } if status.is_ok() => Ok(cookie),
            ResponseBody::InferPost { status, .. } => Err(status.to_error("infer_post")),
            other => Err(unexpected_response("infer_post", &other)),
        }
    }

    async fn infer_wait(&self, cookie: u64) -> Result<InferOutputs> {
        let (body, data) = self
            .unary(RequestBody::InferWait { cookie }, Bytes::new())
            .await?;
        match body {
            ResponseBody::Infer { status, ofmap } if status.is_ok() => {
                InferOutputs::from_parts("infer_wait", ofmap, data)
            }
            ResponseBody::Infer { status, .. } => Err(status.to_error("infer_wait")),
            other => Err(unexpected_response("infer_wait", &other)),
        }
    }

    async fn shm_map(&self, path: &str, prot: u32) -> Result<ShmMapOutcome> {
        let (body, _) = self
            .unary(
                RequestBody::ShmMap {
                    path: path.to_string(),
                    prot,
                },
                Bytes::new(),
            )
            .await?;
        match body {
            ResponseBody::ShmMap { status, mapping_id } if status.is_ok() => {
                Ok(ShmMapOutcome::Mapped { mapping_id })
            }
            ResponseBody::ShmMap { status, .. }
                if status.code == super::protocol::code::SHM_UNSUPPORTED =>
            {
                Ok(ShmMapOutcome::Unsupported)
            }
            ResponseBody::ShmMap { status, .. } => Err(status.to_error("shm_map")),
            other => Err(unexpected_response("shm_map", &other)),
        }
    }

    async fn shm_unmap(&self, path: &str, prot: u32) -> Result<()> {
        self.unary_status(
            "shm_unmap",
            RequestBody::ShmUnmap {
                path: path.to_string(),
                prot,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_validate_address_scheme() {
        let opts = ClientOptions::builder()
            .address("unix:/tmp/driver.sock")
            .build()
            .unwrap();
        assert!(opts.validate().is_ok());

        let opts = ClientOptions::builder()
            .address("tcp:127.0.0.1:7700")
            .build()
            .unwrap();
        assert!(opts.validate().is_ok());

        let opts = ClientOptions::builder()
            .address("http://localhost")
            .build()
            .unwrap();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn options_default_from_environment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(crate::config::DRIVER_ADDRESS_ENV, "unix:/tmp/alt.sock");
            let opts = ClientOptions::default();
            assert_eq!(opts.address(), "unix:/tmp/alt.sock");
            Ok(())
        });
    }
}
