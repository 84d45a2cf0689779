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

//! Driver wire surface.
//!
//! The daemon's RPC message set is a given; this module renders it as typed
//! request/response bodies carried in two-part frames (json header + raw
//! payload). Inline tensor bytes ride in the payload part, concatenated in
//! `ifmap`/`ofmap` order, so tensor data never passes through json.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Sentinel for "no model".
pub const INVALID_NN_ID: u32 = u32::MAX;

/// Sentinel for "no execution group".
pub const INVALID_EG_ID: u32 = u32::MAX;

/// Artifact upload chunk ceiling.
pub const LOAD_MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Driver status codes. The set is open-ended; anything the runtime does not
/// recognise maps to [`Error::Internal`].
pub mod code {
    pub const OK: i32 = 0;
    /// The accelerator completed but flagged a numerical anomaly (inf/nan).
    /// Informational; treated as success by the host.
    pub const COMPLETED_WITH_NUM_ERR: i32 = 1;
    pub const INVALID_ARGUMENT: i32 = 2;
    pub const FAILED_PRECONDITION: i32 = 3;
    pub const RESOURCE_EXHAUSTED: i32 = 4;
    pub const UNAVAILABLE: i32 = 5;
    pub const ABORTED: i32 = 6;
    pub const ALREADY_EXISTS: i32 = 7;
    pub const OUT_OF_RANGE: i32 = 8;
    pub const INTERNAL: i32 = 9;
    /// Shared memory is not supported by this driver build. Permanent, as
    /// opposed to a transient map failure.
    pub const SHM_UNSUPPORTED: i32 = 10;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverStatus {
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl DriverStatus {
    pub fn ok() -> DriverStatus {
        DriverStatus {
            code: code::OK,
            message: String::new(),
        }
    }

    pub fn new(code: i32, message: impl Into<String>) -> DriverStatus {
        DriverStatus {
            code,
            message: message.into(),
        }
    }

    /// Success test. The numerical-anomaly completion code counts as success.
    pub fn is_ok(&self) -> bool {
        self.code == code::OK || self.code == code::COMPLETED_WITH_NUM_ERR
    }

    /// Convert a non-ok status into the runtime taxonomy, retaining the
    /// driver's message verbatim.
    pub fn to_error(&self, operation: &str) -> Error {
        let msg = format!("driver {operation}: {}", self.message);
        match self.code {
            code::INVALID_ARGUMENT => Error::InvalidArgument(msg),
            code::FAILED_PRECONDITION => Error::FailedPrecondition(msg),
            code::RESOURCE_EXHAUSTED => Error::ResourceExhausted(msg),
            code::UNAVAILABLE => Error::Unavailable(msg),
            code::ABORTED => Error::Aborted(msg),
            code::ALREADY_EXISTS => Error::AlreadyExists(msg),
            code::OUT_OF_RANGE => Error::OutOfRange(msg),
            code::SHM_UNSUPPORTED => Error::FailedPrecondition(msg),
            other => Error::Internal(format!(
                "driver {operation} returned unexpected code {other}: {}",
                self.message
            )),
        }
    }
}

/// Parameters stamped on a model at load time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelParams {
    /// Accelerator-side execution timeout per request, seconds.
    pub timeout: u32,
    /// Driver-side queue depth for this model.
    pub max_in_flight: u32,
    pub profile_enabled: bool,
}

/// Where one tensor's bytes live for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IoSource {
    /// `size` bytes carried in the frame payload, in declaration order.
    Inline { size: u64 },
    /// A shared-memory object registered earlier through `shm_map`.
    Shm { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoDesc {
    pub name: String,
    pub source: IoSource,
}

/// Body of `infer` / `infer_post`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferRequest {
    pub nn_id: u32,
    pub ifmap: Vec<IoDesc>,
    /// Output tensors the driver should place directly into shared memory
    /// instead of returning inline.
    pub shm_ofmap: Vec<IoDesc>,
}

/// One inline output tensor in an infer response; bytes ride in the frame
/// payload in `ofmap` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfmapDesc {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    CreateEg {
        /// `0` asks the driver for the largest group it can form.
        num_cores: u32,
    },
    DestroyEg {
        eg_id: u32,
        from_shutdown: bool,
    },
    /// Opens a streaming artifact upload; chunk frames with the same request
    /// id follow until one is marked `last`.
    LoadBegin {
        eg_id: u32,
        total_size: u64,
        params: ModelParams,
    },
    LoadChunk {
        last: bool,
    },
    Start {
        nn_id: u32,
    },
    Stop {
        nn_id: u32,
    },
    Unload {
        nn_id: u32,
        from_shutdown: bool,
    },
    Infer(InferRequest),
    InferPost(InferRequest),
    InferWait {
        cookie: u64,
    },
    ShmMap {
        path: String,
        prot: u32,
    },
    ShmUnmap {
        path: String,
        prot: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
    Status {
        status: DriverStatus,
    },
    CreateEg {
        status: DriverStatus,
        eg_id: u32,
        num_cores: u32,
    },
    Load {
        status: DriverStatus,
        nn_id: u32,
    },
    Infer {
        status: DriverStatus,
        ofmap: Vec<OfmapDesc>,
    },
    InferPost {
        status: DriverStatus,
        cookie: u64,
    },
    ShmMap {
        status: DriverStatus,
        mapping_id: u64,
    },
}

impl ResponseBody {
    pub fn status(&self) -> &DriverStatus {
        match self {
            ResponseBody::Status { status }
            | ResponseBody::CreateEg { status, .. }
            | ResponseBody::Load { status, .. }
            | ResponseBody::Infer { status, .. }
            | ResponseBody::InferPost { status, .. }
            | ResponseBody::ShmMap { status, .. } => status,
        }
    }
}

/// On-the-wire request header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub body: RequestBody,
}

/// On-the-wire response header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub body: ResponseBody,
}

/// Memory-protection flags for `shm_map`, mirroring `PROT_READ | PROT_WRITE`.
pub const PROT_READ: u32 = 0x1;
pub const PROT_WRITE: u32 = 0x2;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn anomaly_code_counts_as_success() {
        assert!(DriverStatus::ok().is_ok());
        assert!(DriverStatus::new(code::COMPLETED_WITH_NUM_ERR, "inf in output").is_ok());
        assert!(!DriverStatus::new(code::INTERNAL, "").is_ok());
    }

    #[test]
    fn known_codes_map_to_taxonomy() {
        let err = DriverStatus::new(code::RESOURCE_EXHAUSTED, "no cores").to_error("create_eg");
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("no cores"));
    }

    #[test]
    fn unknown_codes_map_to_internal() {
        let err = DriverStatus::new(12345, "???").to_error("infer");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
