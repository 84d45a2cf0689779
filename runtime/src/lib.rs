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

//! Host-side serving runtime for NPU accelerator fleets.
//!
//! The runtime sits between a compute-graph framework and an out-of-process
//! driver daemon. It partitions accelerator cores into execution groups,
//! schedules loaded models on them (at most one running model per group),
//! and streams inference requests through a pipelined post/wait queue with
//! shared-memory tensor transport where the driver supports it.
//!
//! Entry points:
//!
//! - [`DeviceManager::apply_for_device`] hands a device to an operator
//!   instance according to the core-grouping policy.
//! - [`InferenceOperator`] drives one compiled model across its lifetime:
//!   lazy load, batch splitting, admission control, result stitching.

pub mod config;
pub mod device;
pub mod device_manager;
pub mod driver;
pub mod error;
pub mod logging;
pub mod operator;
pub mod profiler;
pub mod runtime_io;
pub mod shm;
pub mod tensor;

pub use device::Device;
pub use device_manager::DeviceManager;
pub use error::{Error, ErrorKind, Result};
pub use operator::{InferenceOperator, OperatorAttributes};
pub use runtime_io::RuntimeIO;
pub use tensor::{DType, Tensor};
