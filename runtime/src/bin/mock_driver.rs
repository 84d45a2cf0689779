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

//! Mock driver daemon for local development.
//!
//! Serves the driver wire protocol on a unix socket with emulated hardware:
//!
//! ```text
//! mock-driver /tmp/driver.sock 4
//! DRIVER_ADDRESS=unix:/tmp/driver.sock <application>
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UnixListener;

use npu_runtime::driver::emulator::DriverEmulator;
use npu_runtime::logging;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let mut args = std::env::args().skip(1);
    let socket_path = args.next().unwrap_or_else(|| "/tmp/driver.sock".to_string());
    let total_cores: u32 = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("core count must be an integer")?
        .unwrap_or(4);

    let _ = std::fs::remove_file(&socket_path);
    let listener =
        UnixListener::bind(&socket_path).with_context(|| format!("cannot bind {socket_path}"))?;
    tracing::info!("mock driver serving {total_cores} cores on {socket_path}");

    Arc::new(DriverEmulator::new(total_cores)).serve(listener).await;
    Ok(())
}
