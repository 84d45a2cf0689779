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

//! Process-wide device manager.
//!
//! Lazily initialised on the first [`DeviceManager::apply_for_device`]: the
//! driver connection is established, the core-grouping policy is read from
//! the environment, and one [`Device`] is created per policy group. Operator
//! instances then receive devices round-robin (or by explicit index).
//!
//! Inside a long-running server, `SIGINT`/`SIGTERM` trigger
//! [`DeviceManager::clear_from_global_state`] and re-raise the default
//! action; embedders that prefer deterministic teardown call
//! [`DeviceManager::shutdown`] themselves.

use std::sync::Arc;
use std::sync::Once;

use once_cell::sync::OnceCell;
use tokio::sync::Mutex;

use crate::config::{self, CoreGroupPolicy};
use crate::device::Device;
use crate::driver::{client::ClientOptions, DriverApi};
use crate::error::{Error, ErrorKind};
use crate::Result;

/// Upper bound on physical cores per host, which also bounds policy groups.
pub const MAX_NUM_CORES: usize = 64;

static GLOBAL: OnceCell<DeviceManager> = OnceCell::new();
static SIGNAL_HOOK: Once = Once::new();

struct ManagerState {
    driver: Option<Arc<dyn DriverApi>>,
    devices: Vec<Arc<Device>>,
    cursor: usize,
    ready: bool,
}

pub struct DeviceManager {
    state: Mutex<ManagerState>,
    handle_signals: bool,
}

impl DeviceManager {
    /// A manager that connects to the driver named by the environment on
    /// first use. No signal hook; intended for embedding and tests.
    pub fn new() -> DeviceManager {
        DeviceManager {
            state: Mutex::new(ManagerState {
                driver: None,
                devices: Vec::new(),
                cursor: 0,
                ready: false,
            }),
            handle_signals: false,
        }
    }

    /// A manager bound to an existing driver handle.
    pub fn with_driver(driver: Arc<dyn DriverApi>) -> DeviceManager {
        DeviceManager {
            state: Mutex::new(ManagerState {
                driver: Some(driver),
                devices: Vec::new(),
                cursor: 0,
                ready: false,
            }),
            handle_signals: false,
        }
    }

    /// The process-wide manager. Installs the fatal-signal teardown hook on
    /// first initialisation.
    pub fn global() -> &'static DeviceManager {
        GLOBAL.get_or_init(|| DeviceManager {
            state: Mutex::new(ManagerState {
                driver: None,
                devices: Vec::new(),
                cursor: 0,
                ready: false,
            }),
            handle_signals: true,
        })
    }

    /// Hand out a device for one operator instance.
    ///
    /// `opt_device_size` and `max_num_duplicates` only shape the default
    /// policy on the first call; an explicit `CORE_GROUP_SIZES` wins. A
    /// non-negative `device_index` inside the device range selects that
    /// device; anything else takes the round-robin cursor. The manager
    /// retains ownership of the returned device.
    pub async fn apply_for_device(
        &self,
        opt_device_size: i64,
        max_num_duplicates: i64,
        device_index: i64,
    ) -> Result<Arc<Device>> {
        let mut state = self.state.lock().await;
        if !state.ready {
            self.initialize(&mut state, opt_device_size, max_num_duplicates)
                .await?;
            if self.handle_signals {
                SIGNAL_HOOK.call_once(|| {
                    tokio::spawn(signal_handler());
                });
            }
        }

        if device_index >= 0 && (device_index as usize) < state.devices.len() {
            return Ok(state.devices[device_index as usize].clone());
        }
        let device = state.devices[state.cursor].clone();
        state.cursor = (state.cursor + 1) % state.devices.len();
        Ok(device)
    }

    pub async fn num_devices(&self) -> usize {
        self.state.lock().await.devices.len()
    }

    async fn initialize(
        &self,
        state: &mut ManagerState,
        opt_device_size: i64,
        max_num_duplicates: i64,
    ) -> Result<()> {
        config::append_tools_path();
        let address = config::driver_address();

        let driver: Arc<dyn DriverApi> = match &state.driver {
            Some(driver) => driver.clone(),
            None => {
                let client = ClientOptions::builder()
                    .address(address.clone())
                    .build()
                    .map_err(|e| Error::invalid_argument(format!("driver options: {e}")))?
                    .connect()
                    .await?;
                let driver: Arc<dyn DriverApi> = Arc::new(client);
                state.driver = Some(driver.clone());
                driver
            }
        };

        let shm_requested = config::shared_memory_requested();
        let policy = CoreGroupPolicy::from_env(opt_device_size, max_num_duplicates);

        let mut devices = Vec::new();
        let mut last_err: Option<Error> = None;

        if policy.search_largest {
            // the size is a hint; step down until the driver grants a group
            let hint = policy.groups[0].num_cores;
            for num_cores in (0..=hint).rev() {
                match Device::initialize(driver.clone(), &address, num_cores, 1, shm_requested)
                    .await
                {
                    Ok(device) => {
                        devices.push(Arc::new(device));
                        break;
                    }
                    Err(e) => {
                        last_err = Some(e);
                    }
                }
            }
        } else {
            for group in &policy.groups {
                match Device::initialize(
                    driver.clone(),
                    &address,
                    group.num_cores,
                    group.num_duplicates,
                    shm_requested,
                )
                .await
                {
                    Ok(device) => {
                        tracing::debug!(
                            "initialized core group of size {} ({} duplicates)",
                            group.num_cores,
                            group.num_duplicates
                        );
                        devices.push(Arc::new(device));
                    }
                    Err(e) => {
                        if e.kind() != ErrorKind::Aborted {
                            tracing::warn!(
                                "cannot initialize core group with {} cores; \
                                 stopping initialization",
                                group.num_cores
                            );
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }
        }

        if devices.is_empty() {
            return Err(last_err.unwrap_or_else(|| {
                Error::resource_exhausted("no execution group could be initialized")
            }));
        }

        state.devices = devices;
        state.cursor = 0;
        state.ready = true;
        Ok(())
    }

    /// Tear down every device and forget them. The manager may be
    /// re-initialised by a later `apply_for_device`.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        for device in &state.devices {
            device.clear(false).await;
        }
        Self::reset(&mut state);
        tracing::debug!("device manager cleared");
    }

    /// Teardown for the fatal-signal path: devices are additionally marked
    /// closed, so anything still holding one gets `ABORTED` instead of a
    /// second trip to the driver.
    pub async fn clear_from_global_state(&self) {
        let mut state = self.state.lock().await;
        for device in &state.devices {
            device.clear(true).await;
        }
        Self::reset(&mut state);
        tracing::debug!("device manager cleared from global state");
    }

    /// Tear down only when no device has a loaded model.
    pub async fn clear_if_empty(&self) {
        let mut state = self.state.lock().await;
        for device in &state.devices {
            if device.num_executable().await != 0 {
                return;
            }
        }
        for device in &state.devices {
            device.clear(false).await;
        }
        Self::reset(&mut state);
    }

    /// Deterministic counterpart of the signal hook.
    pub async fn shutdown(&self) {
        self.clear().await;
    }

    fn reset(state: &mut ManagerState) {
        state.devices.clear();
        state.cursor = 0;
        state.ready = false;
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        DeviceManager::new()
    }
}

/// Trap SIGINT/SIGTERM, tear the fleet down, then re-raise the default
/// action so the host process still dies with the conventional status.
async fn signal_handler() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("cannot install SIGINT handler: {e}");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {e}");
            return;
        }
    };

    let received = tokio::select! {
        _ = sigint.recv() => libc::SIGINT,
        _ = sigterm.recv() => libc::SIGTERM,
    };
    tracing::info!("termination signal received; tearing down accelerator state");
    DeviceManager::global().clear_from_global_state().await;

    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
        libc::raise(received);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::emulator::DriverEmulator;

    fn run<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn round_robin_assignment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(config::CORE_GROUP_SIZES_ENV, "1,1");
            jail.set_env(config::SHM_MAP_ENV, "no");
            run(async {
                let driver = Arc::new(DriverEmulator::new(2));
                let manager = DeviceManager::with_driver(driver);
                let a = manager.apply_for_device(1, 1, -1).await.unwrap();
                let b = manager.apply_for_device(1, 1, -1).await.unwrap();
                let c = manager.apply_for_device(1, 1, -1).await.unwrap();
                assert!(!Arc::ptr_eq(&a, &b));
                assert!(Arc::ptr_eq(&a, &c));
                assert_eq!(manager.num_devices().await, 2);
            });
            Ok(())
        });
    }

    #[test]
    fn explicit_index_bypasses_the_cursor() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(config::CORE_GROUP_SIZES_ENV, "1,1");
            jail.set_env(config::SHM_MAP_ENV, "no");
            run(async {
                let driver = Arc::new(DriverEmulator::new(2));
                let manager = DeviceManager::with_driver(driver);
                let a = manager.apply_for_device(1, 1, 1).await.unwrap();
                let b = manager.apply_for_device(1, 1, 1).await.unwrap();
                assert!(Arc::ptr_eq(&a, &b));
            });
            Ok(())
        });
    }

    #[test]
    fn fewer_devices_than_requested_is_not_fatal() {
        figment::Jail::expect_with(|jail| {
            // default policy for opt 1 wants four devices; only two cores exist
            jail.set_env(config::SHM_MAP_ENV, "no");
            run(async {
                let driver = Arc::new(DriverEmulator::new(2));
                let manager = DeviceManager::with_driver(driver);
                manager.apply_for_device(1, 1, -1).await.unwrap();
                assert_eq!(manager.num_devices().await, 2);
            });
            Ok(())
        });
    }

    #[test]
    fn largest_possible_search_steps_down() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(config::SHM_MAP_ENV, "no");
            run(async {
                let driver = Arc::new(DriverEmulator::new(2));
                let manager = DeviceManager::with_driver(driver);
                let device = manager.apply_for_device(5, 1, -1).await.unwrap();
                assert_eq!(device.num_cores(), 2);
            });
            Ok(())
        });
    }

    #[test]
    fn exhausted_driver_fails_initialization() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(config::CORE_GROUP_SIZES_ENV, "4");
            jail.set_env(config::SHM_MAP_ENV, "no");
            run(async {
                let driver = Arc::new(DriverEmulator::new(1));
                let manager = DeviceManager::with_driver(driver);
                let err = manager.apply_for_device(1, 1, -1).await.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
            });
            Ok(())
        });
    }

    #[test]
    fn clear_if_empty_only_sweeps_idle_devices() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
            jail.set_env(config::SHM_MAP_ENV, "no");
            run(async {
                use crate::driver::emulator::EmulatedExecutable;
                use crate::driver::ModelParams;

                let driver = Arc::new(DriverEmulator::new(1));
                let manager = DeviceManager::with_driver(driver);
                let device = manager.apply_for_device(1, 1, -1).await.unwrap();
                let primary = device
                    .load(
                        &EmulatedExecutable::new(vec![("y", 4)]).to_bytes(),
                        ModelParams {
                            timeout: 10,
                            max_in_flight: 1,
                            profile_enabled: false,
                        },
                    )
                    .await
                    .unwrap();

                manager.clear_if_empty().await;
                assert_eq!(manager.num_devices().await, 1);

                device.unload(primary).await;
                manager.clear_if_empty().await;
                assert_eq!(manager.num_devices().await, 0);
            });
            Ok(())
        });
    }
}
