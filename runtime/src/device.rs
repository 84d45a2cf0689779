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

//! Per-device model scheduler.
//!
//! A [`Device`] owns a set of execution groups and the models loaded onto
//! them. The hardware allows at most one running model per group, so every
//! lifecycle transition and every inference *post* serialises on one async
//! mutex; waits drain out-of-band. Model duplication loads the same artifact
//! onto each sibling group and spreads requests round-robin.
//!
//! Locking protocol: the operator takes the scheduler lock once per batch
//! through [`Device::lock_scheduler`] and passes the guard into the posting
//! calls; [`Device::infer_wait`] never touches the lock, which is what lets
//! the scheduler accept the next post while a prior request is still
//! executing on the accelerator.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use crate::driver::{DriverApi, InferOutputs, ModelParams, INVALID_NN_ID};
use crate::error::Error;
use crate::runtime_io::RuntimeIO;
use crate::shm::SharedMemoryPool;
use crate::Result;

/// One loaded artifact: the primary handle plus its duplicates.
struct ModelEntry {
    /// Sibling handles in execution-group order; index 0 is the primary.
    all_nn_ids: Vec<u32>,
    /// Round-robin cursor over `all_nn_ids`.
    active_idx: usize,
    #[allow(dead_code)]
    params: ModelParams,
}

/// Mutable scheduler state, guarded by the device mutex.
pub struct Scheduler {
    closed: bool,
    eg_ids: Vec<u32>,
    running_nn_id: u32,
    models: HashMap<u32, ModelEntry>,
}

pub type SchedulerGuard = OwnedMutexGuard<Scheduler>;

pub struct Device {
    driver: Arc<dyn DriverApi>,
    address: String,
    num_cores: u32,
    scheduler: Arc<Mutex<Scheduler>>,
    shm_pool: Option<Arc<SharedMemoryPool>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("num_cores", &self.num_cores)
            .finish()
    }
}

impl Device {
    /// Create the device's execution groups against the driver.
    ///
    /// `num_duplicates == 1` makes one group of `num_cores_requested` cores.
    /// `num_duplicates > 1` makes that many groups and requires the driver to
    /// grant exactly one core per group.
    pub async fn initialize(
        driver: Arc<dyn DriverApi>,
        address: &str,
        num_cores_requested: u32,
        num_duplicates: u32,
        shm_requested: bool,
    ) -> Result<Device> {
        let mut eg_ids = Vec::new();
        let mut num_cores = 0u32;

        if num_duplicates <= 1 {
            let (eg_id, granted) = driver.create_eg(num_cores_requested).await?;
            eg_ids.push(eg_id);
            num_cores = granted;
        } else {
            for _ in 0..num_duplicates {
                let (eg_id, granted) = match driver.create_eg(num_cores_requested).await {
                    Ok(created) => created,
                    Err(e) => {
                        destroy_egs(&driver, &eg_ids).await;
                        return Err(e);
                    }
                };
                eg_ids.push(eg_id);
                if granted != 1 {
                    destroy_egs(&driver, &eg_ids).await;
                    return Err(Error::invalid_argument(format!(
                        "core group size {granted} is not allowed in model duplication mode"
                    )));
                }
                num_cores += granted;
            }
        }

        let shm_pool = if shm_requested {
            match SharedMemoryPool::new(driver.clone(), address) {
                Ok(pool) => Some(Arc::new(pool)),
                Err(e) => {
                    tracing::warn!(
                        "shared memory is requested but unavailable ({e}); \
                         falling back to inline tensor transport"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Device {
            driver,
            address: address.to_string(),
            num_cores,
            scheduler: Arc::new(Mutex::new(Scheduler {
                closed: false,
                eg_ids,
                running_nn_id: INVALID_NN_ID,
                models: HashMap::new(),
            })),
            shm_pool,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn num_cores(&self) -> u32 {
        self.num_cores
    }

    pub fn shm_pool(&self) -> Option<&Arc<SharedMemoryPool>> {
        self.shm_pool.as_ref()
    }

    /// Number of loaded models.
    pub async fn num_executable(&self) -> usize {
        self.scheduler.lock().await.models.len()
    }

    /// Number of sibling groups a loaded model will span.
    pub async fn num_duplicates(&self) -> usize {
        self.scheduler.lock().await.eg_ids.len().max(1)
    }

    /// Take the device mutex for a batch of posts.
    pub async fn lock_scheduler(&self) -> SchedulerGuard {
        self.scheduler.clone().lock_owned().await
    }

    /// Load an artifact onto every execution group of the device.
    ///
    /// With duplicates, a failure on the first group fails the load; a
    /// failure on a later group stops duplicating and keeps the siblings
    /// that did load, which is still a valid smaller-throughput deployment.
    pub async fn load(&self, artifact: &[u8], params: ModelParams) -> Result<u32> {
        let mut sched = self.scheduler.lock().await;
        if sched.closed {
            return Err(Error::aborted("device is closed"));
        }
        if sched.eg_ids.is_empty() {
            return Err(Error::unavailable("device has no execution groups"));
        }

        let eg_ids = sched.eg_ids.clone();
        let mut all_nn_ids: Vec<u32> = Vec::with_capacity(eg_ids.len());
        if eg_ids.len() == 1 {
            all_nn_ids.push(self.driver.load(eg_ids[0], artifact, params).await?);
        } else {
            for eg_id in eg_ids {
                match self.driver.load(eg_id, artifact, params).await {
                    Ok(nn_id) => {
                        if let Some(primary) = all_nn_ids.first() {
                            tracing::debug!("duplicated model {primary} as {nn_id}");
                        }
                        all_nn_ids.push(nn_id);
                    }
                    Err(e) if all_nn_ids.is_empty() => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            "stop duplicating model {} due to error: {e}",
                            all_nn_ids[0]
                        );
                        break;
                    }
                }
            }
        }

        let primary = all_nn_ids[0];
        if sched.models.contains_key(&primary) {
            for nn_id in &all_nn_ids {
                if let Err(e) = self.driver.unload(*nn_id, false).await {
                    tracing::warn!("rollback unload of {nn_id} failed: {e}");
                }
            }
            return Err(Error::already_exists(format!(
                "model {primary} is already mapped"
            )));
        }
        sched.models.insert(
            primary,
            ModelEntry {
                all_nn_ids,
                active_idx: 0,
                params,
            },
        );
        tracing::debug!("loaded model {primary}");
        Ok(primary)
    }

    /// Ensure `nn_id` is the running model, stopping the incumbent first.
    /// All sibling starts/stops are posted concurrently and all awaited; a
    /// partial start is rolled back so the sibling set is never observable
    /// half-started.
    pub async fn start_model(&self, sched: &mut Scheduler, nn_id: u32) -> Result<()> {
        if sched.closed {
            return Err(Error::aborted("device is closed"));
        }
        if !sched.models.contains_key(&nn_id) {
            return Err(Error::invalid_argument(format!(
                "model {nn_id} is not loaded on this device"
            )));
        }

        if sched.running_nn_id != nn_id && sched.running_nn_id != INVALID_NN_ID {
            let incumbent = sched.running_nn_id;
            let siblings = sched
                .models
                .get(&incumbent)
                .map(|entry| entry.all_nn_ids.clone())
                .unwrap_or_default();
            self.stop_all(&siblings).await?;
            sched.running_nn_id = INVALID_NN_ID;
        }

        if sched.running_nn_id == INVALID_NN_ID {
            let siblings = sched.models[&nn_id].all_nn_ids.clone();
            let results = join_all(siblings.iter().map(|id| self.driver.start(*id))).await;
            if let Some(first_err) = results.iter().find_map(|r| r.as_ref().err()) {
                let first_err = first_err.clone();
                // roll the started siblings back before surfacing the error
                let started: Vec<u32> = siblings
                    .iter()
                    .zip(&results)
                    .filter(|(_, r)| r.is_ok())
                    .map(|(id, _)| *id)
                    .collect();
                let rollback = join_all(started.iter().map(|id| self.driver.stop(*id))).await;
                for (id, result) in started.iter().zip(rollback) {
                    if let Err(e) = result {
                        tracing::warn!("rollback stop of {id} failed: {e}");
                    }
                }
                return Err(first_err);
            }
            sched.running_nn_id = nn_id;
        }
        Ok(())
    }

    /// Stop every handle, attempting all of them before reporting the first
    /// failure.
    async fn stop_all(&self, nn_ids: &[u32]) -> Result<()> {
        let results = join_all(nn_ids.iter().map(|id| self.driver.stop(*id))).await;
        let mut first_err = None;
        for (id, result) in nn_ids.iter().zip(results) {
            match result {
                Ok(()) => tracing::debug!("stopped model {id}"),
                Err(e) => {
                    tracing::warn!("stop of model {id} failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rewrite `io.nn_id` from the primary to the active duplicate and
    /// advance the round-robin cursor.
    fn rewrite_active(sched: &mut Scheduler, io: &mut RuntimeIO) -> Result<()> {
        let entry = sched.models.get_mut(&io.nn_id).ok_or_else(|| {
            Error::invalid_argument(format!("no active id can be found from nn id {}", io.nn_id))
        })?;
        let idx = entry.active_idx;
        entry.active_idx = (idx + 1) % entry.all_nn_ids.len();
        io.nn_id = entry.all_nn_ids[idx];
        Ok(())
    }

    /// Synchronous inference: start if needed, post, and wait, all under the
    /// device mutex.
    pub async fn infer(&self, io: &mut RuntimeIO) -> Result<InferOutputs> {
        let mut sched = self.scheduler.lock().await;
        self.start_model(&mut sched, io.nn_id).await?;
        Self::rewrite_active(&mut sched, io)?;
        io.timestamps.mark_above_post();
        let (request, payload) = io.to_request();
        let outputs = self.driver.infer(request, payload).await;
        io.timestamps.mark_below_wait();
        outputs
    }

    /// Post one request under the caller-held scheduler guard. The returned
    /// permit is the scoped admission reservation; dropping it (on wait,
    /// failure, or unwind) releases the slot.
    pub async fn infer_post(
        &self,
        sched: &mut Scheduler,
        infer_sem: &Arc<Semaphore>,
        io: &mut RuntimeIO,
    ) -> Result<OwnedSemaphorePermit> {
        let permit = infer_sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::aborted("admission semaphore is closed"))?;
        self.start_model(sched, io.nn_id).await?;
        Self::rewrite_active(sched, io)?;
        io.timestamps.mark_above_post();
        let (request, payload) = io.to_request();
        let cookie = self.driver.infer_post(request, payload).await?;
        io.cookie = Some(cookie);
        Ok(permit)
    }

    /// Reap one outstanding post. Deliberately lock-free with respect to the
    /// scheduler mutex.
    pub async fn infer_wait(&self, io: &mut RuntimeIO) -> Result<InferOutputs> {
        let cookie = io
            .cookie
            .take()
            .ok_or_else(|| Error::internal("infer_wait without an outstanding post"))?;
        let outputs = self.driver.infer_wait(cookie).await?;
        io.timestamps.mark_below_wait();
        Ok(outputs)
    }

    /// Unload a model: stop it first when it is the running one, then drop
    /// every sibling. Driver failures are logged, not propagated.
    pub async fn unload(&self, nn_id: u32) {
        let mut sched = self.scheduler.lock().await;
        if sched.closed {
            return;
        }
        let Some(entry) = sched.models.remove(&nn_id) else {
            tracing::debug!("model {nn_id} is not loaded");
            return;
        };
        if sched.running_nn_id == nn_id {
            if let Err(e) = self.stop_all(&entry.all_nn_ids).await {
                tracing::warn!("stop during unload of {nn_id} failed: {e}");
            }
            sched.running_nn_id = INVALID_NN_ID;
        }
        for sibling in &entry.all_nn_ids {
            if let Err(e) = self.driver.unload(*sibling, false).await {
                tracing::warn!("unload of {sibling} failed: {e}");
            }
        }
        tracing::debug!(
            "unloaded model {nn_id}; {} models remain",
            sched.models.len()
        );
    }

    /// Tear the device down: stop and unload every model, destroy every
    /// execution group, clear the pool. From the fatal-signal path the
    /// device is additionally marked closed so later calls short-circuit
    /// with `ABORTED` instead of touching the driver again.
    pub async fn clear(&self, from_global_state: bool) {
        let mut sched = self.scheduler.lock().await;
        if sched.closed {
            return;
        }
        if from_global_state {
            sched.closed = true;
        }

        let entries: Vec<(u32, Vec<u32>)> = sched
            .models
            .iter()
            .map(|(primary, entry)| (*primary, entry.all_nn_ids.clone()))
            .collect();
        for (primary, siblings) in entries {
            if sched.running_nn_id == primary {
                if let Err(e) = self.stop_all(&siblings).await {
                    tracing::warn!("stop during clear failed: {e}");
                }
            }
            for sibling in siblings {
                if let Err(e) = self.driver.unload(sibling, from_global_state).await {
                    tracing::warn!("unload of {sibling} during clear failed: {e}");
                }
            }
        }

        let eg_ids = sched.eg_ids.clone();
        for eg_id in eg_ids {
            if let Err(e) = self.driver.destroy_eg(eg_id, from_global_state).await {
                tracing::warn!("destroy of eg {eg_id} during clear failed: {e}");
            }
        }

        if let Some(pool) = &self.shm_pool {
            pool.clear().await;
        }

        if !from_global_state {
            sched.running_nn_id = INVALID_NN_ID;
            sched.models.clear();
            sched.eg_ids.clear();
        }
    }
}

async fn destroy_egs(driver: &Arc<dyn DriverApi>, eg_ids: &[u32]) {
    for eg_id in eg_ids {
        if let Err(e) = driver.destroy_eg(*eg_id, false).await {
            tracing::warn!("destroy of eg {eg_id} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::emulator::{DriverEmulator, DriverOp, EmulatedExecutable};
    use crate::error::ErrorKind;

    const PARAMS: ModelParams = ModelParams {
        timeout: 10,
        max_in_flight: 1,
        profile_enabled: false,
    };

    fn artifact() -> Vec<u8> {
        EmulatedExecutable::new(vec![("y", 4)]).to_bytes()
    }

    async fn device(driver: &Arc<DriverEmulator>, cores: u32, dup: u32) -> Device {
        Device::initialize(
            driver.clone() as Arc<dyn DriverApi>,
            "unix:/tmp/driver.sock",
            cores,
            dup,
            false,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn duplication_requires_single_core_groups() {
        let driver = Arc::new(DriverEmulator::new(4));
        // requesting 2-core groups in duplication mode must be rejected
        let err = Device::initialize(
            driver.clone() as Arc<dyn DriverApi>,
            "unix:/tmp/driver.sock",
            2,
            2,
            false,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn swap_stops_incumbent_before_starting_target() {
        let driver = Arc::new(DriverEmulator::new(1));
        let device = device(&driver, 1, 1).await;

        let m1 = device.load(&artifact(), PARAMS).await.unwrap();
        let m2 = device.load(&artifact(), PARAMS).await.unwrap();

        let mut sched = device.lock_scheduler().await;
        device.start_model(&mut sched, m1).await.unwrap();
        driver.take_ops();
        device.start_model(&mut sched, m2).await.unwrap();
        assert_eq!(driver.take_ops(), vec![DriverOp::Stop(m1), DriverOp::Start(m2)]);

        // idempotent when already running
        device.start_model(&mut sched, m2).await.unwrap();
        assert!(driver.take_ops().is_empty());
    }

    #[tokio::test]
    async fn partial_duplication_is_retained() {
        let driver = Arc::new(DriverEmulator::new(3));
        let device = device(&driver, 1, 3).await;

        // third sibling load fails; the first two survive
        driver.plan_load_failures(vec![None, None, Some(crate::driver::protocol::code::INTERNAL)]);
        let primary = device.load(&artifact(), PARAMS).await.unwrap();

        let mut sched = device.lock_scheduler().await;
        device.start_model(&mut sched, primary).await.unwrap();
        let starts = driver
            .take_ops()
            .into_iter()
            .filter(|op| matches!(op, DriverOp::Start(_)))
            .count();
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn first_sibling_failure_fails_the_load() {
        let driver = Arc::new(DriverEmulator::new(2));
        let device = device(&driver, 1, 2).await;

        driver.plan_load_failures(vec![Some(
            crate::driver::protocol::code::RESOURCE_EXHAUSTED,
        )]);
        let err = device.load(&artifact(), PARAMS).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(driver.loaded_models(), 0);
    }

    #[tokio::test]
    async fn round_robin_cursor_spreads_duplicates() {
        let driver = Arc::new(DriverEmulator::new(2));
        let device = device(&driver, 1, 2).await;
        let primary = device.load(&artifact(), PARAMS).await.unwrap();

        let mut sched = device.lock_scheduler().await;
        device.start_model(&mut sched, primary).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let mut io = RuntimeIO::new(primary);
            Device::rewrite_active(&mut sched, &mut io).unwrap();
            seen.push(io.nn_id);
        }
        assert_eq!(seen[0], primary);
        assert_ne!(seen[1], primary);
        assert_eq!(seen[0], seen[2]);
        assert_eq!(seen[1], seen[3]);
    }

    #[tokio::test]
    async fn closed_device_aborts_everything() {
        let driver = Arc::new(DriverEmulator::new(1));
        let device = device(&driver, 1, 1).await;
        let nn = device.load(&artifact(), PARAMS).await.unwrap();

        device.clear(true).await;

        let err = device.load(&artifact(), PARAMS).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);

        let mut sched = device.lock_scheduler().await;
        let err = device.start_model(&mut sched, nn).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    }

    #[tokio::test]
    async fn unknown_primary_fails_setup_cleanly() {
        let driver = Arc::new(DriverEmulator::new(1));
        let device = device(&driver, 1, 1).await;
        let mut sched = device.lock_scheduler().await;
        let mut io = RuntimeIO::new(4242);
        let err = Device::rewrite_active(&mut sched, &mut io).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
