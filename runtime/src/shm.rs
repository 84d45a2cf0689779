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

//! Shared-memory tensor transport.
//!
//! Buffers are page-aligned mappings of named shared-memory objects,
//! registered with the driver once and recycled through a free-list keyed by
//! exact size. The object name is unlinked as soon as both sides hold their
//! mapping, so nothing lingers in the namespace.
//!
//! The pool owns every buffer; callers take a buffer out with
//! [`SharedMemoryPool::allocate`] and return it with
//! [`SharedMemoryPool::free`], so a buffer is referenced by at most one
//! request descriptor at a time.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::FromRawFd;
use std::sync::{Arc, Mutex};

use memmap2::MmapMut;

use crate::driver::{protocol, DriverApi, ShmMapOutcome};
use crate::error::Error;
use crate::Result;

const SHM_NAME_PREFIX: &str = "/neuron_clib_";
const SHM_NAME_ATTEMPTS: usize = 64;

/// One writable shared-memory mapping, registered with the driver.
pub struct SharedMemoryBuffer {
    path: String,
    size: usize,
    map: MmapMut,
    mapping_id: u64,
    /// Set when the driver refused the registration as permanently
    /// unsupported; such a buffer never leaves the pool.
    unsupported_by_runtime: bool,
}

impl SharedMemoryBuffer {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mapping_id(&self) -> u64 {
        self.mapping_id
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..self.size]
    }

    /// Copy `source` into the mapping. The driver reads the object through
    /// its own mapping, so this is the only write the host performs.
    pub fn write(&mut self, source: &[u8]) -> Result<()> {
        if source.len() > self.size {
            return Err(Error::out_of_range(format!(
                "copy of {} bytes exceeds shared-memory buffer of {} bytes",
                source.len(),
                self.size
            )));
        }
        self.map[..source.len()].copy_from_slice(source);
        Ok(())
    }
}

impl std::fmt::Debug for SharedMemoryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryBuffer")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("mapping_id", &self.mapping_id)
            .finish()
    }
}

#[derive(Default)]
struct PoolState {
    free: HashMap<usize, Vec<SharedMemoryBuffer>>,
    invalid: bool,
}

/// Size-classed pool of driver-registered shared-memory buffers.
pub struct SharedMemoryPool {
    driver: Arc<dyn DriverApi>,
    state: Mutex<PoolState>,
}

impl SharedMemoryPool {
    /// Shared memory rides on filesystem names, so the driver must be on a
    /// unix socket.
    pub fn new(driver: Arc<dyn DriverApi>, address: &str) -> Result<SharedMemoryPool> {
        if !address.starts_with("unix:") {
            return Err(Error::invalid_argument(
                "shared memory requires using unix socket",
            ));
        }
        Ok(SharedMemoryPool {
            driver,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Whether the pool is still usable. Flips permanently once the driver
    /// reports shared memory as unsupported.
    pub fn is_valid(&self) -> bool {
        !self.state.lock().unwrap().invalid
    }

    /// Take a buffer of exactly `size` bytes, reusing a freed one when
    /// available. `Ok(None)` means the pool is invalid and the caller must
    /// fall back to inline transport; `Err` is a transient failure.
    pub async fn allocate(&self, size: usize) -> Result<Option<SharedMemoryBuffer>> {
        {
            let mut state = self.state.lock().unwrap();
            if state.invalid {
                return Ok(None);
            }
            if let Some(buffer) = state.free.get_mut(&size).and_then(Vec::pop) {
                return Ok(Some(buffer));
            }
        }

        // mint outside the lock; registration is a driver round-trip
        let mut buffer = mint_buffer(size)?;
        let outcome = self
            .driver
            .shm_map(&buffer.path, protocol::PROT_READ | protocol::PROT_WRITE)
            .await;
        // both sides hold their mapping (or never will); drop the name
        unlink_object(&buffer.path);
        match outcome {
            Ok(ShmMapOutcome::Mapped { mapping_id }) => {
                buffer.mapping_id = mapping_id;
            }
            Ok(ShmMapOutcome::Unsupported) => {
                buffer.unsupported_by_runtime = true;
                tracing::warn!(
                    "driver reports shared memory unsupported; pool disabled permanently"
                );
                self.state.lock().unwrap().invalid = true;
                return Ok(None);
            }
            Err(e) => {
                return Err(e);
            }
        }

        // the invalid flag may have flipped while the lock was released
        let lost_race = {
            let state = self.state.lock().unwrap();
            state.invalid
        };
        if lost_race {
            let _ = self
                .driver
                .shm_unmap(&buffer.path, protocol::PROT_READ | protocol::PROT_WRITE)
                .await;
            return Ok(None);
        }
        Ok(Some(buffer))
    }

    /// Return a buffer to the free-list.
    pub fn free(&self, buffer: SharedMemoryBuffer) {
        let mut state = self.state.lock().unwrap();
        if state.invalid || buffer.unsupported_by_runtime {
            return;
        }
        state.free.entry(buffer.size).or_default().push(buffer);
    }

    /// Unregister and drop every pooled buffer.
    pub async fn clear(&self) {
        let buffers: Vec<SharedMemoryBuffer> = {
            let mut state = self.state.lock().unwrap();
            state.free.drain().flat_map(|(_, v)| v).collect()
        };
        for buffer in buffers {
            if let Err(e) = self
                .driver
                .shm_unmap(&buffer.path, protocol::PROT_READ | protocol::PROT_WRITE)
                .await
            {
                tracing::warn!("shm_unmap({}) failed during clear: {e}", buffer.path);
            }
        }
    }
}

impl std::fmt::Debug for SharedMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("SharedMemoryPool")
            .field("invalid", &state.invalid)
            .field("free_sizes", &state.free.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Create, size, and map a fresh named object. The name stays linked so the
/// driver can open it during registration; the caller unlinks it afterwards.
fn mint_buffer(size: usize) -> Result<SharedMemoryBuffer> {
    let (path, file) = open_unique_object()?;

    let unlink_on_error = |err: Error| {
        unlink_object(&path);
        err
    };

    file.set_len(size as u64)
        .map_err(|e| unlink_on_error(Error::internal(format!("ftruncate({path}): {e}"))))?;
    let map = unsafe { MmapMut::map_mut(&file) }
        .map_err(|e| unlink_on_error(Error::internal(format!("mmap({path}): {e}"))))?;

    Ok(SharedMemoryBuffer {
        path,
        size,
        map,
        mapping_id: 0,
        unsupported_by_runtime: false,
    })
}

fn open_unique_object() -> Result<(String, File)> {
    for _ in 0..SHM_NAME_ATTEMPTS {
        let path = format!("{SHM_NAME_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let name = std::ffi::CString::new(path.as_str())
            .map_err(|_| Error::internal("shm name contains NUL"))?;
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o666,
            )
        };
        if fd >= 0 {
            return Ok((path, unsafe { File::from_raw_fd(fd) }));
        }
        let errno = std::io::Error::last_os_error();
        if errno.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(Error::internal(format!("shm_open({path}): {errno}")));
        }
    }
    Err(Error::resource_exhausted(
        "cannot generate unique file name for shared memory",
    ))
}

fn unlink_object(path: &str) {
    if let Ok(name) = std::ffi::CString::new(path) {
        unsafe {
            libc::shm_unlink(name.as_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::emulator::DriverEmulator;

    fn pool_with_driver(driver: Arc<DriverEmulator>) -> SharedMemoryPool {
        SharedMemoryPool::new(driver, "unix:/tmp/driver.sock").unwrap()
    }

    #[tokio::test]
    async fn allocate_free_allocate_returns_the_same_buffer() {
        let driver = Arc::new(DriverEmulator::new(1));
        let pool = pool_with_driver(driver);

        let first = pool.allocate(4096).await.unwrap().unwrap();
        let path = first.path().to_string();
        pool.free(first);

        let second = pool.allocate(4096).await.unwrap().unwrap();
        assert_eq!(second.path(), path);
        pool.free(second);
    }

    #[tokio::test]
    async fn free_list_is_keyed_by_exact_size() {
        let driver = Arc::new(DriverEmulator::new(1));
        let pool = pool_with_driver(driver);

        let a = pool.allocate(1024).await.unwrap().unwrap();
        let path_a = a.path().to_string();
        pool.free(a);

        let b = pool.allocate(2048).await.unwrap().unwrap();
        assert_ne!(b.path(), path_a);
        pool.free(b);
    }

    #[tokio::test]
    async fn unsupported_driver_invalidates_the_pool() {
        let driver = Arc::new(DriverEmulator::without_shm(1));
        let pool = pool_with_driver(driver);

        assert!(pool.allocate(1024).await.unwrap().is_none());
        assert!(!pool.is_valid());
        assert!(pool.allocate(1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn driver_sees_writes_through_its_own_mapping() {
        let driver = Arc::new(DriverEmulator::new(1));
        let pool = pool_with_driver(driver.clone());

        let mut buffer = pool.allocate(8).await.unwrap().unwrap();
        buffer.write(&[9, 8, 7, 6, 5, 4, 3, 2]).unwrap();
        assert_eq!(buffer.as_slice(), &[9, 8, 7, 6, 5, 4, 3, 2]);
        pool.free(buffer);
        pool.clear().await;
    }

    #[test]
    fn non_unix_address_is_rejected() {
        let driver = Arc::new(DriverEmulator::new(1));
        let err = SharedMemoryPool::new(driver, "tcp:127.0.0.1:7700").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn oversized_writes_are_rejected() {
        // buffer minted directly, no driver registration involved
        let mut buffer = mint_buffer(4).unwrap();
        unlink_object(&buffer.path.clone());
        assert!(buffer.write(&[0; 8]).is_err());
        buffer.write(&[1, 2, 3, 4]).unwrap();
    }
}
