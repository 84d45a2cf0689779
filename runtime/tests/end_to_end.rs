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

//! End-to-end scenarios against the emulated driver.
//!
//! Environment-sensitive setup runs inside `figment::Jail`, which both
//! isolates the variables and serialises the tests, with a current-thread
//! runtime driving the async runtime core.

use std::sync::Arc;

use bytes::Bytes;

use npu_runtime::config;
use npu_runtime::driver::emulator::{DriverEmulator, DriverOp, EmulatedExecutable};
use npu_runtime::driver::DriverApi;
use npu_runtime::operator::{InferenceOperator, OperatorAttributes};
use npu_runtime::tensor::byte_len;
use npu_runtime::{DType, DeviceManager, ErrorKind, Tensor};

fn run<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

/// An artifact whose emulated outputs echo the like-indexed inputs.
fn artifact(outputs: Vec<(&str, usize)>) -> Bytes {
    EmulatedExecutable::new(outputs).to_bytes().into()
}

/// Attributes for a one-input/one-output model compiled at batch `k`.
fn unary_attrs(name: &str, k: usize, row: usize) -> OperatorAttributes {
    OperatorAttributes {
        node_name: name.to_string(),
        executable: artifact(vec![("y", byte_len(DType::U8, &[k, row]))]),
        input_names: vec!["x".to_string()],
        input_dtypes: vec![DType::U8],
        input_shapes: vec![vec![k, row]],
        input_batch_axis: vec![0],
        output_names: vec!["y".to_string()],
        output_dtypes: vec![DType::U8],
        output_shapes: vec![vec![k, row]],
        output_batch_axis: vec![0],
        graph_def: Bytes::new(),
        opt_device_size: 1,
        max_num_duplicates: 1,
        device_index: -1,
    }
}

fn tensor_of_rows(rows: usize, row: usize) -> Tensor {
    let data: Vec<u8> = (0..rows * row).map(|i| (i % 251) as u8).collect();
    Tensor::from_bytes(DType::U8, vec![rows, row], data).unwrap()
}

fn infer_ids(ops: &[DriverOp]) -> Vec<u32> {
    ops.iter()
        .filter_map(|op| match op {
            DriverOp::Infer(id) => Some(*id),
            _ => None,
        })
        .collect()
}

#[test]
fn single_request_without_batching() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
        jail.set_env(config::SHM_MAP_ENV, "no");
        run(async {
            let driver = Arc::new(DriverEmulator::new(1));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));

            let attrs = OperatorAttributes {
                node_name: "dense".to_string(),
                executable: artifact(vec![("y", byte_len(DType::F32, &[1, 16]))]),
                input_names: vec!["x".to_string()],
                input_dtypes: vec![DType::F32],
                input_shapes: vec![vec![1, 32]],
                input_batch_axis: vec![0],
                output_names: vec!["y".to_string()],
                output_dtypes: vec![DType::F32],
                output_shapes: vec![vec![1, 16]],
                output_batch_axis: vec![0],
                graph_def: Bytes::new(),
                opt_device_size: 1,
                max_num_duplicates: 1,
                device_index: -1,
            };
            let operator = InferenceOperator::with_manager(attrs, manager);

            let input = Tensor::zeroed(DType::F32, vec![1, 32]);
            let outputs = operator.compute(&[input.clone()]).await.unwrap();
            assert_eq!(outputs.len(), 1);
            assert_eq!(outputs[0].shape(), &[1, 16]);
            assert_eq!(outputs[0].dtype(), DType::F32);

            // first compute started the idle device exactly once and ran one
            // synchronous infer
            let ops = driver.take_ops();
            let starts = ops.iter().filter(|op| matches!(op, DriverOp::Start(_))).count();
            assert_eq!(starts, 1);
            assert_eq!(infer_ids(&ops).len(), 1);

            // the model is already running: no second start
            operator.compute(&[input]).await.unwrap();
            let ops = driver.take_ops();
            assert!(ops.iter().all(|op| !matches!(op, DriverOp::Start(_))));
            assert_eq!(infer_ids(&ops).len(), 1);
        });
        Ok(())
    });
}

#[test]
fn exact_multiple_batch_split() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
        jail.set_env(config::SHM_MAP_ENV, "no");
        run(async {
            let driver = Arc::new(DriverEmulator::new(1));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));
            let operator = InferenceOperator::with_manager(unary_attrs("split", 2, 4), manager);

            let input = tensor_of_rows(4, 4);
            let outputs = operator.compute(&[input.clone()]).await.unwrap();

            // no padding: the stitched output is bitwise the input
            assert_eq!(outputs[0].shape(), &[4, 4]);
            assert_eq!(outputs[0].data(), input.data());

            // both micro-batches were posted before the first wait
            let ops = driver.take_ops();
            let pipeline: Vec<&DriverOp> = ops
                .iter()
                .filter(|op| matches!(op, DriverOp::InferPost(_) | DriverOp::InferWait(_)))
                .collect();
            assert!(matches!(
                pipeline[..],
                [
                    DriverOp::InferPost(_),
                    DriverOp::InferPost(_),
                    DriverOp::InferWait(_),
                    DriverOp::InferWait(_)
                ]
            ));
        });
        Ok(())
    });
}

#[test]
fn padded_batch_split_returns_exactly_b_rows() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
        jail.set_env(config::SHM_MAP_ENV, "no");
        run(async {
            let driver = Arc::new(DriverEmulator::new(1));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));
            let operator = InferenceOperator::with_manager(unary_attrs("padded", 2, 4), manager);

            // B=5, K=2: three micro-batches, the last padded with one zero row
            let input = tensor_of_rows(5, 4);
            let outputs = operator.compute(&[input.clone()]).await.unwrap();

            assert_eq!(outputs[0].shape(), &[5, 4]);
            assert_eq!(outputs[0].data(), input.data());

            let ops = driver.take_ops();
            let posts = ops.iter().filter(|op| matches!(op, DriverOp::InferPost(_))).count();
            assert_eq!(posts, 3);
        });
        Ok(())
    });
}

#[test]
fn model_swap_stops_before_starting() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
        jail.set_env(config::SHM_MAP_ENV, "no");
        run(async {
            let driver = Arc::new(DriverEmulator::new(1));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));

            let op1 = InferenceOperator::with_manager(unary_attrs("m1", 1, 4), manager.clone());
            let op2 = InferenceOperator::with_manager(unary_attrs("m2", 1, 4), manager);

            let input = tensor_of_rows(1, 4);
            op1.compute(&[input.clone()]).await.unwrap();
            let m1 = op1.nn_id().unwrap();

            driver.take_ops();
            op2.compute(&[input.clone()]).await.unwrap();
            let m2 = op2.nn_id().unwrap();

            // before the second infer the driver saw stop(M1) then start(M2)
            let ops = driver.take_ops();
            let lifecycle: Vec<&DriverOp> = ops
                .iter()
                .filter(|op| matches!(op, DriverOp::Start(_) | DriverOp::Stop(_)))
                .collect();
            assert_eq!(lifecycle, vec![&DriverOp::Stop(m1), &DriverOp::Start(m2)]);

            // and swapping back reverses the pair
            op1.compute(&[input]).await.unwrap();
            let ops = driver.take_ops();
            let lifecycle: Vec<&DriverOp> = ops
                .iter()
                .filter(|op| matches!(op, DriverOp::Start(_) | DriverOp::Stop(_)))
                .collect();
            assert_eq!(lifecycle, vec![&DriverOp::Stop(m2), &DriverOp::Start(m1)]);
        });
        Ok(())
    });
}

#[test]
fn duplicated_model_round_robins_across_siblings() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "2x1");
        jail.set_env(config::SHM_MAP_ENV, "no");
        run(async {
            let driver = Arc::new(DriverEmulator::new(2));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));
            let operator = InferenceOperator::with_manager(unary_attrs("dup", 1, 4), manager);

            let input = tensor_of_rows(1, 4);
            for _ in 0..4 {
                operator.compute(&[input.clone()]).await.unwrap();
            }

            let dispatched = infer_ids(&driver.take_ops());
            assert_eq!(dispatched.len(), 4);
            let a = dispatched[0];
            let b = dispatched[1];
            assert_ne!(a, b);
            assert_eq!(dispatched, vec![a, b, a, b]);
        });
        Ok(())
    });
}

#[test]
fn shared_memory_disabled_stays_inline() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
        jail.set_env(config::SHM_MAP_ENV, "no");
        run(async {
            let driver = Arc::new(DriverEmulator::new(1));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));
            let operator = InferenceOperator::with_manager(unary_attrs("inline", 2, 4), manager);

            let input = tensor_of_rows(2, 4);
            let outputs = operator.compute(&[input.clone()]).await.unwrap();
            assert_eq!(outputs[0].data(), input.data());

            // the pool is never consulted: the driver saw no shm traffic
            let ops = driver.take_ops();
            assert!(ops
                .iter()
                .all(|op| !matches!(op, DriverOp::ShmMap(_) | DriverOp::ShmUnmap(_))));
        });
        Ok(())
    });
}

#[test]
fn shared_memory_round_trip_through_the_pool() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
        // SHM_MAP unset: shared memory stays enabled
        run(async {
            let driver = Arc::new(DriverEmulator::new(1));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));
            let operator = InferenceOperator::with_manager(unary_attrs("shm", 2, 4), manager);

            let input = tensor_of_rows(2, 4);
            let outputs = operator.compute(&[input.clone()]).await.unwrap();
            assert_eq!(outputs[0].data(), input.data());

            // staging buffers were registered and the infer carried no
            // inline payload in either direction
            let ops = driver.take_ops();
            assert!(ops.iter().any(|op| matches!(op, DriverOp::ShmMap(_))));

            operator.close().await;
        });
        Ok(())
    });
}

#[test]
fn unsupported_driver_falls_back_to_inline() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
        run(async {
            let driver = Arc::new(DriverEmulator::without_shm(1));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));
            let operator = InferenceOperator::with_manager(unary_attrs("fallback", 2, 4), manager);

            let input = tensor_of_rows(2, 4);
            let outputs = operator.compute(&[input.clone()]).await.unwrap();
            assert_eq!(outputs[0].data(), input.data());
        });
        Ok(())
    });
}

#[test]
fn outstanding_posts_never_exceed_max_in_flight() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
        jail.set_env(config::SHM_MAP_ENV, "no");
        run(async {
            let driver = Arc::new(DriverEmulator::new(1));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));
            let operator = InferenceOperator::with_manager(unary_attrs("deep", 2, 4), manager);

            // 8 micro-batches against a window of 4
            let input = tensor_of_rows(16, 4);
            let outputs = operator.compute(&[input.clone()]).await.unwrap();
            assert_eq!(outputs[0].data(), input.data());

            let nn_id = operator.nn_id().unwrap();
            assert!(driver.max_outstanding(nn_id) <= 4);
            assert!(driver.max_outstanding(nn_id) >= 2);
        });
        Ok(())
    });
}

#[test]
fn mismatched_shapes_are_rejected() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
        jail.set_env(config::SHM_MAP_ENV, "no");
        run(async {
            let driver = Arc::new(DriverEmulator::new(1));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));
            let operator = InferenceOperator::with_manager(unary_attrs("strict", 2, 4), manager);

            // row width 5 instead of 4
            let bad = Tensor::zeroed(DType::U8, vec![2, 5]);
            let err = operator.compute(&[bad]).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);

            let missing = operator.compute(&[]).await.unwrap_err();
            assert_eq!(missing.kind(), ErrorKind::InvalidArgument);
        });
        Ok(())
    });
}

#[test]
fn teardown_aborts_later_computes() {
    figment::Jail::expect_with(|jail| {
        jail.set_env(config::CORE_GROUP_SIZES_ENV, "1");
        jail.set_env(config::SHM_MAP_ENV, "no");
        run(async {
            let driver = Arc::new(DriverEmulator::new(1));
            let manager = Arc::new(DeviceManager::with_driver(driver.clone()));
            let operator = InferenceOperator::with_manager(unary_attrs("doomed", 1, 4), manager.clone());

            let input = tensor_of_rows(1, 4);
            operator.compute(&[input.clone()]).await.unwrap();

            manager.clear_from_global_state().await;
            driver.take_ops();

            let err = operator.compute(&[input]).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Aborted);
            // the closed device never went back to the driver
            assert!(driver.take_ops().is_empty());
        });
        Ok(())
    });
}

#[test]
fn wire_client_round_trip_against_the_emulator() {
    figment::Jail::expect_with(|_jail| {
        run(async {
            use npu_runtime::driver::{ClientOptions, InferRequest, IoDesc, IoSource, ModelParams};

            let dir = tempfile::tempdir().unwrap();
            let socket_path = dir.path().join("driver.sock");
            let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
            let emulator = Arc::new(DriverEmulator::new(2));
            tokio::spawn(emulator.clone().serve(listener));

            let client = ClientOptions::builder()
                .address(format!("unix:{}", socket_path.display()))
                .build()
                .unwrap()
                .connect()
                .await
                .unwrap();

            let (eg_id, granted) = client.create_eg(2).await.unwrap();
            assert_eq!(granted, 2);

            // a large artifact exercises the chunked upload path
            let mut artifact = EmulatedExecutable::new(vec![("y", 8)]).to_bytes();
            let padding = 3 * 1024 * 1024 - artifact.len();
            artifact.extend(vec![b' '; padding]);
            let nn_id = client
                .load(
                    eg_id,
                    &artifact,
                    ModelParams {
                        timeout: 10,
                        max_in_flight: 2,
                        profile_enabled: false,
                    },
                )
                .await
                .unwrap();

            client.start(nn_id).await.unwrap();

            let request = InferRequest {
                nn_id,
                ifmap: vec![IoDesc {
                    name: "x".to_string(),
                    source: IoSource::Inline { size: 8 },
                }],
                shm_ofmap: vec![],
            };
            let payload = Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]);

            let mut outputs = client.infer(request.clone(), payload.clone()).await.unwrap();
            assert_eq!(outputs.take("y").unwrap(), payload);

            let cookie = client.infer_post(request, payload.clone()).await.unwrap();
            let mut outputs = client.infer_wait(cookie).await.unwrap();
            assert_eq!(outputs.take("y").unwrap(), payload);

            client.stop(nn_id).await.unwrap();
            client.unload(nn_id, false).await.unwrap();
            client.destroy_eg(eg_id, false).await.unwrap();
        });
        Ok(())
    });
}
