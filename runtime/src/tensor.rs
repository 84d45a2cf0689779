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

//! Narrow tensor container.
//!
//! The enclosing framework has its own tensor type; the runtime only needs a
//! dense row-major byte container with a dtype and a shape, enough to slice
//! micro-batches along the leading dimension and stitch results back.

use serde::{Deserialize, Serialize};

use crate::{error::Error, Result};

/// Element types accepted by the accelerator toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
}

impl DType {
    /// Size of a single element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 | DType::U32 | DType::I32 => 4,
            DType::F16 | DType::BF16 | DType::U16 | DType::I16 => 2,
            DType::U8 | DType::I8 => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::U8 => "u8",
            DType::I8 => "i8",
            DType::U16 => "u16",
            DType::I16 => "i16",
            DType::U32 => "u32",
            DType::I32 => "i32",
        }
    }
}

/// Dense row-major tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// A zero-filled tensor of the given shape.
    pub fn zeroed(dtype: DType, shape: Vec<usize>) -> Tensor {
        let len = byte_len(dtype, &shape);
        Tensor {
            dtype,
            shape,
            data: vec![0u8; len],
        }
    }

    /// Wrap existing bytes; the byte length must match the shape exactly.
    pub fn from_bytes(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Tensor> {
        let expected = byte_len(dtype, &shape);
        if data.len() != expected {
            return Err(Error::invalid_argument(format!(
                "tensor data size {} does not match shape {:?} ({} bytes expected)",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Tensor { dtype, shape, data })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Leading dimension, treated as the batch dimension by the splitter.
    pub fn dim0(&self) -> Result<usize> {
        self.shape.first().copied().ok_or_else(|| {
            Error::invalid_argument("no batch dimension on a rank-0 tensor".to_string())
        })
    }

    /// Bytes of one leading-dimension row.
    pub fn row_bytes(&self) -> Result<usize> {
        let dim0 = self.dim0()?;
        if dim0 == 0 {
            return Err(Error::invalid_argument(
                "tensor has an empty batch dimension".to_string(),
            ));
        }
        Ok(self.data.len() / dim0)
    }

    /// Borrow the bytes of rows `[start, limit)` along the leading dimension.
    pub fn rows(&self, start: usize, limit: usize) -> Result<&[u8]> {
        let row = self.row_bytes()?;
        let dim0 = self.dim0()?;
        if start > limit || limit > dim0 {
            return Err(Error::out_of_range(format!(
                "row range [{start}, {limit}) out of bounds for batch dimension {dim0}"
            )));
        }
        Ok(&self.data[start * row..limit * row])
    }

    /// Copy `source` over the full tensor, or the first `memcpy_size` bytes
    /// when given. Sizes are validated the way the stitcher relies on: a full
    /// copy must match exactly, a bounded copy must fit.
    pub fn copy_from(&mut self, source: &[u8], memcpy_size: Option<usize>) -> Result<()> {
        let size = match memcpy_size {
            None => {
                if source.len() != self.data.len() {
                    return Err(Error::out_of_range(format!(
                        "unexpected tensor size in copy, source size: {}, target size: {}",
                        source.len(),
                        self.data.len()
                    )));
                }
                source.len()
            }
            Some(size) => {
                if size > self.data.len() || size > source.len() {
                    return Err(Error::out_of_range(format!(
                        "copy size {} exceeds source {} or target {}",
                        size,
                        source.len(),
                        self.data.len()
                    )));
                }
                size
            }
        };
        self.data[..size].copy_from_slice(&source[..size]);
        Ok(())
    }

    /// Copy `source` into rows starting at `row_start`; used when stitching
    /// micro-batch outputs into the caller's batched output tensor.
    pub fn copy_rows_from(&mut self, row_start: usize, source: &[u8]) -> Result<()> {
        let row = self.row_bytes()?;
        let offset = row_start * row;
        if offset + source.len() > self.data.len() {
            return Err(Error::out_of_range(format!(
                "copy of {} bytes at row {row_start} exceeds tensor of {} bytes",
                source.len(),
                self.data.len()
            )));
        }
        self.data[offset..offset + source.len()].copy_from_slice(source);
        Ok(())
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Total byte size of a dense tensor of `shape`.
pub fn byte_len(dtype: DType, shape: &[usize]) -> usize {
    shape.iter().product::<usize>() * dtype.size_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_2x4() -> Tensor {
        Tensor::from_bytes(
            DType::U8,
            vec![2, 4],
            vec![0, 1, 2, 3, 10, 11, 12, 13],
        )
        .unwrap()
    }

    #[test]
    fn byte_len_follows_shape_and_dtype() {
        assert_eq!(byte_len(DType::F32, &[2, 3]), 24);
        assert_eq!(byte_len(DType::F16, &[4]), 8);
        assert_eq!(byte_len(DType::I8, &[]), 1);
    }

    #[test]
    fn row_slicing() {
        let t = tensor_2x4();
        assert_eq!(t.row_bytes().unwrap(), 4);
        assert_eq!(t.rows(0, 1).unwrap(), &[0, 1, 2, 3]);
        assert_eq!(t.rows(1, 2).unwrap(), &[10, 11, 12, 13]);
        assert!(t.rows(1, 3).is_err());
    }

    #[test]
    fn copy_from_validates_sizes() {
        let mut t = Tensor::zeroed(DType::U8, vec![4]);
        assert!(t.copy_from(&[1, 2, 3], None).is_err());
        t.copy_from(&[1, 2, 3], Some(3)).unwrap();
        assert_eq!(t.data(), &[1, 2, 3, 0]);
        assert!(t.copy_from(&[0; 8], Some(8)).is_err());
    }

    #[test]
    fn copy_rows_stitches_in_place() {
        let mut t = Tensor::zeroed(DType::U8, vec![3, 2]);
        t.copy_rows_from(1, &[7, 8, 9, 10]).unwrap();
        assert_eq!(t.data(), &[0, 0, 7, 8, 9, 10]);
        assert!(t.copy_rows_from(2, &[0; 4]).is_err());
    }

    #[test]
    fn from_bytes_rejects_mismatched_sizes() {
        assert!(Tensor::from_bytes(DType::F32, vec![2], vec![0; 7]).is_err());
    }
}
