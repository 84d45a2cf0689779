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

//! Two-part framing for the driver connection.
//!
//! Each frame is a json header (request or response envelope) plus an opaque
//! payload (artifact chunks, inline tensor bytes). Layout:
//!
//! ```text
//! u32 header_len | u32 payload_len | u64 xxh3(header ++ payload) | header | payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use xxhash_rust::xxh3::xxh3_64;

const PREAMBLE_LEN: usize = 4 + 4 + 8;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the maximum of {1} bytes")]
    FrameTooLarge(usize, usize),

    #[error("frame checksum mismatch")]
    ChecksumMismatch,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Bytes,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Bytes, payload: Bytes) -> Frame {
        Frame { header, payload }
    }

    pub fn header_only(header: Bytes) -> Frame {
        Frame {
            header,
            payload: Bytes::new(),
        }
    }
}

/// Frame codec with an optional size ceiling. The ceiling covers the whole
/// frame including the preamble.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    max_frame_size: Option<usize>,
}

impl FrameCodec {
    pub fn new(max_frame_size: Option<usize>) -> FrameCodec {
        FrameCodec { max_frame_size }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total = PREAMBLE_LEN + item.header.len() + item.payload.len();
        if let Some(max) = self.max_frame_size {
            if total > max {
                return Err(CodecError::FrameTooLarge(total, max));
            }
        }

        let mut hashed = BytesMut::with_capacity(item.header.len() + item.payload.len());
        hashed.extend_from_slice(&item.header);
        hashed.extend_from_slice(&item.payload);
        let checksum = xxh3_64(&hashed);

        dst.reserve(total);
        dst.put_u32(item.header.len() as u32);
        dst.put_u32(item.payload.len() as u32);
        dst.put_u64(checksum);
        dst.put_slice(&item.header);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PREAMBLE_LEN {
            return Ok(None);
        }

        let mut cursor = &src[..];
        let header_len = cursor.get_u32() as usize;
        let payload_len = cursor.get_u32() as usize;
        let checksum = cursor.get_u64();

        let total = PREAMBLE_LEN + header_len + payload_len;
        if let Some(max) = self.max_frame_size {
            if total > max {
                return Err(CodecError::FrameTooLarge(total, max));
            }
        }
        if src.len() < total {
            return Ok(None);
        }

        src.advance(PREAMBLE_LEN);
        let computed = xxh3_64(&src[..header_len + payload_len]);
        if checksum != computed {
            return Err(CodecError::ChecksumMismatch);
        }

        let header = src.split_to(header_len).freeze();
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(codec: &mut FrameCodec, frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn header_and_payload_round_trip() {
        let mut codec = FrameCodec::default();
        let frame = round_trip(
            &mut codec,
            Frame::new(Bytes::from_static(b"header"), Bytes::from_static(b"payload")),
        );
        assert_eq!(frame.header, Bytes::from_static(b"header"));
        assert_eq!(frame.payload, Bytes::from_static(b"payload"));
    }

    #[test]
    fn empty_payload_round_trip() {
        let mut codec = FrameCodec::default();
        let frame = round_trip(&mut codec, Frame::header_only(Bytes::from_static(b"h")));
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::new(Bytes::from_static(b"header"), Bytes::from_static(b"payload")),
                &mut buf,
            )
            .unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn corruption_is_detected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::new(Bytes::from_static(b"header"), Bytes::from_static(b"payload")),
                &mut buf,
            )
            .unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::ChecksumMismatch)
        ));
    }

    #[test]
    fn oversized_frames_are_rejected_on_both_sides() {
        let mut small = FrameCodec::new(Some(32));
        let frame = Frame::new(Bytes::from(vec![0u8; 16]), Bytes::from(vec![0u8; 16]));
        let mut buf = BytesMut::new();
        assert!(matches!(
            small.encode(frame.clone(), &mut buf),
            Err(CodecError::FrameTooLarge(_, _))
        ));

        let mut unbounded = FrameCodec::default();
        unbounded.encode(frame, &mut buf).unwrap();
        assert!(matches!(
            small.decode(&mut buf),
            Err(CodecError::FrameTooLarge(_, _))
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::header_only(Bytes::from_static(b"one")), &mut buf)
            .unwrap();
        codec
            .encode(Frame::header_only(Bytes::from_static(b"two")), &mut buf)
            .unwrap();
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().header,
            Bytes::from_static(b"one")
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().header,
            Bytes::from_static(b"two")
        );
    }
}
