//! Screen-stream frame pairing contract.
//!
//! An agent ships each frame as two consecutive WebSocket frames:
//!
//! 1. a JSON text frame `{type:"stream_frame", sessionId, sequence,
//!    timestamp, numRects, frameSize}`
//! 2. a single binary frame of exactly `frameSize` bytes.
//!
//! The broker re-emits the pair to the viewer (the header relabeled
//! `type:"frame"`). A header without its binary follower, or a binary frame
//! whose length disagrees with the announced size, is a protocol violation
//! and tears the stream session down.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on a single frame payload. Anything larger is rejected
/// before the binary frame is read.
pub const MAX_FRAME_SIZE: u32 = 32 * 1024 * 1024;

/// JSON header announcing one binary frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameHeader {
    pub session_id: Uuid,
    pub sequence: u64,
    pub timestamp: u64,
    pub num_rects: u32,
    pub frame_size: u32,
}

impl FrameHeader {
    /// Validate the header itself, before any payload arrives.
    pub fn validate(&self) -> Result<(), FramePairError> {
        if self.frame_size > MAX_FRAME_SIZE {
            return Err(FramePairError::Oversized {
                frame_size: self.frame_size,
            });
        }
        Ok(())
    }

    /// Check that a binary payload matches the announced size.
    pub fn check_payload(&self, payload_len: usize) -> Result<(), FramePairError> {
        if payload_len != self.frame_size as usize {
            return Err(FramePairError::SizeMismatch {
                expected: self.frame_size,
                actual: payload_len,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramePairError {
    #[error("binary payload is {actual} bytes, header announced {expected}")]
    SizeMismatch { expected: u32, actual: usize },
    #[error("binary frame arrived without a preceding header")]
    MissingHeader,
    #[error("frame header was not followed by its binary payload")]
    DanglingHeader,
    #[error("announced frame size {frame_size} exceeds limit {MAX_FRAME_SIZE}")]
    Oversized { frame_size: u32 },
}
