// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error taxonomy shared by every stage of the acquisition pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::session::SessionStatus;

/// Errors raised while acquiring, buffering, or controlling a session.
///
/// None of these are fatal to the process. Device errors resolve to a
/// `Stopped` or `Error` session that the caller can restart.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AcquisitionError {
    /// No usable SDR at open time (missing, busy, or not permitted).
    #[error("SDR device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The SDR went away while a session was running.
    #[error("SDR device disconnected: {0}")]
    DeviceDisconnected(String),

    /// Operation not allowed in the current session state.
    #[error("cannot {action} while session is {status}")]
    InvalidStateTransition {
        status: SessionStatus,
        action: &'static str,
    },

    /// The buffer was full and its oldest block was discarded to make room.
    #[error("sample buffer overflow ({dropped} blocks dropped so far)")]
    BufferOverflow { dropped: u64 },

    /// A block did not advance the stream clock.
    #[error("out-of-order block: {received:?} does not follow {previous:?}")]
    OutOfOrder { previous: Duration, received: Duration },

    /// The buffer no longer accepts blocks.
    #[error("sample buffer closed")]
    BufferClosed,

    /// No block arrived within the read timeout.
    #[error("timed out waiting for samples")]
    Timeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AcquisitionError {
    /// Whether the error ends an acquisition loop.
    #[must_use]
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Self::DeviceDisconnected(_) | Self::BufferClosed)
    }
}
