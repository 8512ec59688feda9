// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by the fastpath scheduler.
///
/// Queue-level errors (`Busy`, `Again`, `NotFound`) are expected during
/// normal streaming and never tear a context down. State-machine and
/// hardware errors are returned synchronously to the client that issued the
/// command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FastpathError {
    /// No free slot or descriptor is available, retry later.
    #[error("resource busy")]
    Busy,
    /// Nothing is available yet (empty done list, nothing to apply).
    #[error("try again")]
    Again,
    /// The requested state transition is not allowed.
    #[error("operation not permitted in the current state")]
    PermissionDenied,
    /// Malformed packet, patch map, handle or command payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A completion named a request id that is not in flight.
    #[error("request {0} not found")]
    NotFound(u64),
    /// The hardware back end reported an error.
    #[error("hardware failure: {0}")]
    HardwareFailure(String),
    /// A bounded wait expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, FastpathError>;

impl FastpathError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        FastpathError::InvalidArgument(msg.into())
    }

    pub fn hardware(msg: impl Into<String>) -> Self {
        FastpathError::HardwareFailure(msg.into())
    }

    /// Busy and Again may be retried without any client-side cleanup.
    pub fn is_retriable(&self) -> bool {
        matches!(self, FastpathError::Busy | FastpathError::Again)
    }

    /// Negative errno reported across the client command boundary.
    pub fn errno(&self) -> i32 {
        -match self {
            FastpathError::Busy => libc::EBUSY,
            FastpathError::Again => libc::EAGAIN,
            FastpathError::PermissionDenied => libc::EPERM,
            FastpathError::InvalidArgument(_) => libc::EINVAL,
            FastpathError::NotFound(_) => libc::ENOENT,
            FastpathError::HardwareFailure(_) => libc::EFAULT,
            FastpathError::Timeout(_) => libc::ETIMEDOUT,
        }
    }
}

impl From<std::io::Error> for FastpathError {
    fn from(err: std::io::Error) -> Self {
        FastpathError::HardwareFailure(err.to_string())
    }
}
