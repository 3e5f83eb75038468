// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure taxonomy shared by the bus, lock manager, and round runner.
///
/// None of these ever reach a bus subscriber: they are absorbed (logged and
/// dropped) on the producing side or surfaced to the local caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Native multicast is missing; the agent falls back for its lifetime.
    TransportUnavailable,
    /// A message payload could not be encoded or decoded.
    SerializationFailure,
    /// The named lock is held elsewhere. A control-flow signal, not a fault.
    LockUnavailable,
    /// The leader's task body failed; nothing was broadcast.
    OperationFailure,
    /// A store or lock directory could not be read or written.
    Storage,
    /// A key or lock name contains characters outside `[A-Za-z0-9._-]`.
    InvalidName,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportUnavailable => "TRANSPORT_UNAVAILABLE",
            Self::SerializationFailure => "SERIALIZATION_FAILURE",
            Self::LockUnavailable => "LOCK_UNAVAILABLE",
            Self::OperationFailure => "OPERATION_FAILURE",
            Self::Storage => "STORAGE",
            Self::InvalidName => "INVALID_NAME",
        }
    }

    /// Whether this kind is an expected signal rather than a failure.
    pub fn is_signal(&self) -> bool {
        matches!(self, Self::LockUnavailable | Self::TransportUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorKind {}

/// Return the [`ErrorKind`] attached to an `anyhow` error, either as its root
/// cause or as context added along the way.
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<ErrorKind>()
        .copied()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<ErrorKind>().copied()))
}

/// Check that `name` is usable as a store key or lock file name.
pub fn validate_name(name: &str) -> anyhow::Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(anyhow::Error::new(ErrorKind::InvalidName).context(format!("invalid name: {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
