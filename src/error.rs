// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{jpeg::Context, source::IoMethod};
use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while negotiating with a capture source, managing its
/// buffers, or delivering images to a sink.
///
/// Everything in here is fatal to a capture run. Conditions the capture loop
/// survives (a source that is not ready yet, a frame without an EOI marker, a
/// corrupt frame, a sink that refuses an image) are counted in the run report
/// instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Opening or configuring the device failed.
    #[error("{device}: {op}: {source}")]
    Device {
        device: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0} is not a video capture device")]
    NotCapture(String),

    #[error("{0} does not support streaming i/o")]
    NoStreaming(String),

    /// The source substituted a pixel format other than the one requested.
    #[error("source did not accept {requested} format (got {actual})")]
    FormatRejected { requested: String, actual: String },

    #[error("insufficient buffer memory: requested {requested}, granted {granted}")]
    InsufficientBuffers { requested: u32, granted: u32 },

    #[error("mapping buffer {index} failed: {source}")]
    AllocationFailed {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("{0} i/o is not supported")]
    Unsupported(IoMethod),

    /// A readiness, dequeue or enqueue operation failed for a reason other
    /// than "not ready yet".
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The buffer ownership protocol was violated.
    #[error("buffer protocol violation: {0}")]
    Protocol(String),

    /// The command source description could not be read or parsed.
    #[error("invalid command: {0}")]
    Command(String),

    /// The output could not be opened.
    #[error("output unavailable: {source}")]
    Output {
        #[source]
        source: io::Error,
    },

    #[error("bad marker at offset {offset} {context}")]
    Malformed { offset: usize, context: Context },
}

impl Error {
    pub(crate) fn device(device: &str, op: &'static str, source: impl Into<io::Error>) -> Self {
        Error::Device {
            device: device.to_string(),
            op,
            source: source.into(),
        }
    }

    pub(crate) fn io(op: &'static str, source: impl Into<io::Error>) -> Self {
        Error::Io {
            op,
            source: source.into(),
        }
    }

    /// Process exit status for this error: 2 for device setup, 3 for buffer
    /// allocation, 4 for capture, 5 for output.
    pub fn exit_status(&self) -> u8 {
        match self {
            Error::Device { .. }
            | Error::NotCapture(_)
            | Error::NoStreaming(_)
            | Error::FormatRejected { .. }
            | Error::Command(_) => 2,
            Error::InsufficientBuffers { .. }
            | Error::AllocationFailed { .. }
            | Error::Unsupported(_) => 3,
            Error::Io { .. } | Error::Protocol(_) | Error::Malformed { .. } => 4,
            Error::Output { .. } => 5,
        }
    }
}
