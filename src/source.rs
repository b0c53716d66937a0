// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capture source interface.
//!
//! A capture source owns a set of memory regions it fills with MJPEG data and
//! hands to the application one at a time. [`CaptureSource`] exposes the raw
//! primitives (map, queue, dequeue, wait); the ownership bookkeeping on top
//! of them lives in [`crate::pool`].

use crate::{
    error::{Error, Result},
    synthetic::SyntheticSource,
    v4l2::V4l2Device,
};
use std::fmt;
use tracing::{info, warn};
use unix_ts::Timestamp;

/// Four character code identifying a pixel format.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

/// Motion-JPEG codestream format.
pub const MJPG: FourCC = FourCC(*b"MJPG");

/// YUYV 4:2:2, the usual substitute when a driver refuses MJPEG.
pub const YUYV: FourCC = FourCC(*b"YUYV");

impl From<u32> for FourCC {
    fn from(value: u32) -> Self {
        FourCC(value.to_le_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(value: FourCC) -> Self {
        u32::from_le_bytes(value.0)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

/// How buffer memory is shared with the source.
///
/// Only memory-mapped buffers are implemented; the other strategies are
/// rejected when the pool is initialized.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IoMethod {
    /// Source-allocated regions mapped into the process.
    #[default]
    Mmap,
    /// One application buffer filled by `read(2)`.
    Read,
    /// Application-allocated regions handed to the source.
    #[value(name = "userptr")]
    UserPtr,
}

impl fmt::Display for IoMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IoMethod::Mmap => write!(f, "mmap"),
            IoMethod::Read => write!(f, "read"),
            IoMethod::UserPtr => write!(f, "userptr"),
        }
    }
}

/// What the source reports about itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capture: bool,
    pub streaming: bool,
    pub read_write: bool,
}

/// Requested capture format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    /// Frames per second, 0 leaves the source default.
    pub fps: u32,
}

impl Default for FormatRequest {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fourcc: MJPG,
            fps: 30,
        }
    }
}

/// Format the source actually configured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Format {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    /// Upper bound of one compressed frame, in bytes.
    pub size_image: u32,
}

/// A buffer the source has finished filling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Filled {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u32,
    pub timestamp: Timestamp,
}

/// Result of waiting for the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// A buffer is ready, or the source has an error to report on dequeue.
    Ready,
    /// The wait ended without a buffer, because of a signal or because the
    /// source gave up waiting. The caller checks for cancellation and waits
    /// again.
    Interrupted,
}

/// Primitive operations of a streaming capture source.
///
/// Buffers are identified by index. A source only fills buffers that were
/// enqueued and only returns buffers from [`CaptureSource::dequeue`] that it
/// finished filling, in order.
pub trait CaptureSource {
    /// Device path or other identifier, for logging.
    fn name(&self) -> &str;

    fn capabilities(&mut self) -> Result<Capabilities>;

    /// Ask for `request`; the source may adjust it and returns what it set.
    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<Format>;

    /// Allocate and map up to `count` buffers, returning how many were
    /// granted.
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// The full mapped region of buffer `index`.
    fn region(&self, index: u32) -> Option<&[u8]>;

    /// Hand buffer `index` to the source for filling.
    fn enqueue(&mut self, index: u32) -> Result<()>;

    /// Take the next filled buffer, `None` when nothing is ready yet.
    fn dequeue(&mut self) -> Result<Option<Filled>>;

    /// Block until a buffer is ready. A source may give up after a timeout
    /// of its own and report [`Wait::Interrupted`].
    fn wait_ready(&mut self) -> Result<Wait>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Unmap and free every buffer.
    fn release_buffers(&mut self) -> Result<()>;
}

impl<S: CaptureSource + ?Sized> CaptureSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn capabilities(&mut self) -> Result<Capabilities> {
        (**self).capabilities()
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<Format> {
        (**self).negotiate_format(request)
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        (**self).request_buffers(count)
    }

    fn region(&self, index: u32) -> Option<&[u8]> {
        (**self).region(index)
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        (**self).enqueue(index)
    }

    fn dequeue(&mut self) -> Result<Option<Filled>> {
        (**self).dequeue()
    }

    fn wait_ready(&mut self) -> Result<Wait> {
        (**self).wait_ready()
    }

    fn start(&mut self) -> Result<()> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }

    fn release_buffers(&mut self) -> Result<()> {
        (**self).release_buffers()
    }
}

/// Open the source named by `device`.
///
/// `stub://` paths select the synthetic source, anything else is opened as a
/// V4L2 device node.
pub fn open(device: &str) -> Result<Box<dyn CaptureSource>> {
    if device.starts_with("stub://") {
        Ok(Box::new(SyntheticSource::new(device)))
    } else {
        Ok(Box::new(V4l2Device::open(device)?))
    }
}

/// Check that `source` can stream and configure it for `request`.
///
/// Fails if the source is not a streaming capture device or if it
/// substitutes a pixel format other than the one requested. A different
/// resolution is accepted with a warning.
pub fn negotiate<S: CaptureSource + ?Sized>(
    source: &mut S,
    request: &FormatRequest,
) -> Result<Format> {
    let caps = source.capabilities()?;
    if !caps.capture {
        return Err(Error::NotCapture(source.name().to_string()));
    }
    if !caps.streaming {
        return Err(Error::NoStreaming(source.name().to_string()));
    }

    let format = source.negotiate_format(request)?;
    if format.fourcc != request.fourcc {
        return Err(Error::FormatRejected {
            requested: request.fourcc.to_string(),
            actual: format.fourcc.to_string(),
        });
    }

    if format.width != request.width || format.height != request.height {
        warn!(
            "requested {}x{} resolution but {} set {}x{}",
            request.width,
            request.height,
            source.name(),
            format.width,
            format.height
        );
    }

    info!(
        "{} ({} {}) streaming {} {}x{} max {} bytes",
        source.name(),
        caps.card,
        caps.driver,
        format.fourcc,
        format.width,
        format.height,
        format.size_image
    );
    Ok(format)
}
