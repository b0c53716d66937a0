// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! The capture loop.
//!
//! A [`Session`] waits for the source, takes one filled buffer, frames the
//! JPEG image inside it, writes the image to the sink and gives the buffer
//! back, until its quota of frames is used up. Everything runs on the
//! calling thread and at most one buffer is held by the application at a
//! time, so images reach the sink in the order the source filled them.

use crate::{
    error::Result,
    jpeg::{self, Image, Scan},
    pool::{Acquire, Acquired, BufferPool},
    sink::Sink,
    source::{self, CaptureSource, FormatRequest, IoMethod, Wait},
    splitter::Splitter,
};
use serde_json::json;
use std::{
    io::{self, BufRead},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, debug_span, info, info_span, trace};

/// Bytes shown at each end of a malformed buffer.
const DUMP_LEN: usize = 32;

/// Shared flag asking a running loop to stop.
///
/// Clones share the flag, so one can be moved into a signal handler while
/// the loop checks another.
///
/// The loop checks the flag before every wait, not during one. The handler
/// may run on another thread, in which case the blocked wait is not woken.
/// The request then takes effect at the next wakeup: the next frame, or the
/// source's own wait timeout (200 ms for V4L2 devices).
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters for one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Buffers (or stream images) passed to extraction. Equals the quota
    /// unless the run was cancelled or the stream ended.
    pub attempts: u64,
    pub complete: u64,
    pub recovered: u64,
    pub malformed: u64,
    pub short_writes: u64,
    /// Images the sink refused. They still count against the quota.
    pub failed_writes: u64,
    pub bytes_written: u64,
    /// Wakeups that found nothing to dequeue.
    pub retries: u64,
    pub cancelled: bool,
}

impl RunReport {
    /// Images handed to the sink.
    pub fn images(&self) -> u64 {
        self.complete + self.recovered
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "attempts": self.attempts,
            "complete": self.complete,
            "recovered": self.recovered,
            "malformed": self.malformed,
            "short_writes": self.short_writes,
            "failed_writes": self.failed_writes,
            "bytes_written": self.bytes_written,
            "retries": self.retries,
            "cancelled": self.cancelled,
        })
    }
}

/// Where and how to capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device: String,
    pub format: FormatRequest,
    pub buffers: u32,
    pub io_method: IoMethod,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            format: FormatRequest::default(),
            buffers: 4,
            io_method: IoMethod::Mmap,
        }
    }
}

/// Open the configured device, negotiate MJPEG and start streaming into a
/// new buffer pool.
pub fn open(config: &CaptureConfig) -> Result<BufferPool<Box<dyn CaptureSource>>> {
    let mut source = source::open(&config.device)?;
    source::negotiate(&mut source, &config.format)?;
    BufferPool::initialize(source, config.io_method, config.buffers)
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Frame the image in `data` and write it, updating `report`.
fn extract<W: Sink + ?Sized>(data: &[u8], sink: &mut W, report: &mut RunReport) {
    let outcome = jpeg::scan(data);
    match outcome {
        Scan::Complete(end) => {
            report.complete += 1;
            if end < data.len() {
                debug!("frame ends early at {} of {} bytes", end, data.len());
            }
        }
        Scan::Recovered(len) => {
            report.recovered += 1;
            debug!("no EOI marker in {} bytes, appending one", len);
        }
        Scan::Malformed { offset, context } => {
            report.malformed += 1;
            debug!(
                "dropping frame with bad marker at offset {} {}",
                offset, context
            );
            trace!("head {}", hex(&data[..data.len().min(DUMP_LEN)]));
            trace!("tail {}", hex(&data[data.len().saturating_sub(DUMP_LEN)..]));
        }
    }

    if let Some(image) = outcome.image(data) {
        write(sink, &image, report);
    }
}

/// One write attempt. Short and failed writes are counted, not retried, and
/// never end the run.
fn write<W: Sink + ?Sized>(sink: &mut W, image: &Image, report: &mut RunReport) {
    let written = match sink.write_image(image) {
        Ok(written) => written,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
        Err(err) => {
            report.failed_writes += 1;
            debug!("write of {} bytes failed: {}", image.len(), err);
            return;
        }
    };

    report.bytes_written += written as u64;
    if written < image.len() {
        report.short_writes += 1;
        debug!("short write: {} of {} bytes", written, image.len());
    } else {
        debug!("wrote {} bytes", written);
    }
}

fn frame_mark() {
    if let Some(client) = tracy_client::Client::running() {
        client.frame_mark();
    }
}

/// Capture loop over a buffer pool.
pub struct Session<S: CaptureSource, W: Sink> {
    pool: BufferPool<S>,
    sink: W,
    cancel: CancelToken,
}

impl<S: CaptureSource, W: Sink> Session<S, W> {
    pub fn new(pool: BufferPool<S>, sink: W, cancel: CancelToken) -> Self {
        Self { pool, sink, cancel }
    }

    /// Extract `quota` frames.
    ///
    /// Every buffer taken from the source counts against the quota, whether
    /// its image was complete, recovered or dropped as malformed. Returns
    /// early with `cancelled` set if the cancel token fires.
    ///
    /// # Errors
    ///
    /// Source failures other than "not ready" and buffer protocol
    /// violations end the run. Sink write failures are counted in
    /// `failed_writes` and the run goes on.
    pub fn run(&mut self, quota: u64) -> Result<RunReport> {
        let span = info_span!("capture", source = self.pool.source().name(), quota);
        let _guard = span.enter();

        let mut report = RunReport::default();
        while report.attempts < quota {
            if self.cancel.is_cancelled() {
                info!("cancelled after {} of {} frames", report.attempts, quota);
                report.cancelled = true;
                break;
            }

            if self.pool.wait_ready()? == Wait::Interrupted {
                debug!("wait interrupted");
                continue;
            }

            let acquired = match self.pool.acquire_ready()? {
                Acquire::Ready(acquired) => acquired,
                Acquire::Retry => {
                    report.retries += 1;
                    continue;
                }
            };

            self.extract(&acquired, &mut report);
            self.pool.release(acquired)?;
            report.attempts += 1;
            frame_mark();
        }

        info!(
            "{} frames: {} complete, {} recovered, {} malformed, {} bytes",
            report.attempts,
            report.complete,
            report.recovered,
            report.malformed,
            report.bytes_written
        );
        Ok(report)
    }

    fn extract(&mut self, acquired: &Acquired, report: &mut RunReport) {
        let span = debug_span!(
            "frame",
            index = acquired.index(),
            sequence = acquired.sequence(),
            len = acquired.len()
        );
        let _guard = span.enter();
        trace!("timestamp {:?}", acquired.timestamp());
        extract(self.pool.data(acquired), &mut self.sink, report)
    }

    pub fn pool(&self) -> &BufferPool<S> {
        &self.pool
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Stop streaming, release the buffers and hand back the sink.
    pub fn finish(self) -> Result<W> {
        let Session { mut pool, sink, .. } = self;
        pool.teardown()?;
        Ok(sink)
    }
}

/// Write images cut from a stream until `quota` images (all of them when
/// `None`) have been relayed or the stream ends.
pub fn relay<R: BufRead, W: Sink + ?Sized>(
    splitter: &mut Splitter<R>,
    sink: &mut W,
    quota: Option<u64>,
    cancel: &CancelToken,
) -> Result<RunReport> {
    let span = info_span!("relay", quota);
    let _guard = span.enter();

    let mut report = RunReport::default();
    while quota.map_or(true, |quota| report.attempts < quota) {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let Some(image) = splitter.next().transpose()? else {
            // a command stream ends once cancelled
            report.cancelled = cancel.is_cancelled();
            break;
        };
        let _frame = debug_span!("frame", image = report.attempts, len = image.len()).entered();
        report.attempts += 1;
        report.complete += 1;
        write(sink, &Image::from(image.as_slice()), &mut report);
        frame_mark();
    }

    info!(
        "{} images, {} bytes, {} stream bytes read",
        report.attempts,
        report.bytes_written,
        splitter.offset()
    );
    Ok(report)
}
