// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Synthetic capture source.
//!
//! Selected for `stub://` device paths. It behaves like a streaming MJPEG
//! camera backed by in-memory regions: buffers must be enqueued before they
//! are filled and are returned in queue order. Frames follow a script of
//! [`Event`]s (complete, truncated or corrupt frames, not-ready polls,
//! errors); once the script is exhausted it produces complete frames
//! forever.
//!
//! The generated frames are structurally valid JPEG codestreams with
//! pseudo-random entropy data (byte-stuffed, optionally with restart
//! markers). They are not meant to decode to a picture.

use crate::{
    error::{Error, Result},
    jpeg::{DRI, EOI, MARKER, RST0, SOI, SOS},
    source::{Capabilities, CaptureSource, Filled, Format, FormatRequest, FourCC, Wait},
};
use std::{collections::VecDeque, io};
use tracing::{debug, info};
use unix_ts::Timestamp;

const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Parameters of one generated frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSpec {
    pub seed: u32,
    /// Entropy-coded bytes before stuffing.
    pub entropy_len: usize,
    /// Emit a restart marker every this many entropy bytes, 0 for none.
    pub restart_interval: u16,
    pub width: u16,
    pub height: u16,
}

impl Default for FrameSpec {
    fn default() -> Self {
        Self {
            seed: 1,
            entropy_len: 256,
            restart_interval: 0,
            width: 320,
            height: 240,
        }
    }
}

struct XorShift(u32);

impl XorShift {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

fn segment(out: &mut Vec<u8>, code: u8, payload: &[u8]) {
    let length = (payload.len() + 2) as u16;
    out.extend_from_slice(&[MARKER, code]);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(payload);
}

/// Build one baseline JPEG codestream.
pub fn frame(spec: &FrameSpec) -> Vec<u8> {
    let mut rng = XorShift(spec.seed.wrapping_mul(0x9E37_79B9) | 1);
    let mut out = Vec::with_capacity(spec.entropy_len * 2 + 256);

    out.extend_from_slice(&[MARKER, SOI]);
    segment(
        &mut out,
        0xE0,
        &[b'J', b'F', b'I', b'F', 0, 1, 1, 0, 0, 1, 0, 1, 0, 0],
    );

    // quantization table, values may include 0xFF
    let mut dqt = vec![0u8];
    dqt.extend((0..64).map(|_| (rng.next() as u8).max(1)));
    segment(&mut out, 0xDB, &dqt);

    let [h_hi, h_lo] = spec.height.to_be_bytes();
    let [w_hi, w_lo] = spec.width.to_be_bytes();
    segment(
        &mut out,
        0xC0,
        &[8, h_hi, h_lo, w_hi, w_lo, 3, 1, 0x22, 0, 2, 0x11, 1, 3, 0x11, 1],
    );

    let mut dht = vec![0x00, 1];
    dht.extend_from_slice(&[0; 15]);
    dht.push(0);
    segment(&mut out, 0xC4, &dht);

    if spec.restart_interval > 0 {
        out.extend_from_slice(&[MARKER, DRI]);
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&spec.restart_interval.to_be_bytes());
    }

    segment(
        &mut out,
        SOS,
        &[3, 1, 0x00, 2, 0x11, 3, 0x11, 0, 0x3F, 0],
    );

    let mut restarts = 0u8;
    for i in 0..spec.entropy_len {
        if spec.restart_interval > 0 && i > 0 && i % spec.restart_interval as usize == 0 {
            out.extend_from_slice(&[MARKER, RST0 + restarts % 8]);
            restarts = restarts.wrapping_add(1);
        }
        let r = rng.next();
        let b = if r % 11 == 0 { MARKER } else { (r >> 8) as u8 };
        out.push(b);
        if b == MARKER {
            out.push(0x00);
        }
    }

    out.extend_from_slice(&[MARKER, EOI]);
    out
}

/// One step of a synthetic capture script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A complete frame.
    Frame(FrameSpec),
    /// A frame cut after this many bytes, with no EOI marker.
    Truncated(FrameSpec, usize),
    /// A complete frame with the byte at this offset replaced by 0x00.
    Corrupt(FrameSpec, usize),
    /// Exact buffer contents.
    Raw(Vec<u8>),
    /// A complete frame whose fill reports this many bytes more than the
    /// whole buffer, like a driver with a broken `bytesused`.
    Overreport(FrameSpec, usize),
    /// The dequeue finds nothing ready.
    NotReady,
    /// The wait is interrupted by a signal.
    Interrupt,
    /// The dequeue fails with this OS error.
    Fail(i32),
}

impl Event {
    fn contents(&self) -> Option<Vec<u8>> {
        match self {
            Event::Frame(spec) | Event::Overreport(spec, _) => Some(frame(spec)),
            Event::Truncated(spec, len) => {
                let mut buf = frame(spec);
                buf.truncate(*len);
                Some(buf)
            }
            Event::Corrupt(spec, offset) => {
                let mut buf = frame(spec);
                if let Some(b) = buf.get_mut(*offset) {
                    *b = 0x00;
                }
                Some(buf)
            }
            Event::Raw(buf) => Some(buf.clone()),
            Event::NotReady | Event::Interrupt | Event::Fail(_) => None,
        }
    }
}

/// Scripted in-memory capture source.
pub struct SyntheticSource {
    name: String,
    capacity: usize,
    max_buffers: u32,
    map_failure: Option<u32>,
    format_override: Option<FourCC>,
    format: Option<Format>,
    regions: Vec<Vec<u8>>,
    queued: VecDeque<u32>,
    streaming: bool,
    script: VecDeque<Event>,
    sequence: u32,
}

impl SyntheticSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capacity: DEFAULT_CAPACITY,
            max_buffers: 32,
            map_failure: None,
            format_override: None,
            format: None,
            regions: Vec::new(),
            queued: VecDeque::new(),
            streaming: false,
            script: VecDeque::new(),
            sequence: 0,
        }
    }

    /// Size of each buffer. Frames larger than this are cut short, like a
    /// driver truncating an oversized frame.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Grant at most `max` buffers.
    pub fn with_max_buffers(mut self, max: u32) -> Self {
        self.max_buffers = max;
        self
    }

    /// Fail to map buffer `index`.
    pub fn with_map_failure(mut self, index: u32) -> Self {
        self.map_failure = Some(index);
        self
    }

    /// Report `fourcc` whatever format is requested.
    pub fn with_format_override(mut self, fourcc: FourCC) -> Self {
        self.format_override = Some(fourcc);
        self
    }

    pub fn with_script(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        self.script.extend(events);
        self
    }

    /// Indices currently held by the source, in fill order.
    pub fn queued(&self) -> Vec<u32> {
        self.queued.iter().copied().collect()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn mapped(&self) -> usize {
        self.regions.len()
    }

    fn next_event(&mut self) -> Event {
        self.script.pop_front().unwrap_or_else(|| {
            Event::Frame(FrameSpec {
                seed: self.sequence,
                entropy_len: 256 + (self.sequence as usize % 8) * 32,
                ..Default::default()
            })
        })
    }
}

fn os_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

impl CaptureSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&mut self) -> Result<Capabilities> {
        Ok(Capabilities {
            driver: "synthetic".to_string(),
            card: "Synthetic MJPEG".to_string(),
            bus_info: "platform:synthetic".to_string(),
            capture: true,
            streaming: true,
            read_write: false,
        })
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<Format> {
        let format = Format {
            width: request.width,
            height: request.height,
            fourcc: self.format_override.unwrap_or(request.fourcc),
            size_image: self.capacity as u32,
        };
        self.format = Some(format);
        Ok(format)
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let granted = count.min(self.max_buffers);
        if let Some(index) = self.map_failure.filter(|&index| index < granted) {
            self.regions.clear();
            return Err(Error::AllocationFailed {
                index,
                source: os_error(libc::ENOMEM),
            });
        }
        self.regions = (0..granted).map(|_| vec![0u8; self.capacity]).collect();
        debug!("{}: mapped {} buffers of {} bytes", self.name, granted, self.capacity);
        Ok(granted)
    }

    fn region(&self, index: u32) -> Option<&[u8]> {
        self.regions.get(index as usize).map(Vec::as_slice)
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        if index as usize >= self.regions.len() || self.queued.contains(&index) {
            return Err(Error::io("VIDIOC_QBUF", os_error(libc::EINVAL)));
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<Filled>> {
        if !self.streaming {
            return Err(Error::io("VIDIOC_DQBUF", os_error(libc::EINVAL)));
        }

        let event = self.next_event();
        let contents = match event.contents() {
            Some(contents) => contents,
            None => {
                return match event {
                    Event::Fail(errno) => Err(Error::io("VIDIOC_DQBUF", os_error(errno))),
                    _ => Ok(None),
                }
            }
        };

        let Some(index) = self.queued.pop_front() else {
            return Err(Error::io("VIDIOC_DQBUF", os_error(libc::EINVAL)));
        };
        let region = &mut self.regions[index as usize];
        let copied = contents.len().min(region.len());
        region[..copied].copy_from_slice(&contents[..copied]);
        let bytes_used = match event {
            Event::Overreport(_, extra) => region.len() + extra,
            _ => copied,
        };

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(Filled {
            index,
            bytes_used,
            sequence,
            timestamp: Timestamp::new(sequence as i64 / 30, (sequence % 30) * 33_333_333),
        }))
    }

    fn wait_ready(&mut self) -> Result<Wait> {
        if matches!(self.script.front(), Some(Event::Interrupt)) {
            self.script.pop_front();
            return Ok(Wait::Interrupted);
        }
        Ok(Wait::Ready)
    }

    fn start(&mut self) -> Result<()> {
        self.streaming = true;
        info!("{}: stream on", self.name);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.streaming = false;
        self.queued.clear();
        info!("{}: stream off", self.name);
        Ok(())
    }

    fn release_buffers(&mut self) -> Result<()> {
        self.regions.clear();
        self.queued.clear();
        Ok(())
    }
}
