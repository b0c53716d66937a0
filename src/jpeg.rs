// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! JPEG marker-segment framing.
//!
//! MJPEG capture buffers start with a start-of-image marker but their end is
//! not trustworthy: drivers hand over buffers that are padded, truncated
//! mid-scan, or occasionally corrupt. [`scan`] walks the marker segments of a
//! buffer and reports exactly where the image ends, whether the
//! end-of-image marker had to be synthesized, or where the structure broke.
//!
//! The walk never reads outside the slice it is given. Every length field is
//! checked against the remaining input and a segment that runs past the end
//! is treated as truncation.

use std::{fmt, io::IoSlice};

/// Marker prefix byte.
pub const MARKER: u8 = 0xFF;
/// Start of image.
pub const SOI: u8 = 0xD8;
/// End of image.
pub const EOI: u8 = 0xD9;
/// Start of scan.
pub const SOS: u8 = 0xDA;
/// Define restart interval.
pub const DRI: u8 = 0xDD;
/// First restart marker code.
pub const RST0: u8 = 0xD0;
/// Last restart marker code.
pub const RST7: u8 = 0xD7;

/// The two bytes written after a recovered image.
pub const EOI_MARKER: [u8; 2] = [MARKER, EOI];

/// Size of the define-restart-interval segment including its marker.
const DRI_SEGMENT: usize = 6;

/// Outcome of framing one capture buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scan {
    /// `[0, end)` is a complete image ending with a genuine EOI marker.
    Complete(usize),
    /// The input ran out before an EOI marker. The image is the whole input
    /// of the given length followed by a synthesized EOI.
    Recovered(usize),
    /// A marker prefix was expected at `offset` but another byte was found.
    Malformed { offset: usize, context: Context },
}

impl Scan {
    /// The image this outcome describes, as a view into `buf`.
    ///
    /// `buf` must be the slice that was scanned.
    pub fn image<'a>(&self, buf: &'a [u8]) -> Option<Image<'a>> {
        match *self {
            Scan::Complete(end) => Some(Image {
                body: &buf[..end],
                recovered: false,
            }),
            Scan::Recovered(len) => Some(Image {
                body: &buf[..len],
                recovered: true,
            }),
            Scan::Malformed { .. } => None,
        }
    }
}

/// Five bytes around a malformed offset, `offset - 2 ..= offset + 2`.
/// Positions outside the buffer are `None`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Context([Option<u8>; 5]);

impl Context {
    pub fn around(buf: &[u8], offset: usize) -> Self {
        let mut bytes = [None; 5];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (offset + i)
                .checked_sub(2)
                .and_then(|pos| buf.get(pos))
                .copied();
        }
        Context(bytes)
    }

    pub fn bytes(&self) -> [Option<u8>; 5] {
        self.0
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match (i, byte) {
                (2, Some(b)) => write!(f, "_{b:02x}_")?,
                (2, None) => write!(f, "_--_")?,
                (_, Some(b)) => write!(f, "{b:02x}")?,
                (_, None) => write!(f, "--")?,
            }
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One JPEG codestream borrowed from a capture buffer.
///
/// A recovered image has no EOI marker in the buffer; it is carried as a
/// trailer so the shared buffer is never written to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Image<'a> {
    body: &'a [u8],
    recovered: bool,
}

impl<'a> Image<'a> {
    /// Bytes taken from the capture buffer.
    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// Bytes to append after the body: the synthesized EOI for recovered
    /// images, nothing otherwise.
    pub fn trailer(&self) -> &'static [u8] {
        if self.recovered {
            &EOI_MARKER
        } else {
            &[]
        }
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    pub fn len(&self) -> usize {
        self.body.len() + self.trailer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn io_slices(&self) -> [IoSlice<'a>; 2] {
        [IoSlice::new(self.body), IoSlice::new(self.trailer())]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(self.body);
        out.extend_from_slice(self.trailer());
        out
    }
}

/// A complete image held elsewhere, such as one cut from a stream.
impl<'a> From<&'a [u8]> for Image<'a> {
    fn from(body: &'a [u8]) -> Self {
        Image {
            body,
            recovered: false,
        }
    }
}

/// Big-endian segment length following the marker at `pos`, if present.
fn segment_length(buf: &[u8], pos: usize) -> Option<usize> {
    let hi = *buf.get(pos + 2)?;
    let lo = *buf.get(pos + 3)?;
    Some(u16::from_be_bytes([hi, lo]) as usize)
}

/// Offset just past the EOI terminating the entropy-coded data that starts
/// at `start`.
///
/// Stuffed `FF 00` pairs and restart markers inside the scan never match;
/// only an exact `FF D9` pair ends it.
pub fn entropy_end(buf: &[u8], start: usize) -> Option<usize> {
    let data = buf.get(start..)?;
    let mut was_ff = false;
    for (i, &b) in data.iter().enumerate() {
        if was_ff && b == EOI {
            return Some(start + i + 1);
        }
        was_ff = b == MARKER;
    }
    None
}

fn malformed(buf: &[u8], offset: usize) -> Scan {
    Scan::Malformed {
        offset,
        context: Context::around(buf, offset),
    }
}

/// Frame the image at the start of `buf`.
///
/// `buf` is expected to begin with an SOI marker; anything else is reported
/// as malformed at offset 0.
pub fn scan(buf: &[u8]) -> Scan {
    if !buf.starts_with(&[MARKER, SOI]) {
        return malformed(buf, 0);
    }

    let mut pos = 0;
    while pos < buf.len() {
        if buf[pos] != MARKER {
            return malformed(buf, pos);
        }
        let Some(&code) = buf.get(pos + 1) else {
            break;
        };
        match code {
            SOI | RST0..=RST7 => pos += 2,
            EOI => return Scan::Complete(pos + 2),
            // fill byte ahead of the real marker
            MARKER => pos += 1,
            DRI => pos += DRI_SEGMENT,
            _ => {
                let Some(length) = segment_length(buf, pos) else {
                    break;
                };
                if length < 2 {
                    return malformed(buf, pos);
                }
                pos += 2 + length;
                if code == SOS {
                    return match entropy_end(buf, pos) {
                        Some(end) => Scan::Complete(end),
                        None => Scan::Recovered(buf.len()),
                    };
                }
            }
        }
    }

    Scan::Recovered(buf.len())
}
