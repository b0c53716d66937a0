// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Cut a concatenated MJPEG byte stream into images.
//!
//! Encoders such as `libcamera-vid --codec mjpeg -o -` emit JPEG images back
//! to back with no container. [`Splitter`] walks the marker segments of each
//! image incrementally, the same way [`crate::jpeg::scan`] walks a capture
//! buffer, and yields every image from its SOI through its EOI marker. Bytes
//! between images are skipped. When an image is corrupt the splitter skips
//! ahead to the next SOI marker; it gives up after too many corrupt images in
//! a row.

use crate::{
    error::{Error, Result},
    jpeg::{Context, EOI, MARKER, RST0, RST7, SOI, SOS},
};
use std::io::{self, BufRead};
use tracing::debug;

/// Corrupt images tolerated in a row before the stream is rejected.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

enum Frame {
    Image(Vec<u8>),
    Bad {
        offset: u64,
        previous: u8,
        context: Context,
    },
    End,
}

pub struct Splitter<R> {
    reader: R,
    offset: u64,
    errors: u32,
    images: u64,
    finished: bool,
}

impl<R: BufRead> Splitter<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            errors: 0,
            images: 0,
            finished: false,
        }
    }

    /// Bytes consumed from the stream.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Images yielded so far.
    pub fn images(&self) -> u64 {
        self.images
    }

    /// Bytes available in the reader's buffer, 0 at end of stream.
    fn fill(&mut self) -> Result<usize> {
        loop {
            match self.reader.fill_buf() {
                Ok(buf) => return Ok(buf.len()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::io("read", err)),
            }
        }
    }

    fn byte(&mut self) -> Result<Option<u8>> {
        if self.fill()? == 0 {
            return Ok(None);
        }
        let buf = self.reader.fill_buf().map_err(|err| Error::io("read", err))?;
        let b = buf[0];
        self.reader.consume(1);
        self.offset += 1;
        Ok(Some(b))
    }

    /// Append the next `len` bytes to `out`, false if the stream ends first.
    fn take(&mut self, out: &mut Vec<u8>, mut len: usize) -> Result<bool> {
        while len > 0 {
            if self.fill()? == 0 {
                return Ok(false);
            }
            let buf = self.reader.fill_buf().map_err(|err| Error::io("read", err))?;
            let n = len.min(buf.len());
            out.extend_from_slice(&buf[..n]);
            self.reader.consume(n);
            self.offset += n as u64;
            len -= n;
        }
        Ok(true)
    }

    /// Append entropy-coded data up to and including the `FF D9` pair that
    /// ends it, false if the stream ends first.
    fn entropy(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        let mut was_ff = false;
        loop {
            if self.fill()? == 0 {
                return Ok(false);
            }
            let buf = self.reader.fill_buf().map_err(|err| Error::io("read", err))?;
            let mut end = None;
            for (i, &b) in buf.iter().enumerate() {
                if was_ff && b == EOI {
                    end = Some(i + 1);
                    break;
                }
                was_ff = b == MARKER;
            }
            let n = end.unwrap_or(buf.len());
            out.extend_from_slice(&buf[..n]);
            self.reader.consume(n);
            self.offset += n as u64;
            if end.is_some() {
                return Ok(true);
            }
        }
    }

    /// Skip to just past the next SOI marker, false at end of stream.
    fn sync(&mut self) -> Result<bool> {
        let start = self.offset;
        let mut was_ff = false;
        while let Some(b) = self.byte()? {
            if was_ff && b == SOI {
                let skipped = self.offset - start - 2;
                if skipped > 0 {
                    debug!("skipped {} bytes before offset {}", skipped, self.offset - 2);
                }
                return Ok(true);
            }
            was_ff = b == MARKER;
        }
        if self.offset > start {
            debug!("{} trailing bytes", self.offset - start);
        }
        Ok(false)
    }

    /// Read the rest of an image whose SOI was just consumed.
    fn frame(&mut self) -> Result<Frame> {
        let mut out = vec![MARKER, SOI];
        let mut previous = SOI;
        loop {
            let Some(b) = self.byte()? else {
                return Ok(Frame::End);
            };
            if b != MARKER {
                out.push(b);
                return Ok(Frame::Bad {
                    offset: self.offset - 1,
                    previous,
                    context: Context::around(&out, out.len() - 1),
                });
            }

            let mut code = MARKER;
            while code == MARKER {
                code = match self.byte()? {
                    Some(code) => code,
                    None => return Ok(Frame::End),
                };
                if code == MARKER {
                    out.push(MARKER);
                }
            }
            out.extend_from_slice(&[MARKER, code]);
            previous = code;

            match code {
                SOI | RST0..=RST7 => {}
                EOI => return Ok(Frame::Image(out)),
                _ => {
                    if !self.take(&mut out, 2)? {
                        return Ok(Frame::End);
                    }
                    let length = u16::from_be_bytes([out[out.len() - 2], out[out.len() - 1]]);
                    if length < 2 {
                        return Ok(Frame::Bad {
                            offset: self.offset - 4,
                            previous,
                            context: Context::around(&out, out.len() - 4),
                        });
                    }
                    if !self.take(&mut out, length as usize - 2)? {
                        return Ok(Frame::End);
                    }
                    if code == SOS {
                        if self.entropy(&mut out)? {
                            return Ok(Frame::Image(out));
                        }
                        return Ok(Frame::End);
                    }
                }
            }
        }
    }

    fn advance(&mut self) -> Result<Option<Vec<u8>>> {
        while self.sync()? {
            match self.frame()? {
                Frame::Image(image) => {
                    self.errors = 0;
                    self.images += 1;
                    debug!("image {} of {} bytes", self.images, image.len());
                    return Ok(Some(image));
                }
                Frame::End => {
                    debug!("stream ended inside an image at offset {}", self.offset);
                    return Ok(None);
                }
                Frame::Bad {
                    offset,
                    previous,
                    context,
                } => {
                    self.errors += 1;
                    debug!(
                        "bad marker at offset {} {} after {:02x}",
                        offset, context, previous
                    );
                    if self.errors > MAX_CONSECUTIVE_ERRORS {
                        return Err(Error::Malformed {
                            offset: offset as usize,
                            context,
                        });
                    }
                }
            }
        }
        Ok(None)
    }
}

impl<R: BufRead> Iterator for Splitter<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let next = self.advance();
        if !matches!(next, Ok(Some(_))) {
            self.finished = true;
        }
        next.transpose()
    }
}
