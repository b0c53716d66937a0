// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Destinations for extracted images.

use crate::jpeg::Image;
use std::{
    fmt,
    fs::File,
    io::{self, Write},
    path::PathBuf,
};
use tracing::debug;

/// Receives one image at a time.
///
/// Each image gets a single write attempt. The returned count may be less
/// than [`Image::len`]; the caller decides what a short write means.
pub trait Sink {
    fn write_image(&mut self, image: &Image) -> io::Result<usize>;
}

/// Any writer is a sink. The body and trailer go out in one vectored write
/// and the writer is flushed so buffered streams emit whole images.
impl<W: Write + ?Sized> Sink for W {
    fn write_image(&mut self, image: &Image) -> io::Result<usize> {
        let written = self.write_vectored(&image.io_slices())?;
        self.flush()?;
        Ok(written)
    }
}

/// Writes each image to its own file named from a `%d` or `%0Nd` pattern,
/// counting from zero.
pub struct FileSequence {
    prefix: String,
    width: usize,
    suffix: String,
    next: u64,
}

impl FileSequence {
    /// Parse `pattern`, `None` if it has no numeric placeholder.
    pub fn new(pattern: &str) -> Option<Self> {
        let start = pattern.find('%')?;
        let rest = &pattern[start + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if rest.as_bytes().get(digits) != Some(&b'd') {
            return None;
        }
        let width = &rest[..digits];
        if !width.is_empty() && !width.starts_with('0') {
            return None;
        }
        Some(Self {
            prefix: pattern[..start].to_string(),
            width: width.parse().unwrap_or(0),
            suffix: rest[digits + 1..].to_string(),
            next: 0,
        })
    }

    pub fn path(&self, index: u64) -> PathBuf {
        PathBuf::from(format!(
            "{}{:0width$}{}",
            self.prefix,
            index,
            self.suffix,
            width = self.width
        ))
    }

    /// Number of files written so far.
    pub fn count(&self) -> u64 {
        self.next
    }
}

impl Sink for FileSequence {
    fn write_image(&mut self, image: &Image) -> io::Result<usize> {
        let path = self.path(self.next);
        let mut file = File::create(&path)?;
        self.next += 1;
        let written = file.write_vectored(&image.io_slices())?;
        debug!("{}: {} bytes", path.display(), written);
        Ok(written)
    }
}

/// Where images are written.
pub enum Output {
    Stdout(io::Stdout),
    /// Every image appended to one file, a concatenated MJPEG stream.
    File(PathBuf, File),
    Sequence(FileSequence),
}

impl Output {
    /// Standard output for `None` or `-`, a file sequence when `path` has a
    /// `%d` placeholder, otherwise one file, truncated.
    pub fn open(path: Option<&str>) -> io::Result<Self> {
        match path {
            None | Some("-") => Ok(Output::Stdout(io::stdout())),
            Some(path) => match FileSequence::new(path) {
                Some(sequence) => Ok(Output::Sequence(sequence)),
                None => Ok(Output::File(PathBuf::from(path), File::create(path)?)),
            },
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Output::Stdout(_) => write!(f, "stdout"),
            Output::File(path, _) => write!(f, "{}", path.display()),
            Output::Sequence(sequence) => write!(f, "{}", sequence.path(sequence.next).display()),
        }
    }
}

impl Sink for Output {
    fn write_image(&mut self, image: &Image) -> io::Result<usize> {
        match self {
            Output::Stdout(stdout) => stdout.lock().write_image(image),
            Output::File(_, file) => file.write_image(image),
            Output::Sequence(sequence) => sequence.write_image(image),
        }
    }
}
