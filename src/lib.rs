// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst MJPEG Frame Grabber Library
//!
//! This library captures Motion-JPEG frames from a streaming camera and
//! writes each frame out as a standalone, well-formed JPEG codestream. It
//! manages the buffers shared with the camera driver, frames the JPEG image
//! inside each buffer (trimming padding, repairing truncated frames and
//! rejecting corrupt ones) and hands the images to a sink.
//!
//! ## Features
//!
//! - **V4L2 Capture**: Memory-mapped streaming I/O against any V4L2 video
//!   capture node that produces MJPEG.
//! - **Buffer Ownership**: Every shared buffer is owned by exactly one side
//!   at a time; acquired buffers are move-only tokens.
//! - **JPEG Framing**: A bounds-checked marker-segment walk that finds the
//!   real end of each image.
//! - **Stream Splitting**: Cut concatenated MJPEG streams into images.
//! - **Capture Commands**: Run a vendor capture tool and split its stdout,
//!   restarting the tool whenever it exits.
//! - **Synthetic Source**: `stub://` devices generate scripted frames for
//!   testing without a camera.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_mjpeg::{
//!     capture::{self, CancelToken, CaptureConfig, Session},
//!     sink::Output,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CaptureConfig {
//!     device: "/dev/video0".to_string(),
//!     ..Default::default()
//! };
//! let pool = capture::open(&config)?;
//! let output = Output::open(Some("frame-%04d.jpg"))?;
//!
//! let mut session = Session::new(pool, output, CancelToken::new());
//! let report = session.run(10)?;
//! println!("{} images", report.images());
//! session.finish()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: V4L2 with streaming I/O and an MJPEG-capable capture device
//!
//! ## Safety
//!
//! This library uses `unsafe` code for the V4L2 ioctls and the buffer
//! mappings. All unsafe operations are isolated to the [`v4l2`] module and
//! wrapped with safe APIs.

pub mod capture;
pub mod command;
pub mod error;
pub mod jpeg;
pub mod pool;
pub mod sink;
pub mod source;
pub mod splitter;
pub mod synthetic;
pub mod v4l2;

pub use error::{Error, Result};
