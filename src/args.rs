// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_mjpeg::{
    capture::CaptureConfig,
    source::{FormatRequest, IoMethod, MJPG},
};
use std::path::PathBuf;

fn parse_resolution(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value:?}"))?;
    let width = width.trim().parse().map_err(|err| format!("width: {err}"))?;
    let height = height.trim().parse().map_err(|err| format!("height: {err}"))?;
    if width == 0 || height == 0 {
        return Err("resolution must be non-zero".to_string());
    }
    Ok((width, height))
}

/// Command-line arguments for the EdgeFirst MJPEG Frame Grabber.
///
/// Arguments can be specified via command line or environment variables.
///
/// # Example
///
/// ```bash
/// # Ten frames as numbered files
/// edgefirst-mjpeg --device /dev/video2 --count 10 --output frame-%04d.jpg
///
/// # Split a concatenated stream from another tool
/// libcamera-vid -t 0 --codec mjpeg -o - | edgefirst-mjpeg --input - -o out-%d.jpg
///
/// # Keep a capture tool running and relay 100 images
/// edgefirst-mjpeg --cmd '{"cmd":["libcamera-vid","-t","0","--codec","mjpeg","-o","-"]}' -c 100
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Capture device path (e.g., /dev/video0), or stub:// for a synthetic
    /// source
    #[arg(short, long, env = "DEVICE", default_value = "/dev/video0")]
    pub device: String,

    /// Capture resolution as WIDTHxHEIGHT
    #[arg(
        short,
        long,
        env = "RESOLUTION",
        default_value = "1280x720",
        value_parser = parse_resolution
    )]
    pub resolution: (u32, u32),

    /// Requested frame rate (0 keeps the device default)
    #[arg(short = 'i', long, env = "FPS", default_value = "30")]
    pub fps: u32,

    /// Output file, a pattern such as frame-%04d.jpg for one file per
    /// image, or - for stdout
    #[arg(short, long, env = "OUTPUT")]
    pub output: Option<String>,

    /// Number of frames to capture (default 1); with --input or --cmd, the
    /// number of images to relay (default all)
    #[arg(short, long, env = "COUNT")]
    pub count: Option<u64>,

    /// Number of buffers to request from the device
    #[arg(long, env = "BUFFERS", default_value = "4")]
    pub buffers: u32,

    /// Buffer I/O method
    #[arg(long, env = "IO_METHOD", default_value = "mmap", value_enum)]
    pub io_method: IoMethod,

    /// Split a concatenated MJPEG stream from this file (- for stdin)
    /// instead of capturing
    #[arg(long, env = "INPUT", conflicts_with = "cmd")]
    pub input: Option<String>,

    /// Run a capture command and split its stdout instead of capturing.
    /// JSON {"cmd":[...],"retry":"500ms"} given inline, as a file path, or
    /// - for stdin
    #[arg(long, env = "CAPTURE_CMD")]
    pub cmd: Option<String>,

    /// Append a JSON line with the run statistics to this file
    #[arg(long, env = "STATS")]
    pub stats: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl From<&Args> for CaptureConfig {
    fn from(args: &Args) -> Self {
        CaptureConfig {
            device: args.device.clone(),
            format: FormatRequest {
                width: args.resolution.0,
                height: args.resolution.1,
                fourcc: MJPG,
                fps: args.fps,
            },
            buffers: args.buffers,
            io_method: args.io_method,
        }
    }
}
