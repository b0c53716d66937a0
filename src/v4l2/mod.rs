// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Memory-mapped V4L2 capture backend.

mod sys;

use crate::{
    error::{Error, Result},
    source::{Capabilities, CaptureSource, Filled, Format, FormatRequest, IoMethod, Wait},
};
use libc::{
    c_int, c_void, mmap, munmap, poll, pollfd, MAP_FAILED, MAP_SHARED, POLLIN, PROT_READ,
    PROT_WRITE,
};
use nix::errno::Errno;
use std::{
    fs::{File, OpenOptions},
    io,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    ptr::null_mut,
    slice::from_raw_parts,
};
use sys::*;
use tracing::{debug, warn};
use unix_ts::Timestamp;

/// Longest single poll. A cancel request is seen at the latest when a poll
/// this long times out.
const POLL_TIMEOUT_MS: c_int = 200;

/// A driver buffer mapped into the process.
///
/// The mapping is removed when dropped.
struct MappedBuffer {
    ptr: *mut u8,
    len: usize,
}

impl MappedBuffer {
    fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if unsafe { munmap(self.ptr.cast::<c_void>(), self.len) } != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// A V4L2 video capture node streaming MJPEG through mapped buffers.
///
/// The node is opened non-blocking; [`CaptureSource::wait_ready`] polls it
/// and [`CaptureSource::dequeue`] reports `EAGAIN` as "not ready".
pub struct V4l2Device {
    path: String,
    file: File,
    buffers: Vec<MappedBuffer>,
    streaming: bool,
}

impl V4l2Device {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|err| Error::device(path, "open", err))?;
        debug!("opened {} fd {}", path, file.as_raw_fd());
        Ok(Self {
            path: path.to_string(),
            file,
            buffers: Vec::new(),
            streaming: false,
        })
    }

    fn fd(&self) -> c_int {
        self.file.as_raw_fd()
    }

    /// Reset cropping to the default rectangle. Drivers without cropping
    /// support reject this, which is fine.
    fn reset_crop(&self) {
        let fd = self.fd();
        let mut cropcap: v4l2_cropcap = unsafe { zeroed() };
        cropcap.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        if xioctl(|| unsafe { vidioc_cropcap(fd, &mut cropcap) }).is_err() {
            return;
        }
        let crop = v4l2_crop {
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            c: cropcap.defrect,
        };
        if let Err(err) = xioctl(|| unsafe { vidioc_s_crop(fd, &crop) }) {
            debug!("{}: crop not supported: {}", self.path, err);
        }
    }

    fn set_frame_interval(&self, fps: u32) {
        let fd = self.fd();
        let mut parm: v4l2_streamparm = unsafe { zeroed() };
        parm.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe {
            parm.parm.capture.timeperframe = v4l2_fract {
                numerator: 1,
                denominator: fps,
            };
        }
        if let Err(err) = xioctl(|| unsafe { vidioc_s_parm(fd, &mut parm) }) {
            warn!("{}: unable to set frame interval: {}", self.path, err);
            return;
        }
        let actual = unsafe { parm.parm.capture.timeperframe };
        debug!(
            "{}: frame interval {}/{}",
            self.path, actual.numerator, actual.denominator
        );
    }

    fn request(&self, count: u32) -> nix::Result<u32> {
        let fd = self.fd();
        let mut req: v4l2_requestbuffers = unsafe { zeroed() };
        req.count = count;
        req.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        req.memory = V4L2_MEMORY_MMAP;
        xioctl(|| unsafe { vidioc_reqbufs(fd, &mut req) })?;
        Ok(req.count)
    }

    fn map(&self, index: u32) -> Result<MappedBuffer> {
        let fd = self.fd();
        let mut buf: v4l2_buffer = unsafe { zeroed() };
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = V4L2_MEMORY_MMAP;
        buf.index = index;
        xioctl(|| unsafe { vidioc_querybuf(fd, &mut buf) })
            .map_err(|err| Error::AllocationFailed {
                index,
                source: err.into(),
            })?;

        let len = buf.length as usize;
        let offset = unsafe { buf.m.offset };
        let ptr = unsafe {
            mmap(
                null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == MAP_FAILED {
            return Err(Error::AllocationFailed {
                index,
                source: io::Error::last_os_error(),
            });
        }
        Ok(MappedBuffer {
            ptr: ptr.cast::<u8>(),
            len,
        })
    }

    fn stream(&mut self, on: bool) -> Result<()> {
        let fd = self.fd();
        let type_: c_int = V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        if on {
            xioctl(|| unsafe { vidioc_streamon(fd, &type_) })
                .map_err(|err| Error::io("VIDIOC_STREAMON", err))?;
        } else {
            xioctl(|| unsafe { vidioc_streamoff(fd, &type_) })
                .map_err(|err| Error::io("VIDIOC_STREAMOFF", err))?;
        }
        self.streaming = on;
        Ok(())
    }
}

impl CaptureSource for V4l2Device {
    fn name(&self) -> &str {
        &self.path
    }

    fn capabilities(&mut self) -> Result<Capabilities> {
        let fd = self.fd();
        let mut cap: v4l2_capability = unsafe { zeroed() };
        match xioctl(|| unsafe { vidioc_querycap(fd, &mut cap) }) {
            Ok(_) => {}
            Err(Errno::EINVAL) | Err(Errno::ENOTTY) => {
                return Err(Error::NotCapture(self.path.clone()))
            }
            Err(err) => return Err(Error::device(&self.path, "VIDIOC_QUERYCAP", err)),
        }

        let caps = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        Ok(Capabilities {
            driver: c_str(&cap.driver),
            card: c_str(&cap.card),
            bus_info: c_str(&cap.bus_info),
            capture: caps & V4L2_CAP_VIDEO_CAPTURE != 0,
            streaming: caps & V4L2_CAP_STREAMING != 0,
            read_write: caps & V4L2_CAP_READWRITE != 0,
        })
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<Format> {
        self.reset_crop();

        let fd = self.fd();
        let mut fmt: v4l2_format = unsafe { zeroed() };
        fmt.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        fmt.fmt.pix = v4l2_pix_format {
            width: request.width,
            height: request.height,
            pixelformat: request.fourcc.into(),
            field: V4L2_FIELD_ANY,
            ..unsafe { zeroed() }
        };
        xioctl(|| unsafe { vidioc_s_fmt(fd, &mut fmt) })
            .map_err(|err| Error::device(&self.path, "VIDIOC_S_FMT", err))?;
        let pix = unsafe { fmt.fmt.pix };

        if request.fps > 0 {
            self.set_frame_interval(request.fps);
        }

        Ok(Format {
            width: pix.width,
            height: pix.height,
            fourcc: pix.pixelformat.into(),
            size_image: pix.sizeimage,
        })
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let granted = match self.request(count) {
            Ok(granted) => granted,
            Err(Errno::EINVAL) => return Err(Error::Unsupported(IoMethod::Mmap)),
            Err(err) => return Err(Error::device(&self.path, "VIDIOC_REQBUFS", err)),
        };

        self.buffers.clear();
        for index in 0..granted {
            match self.map(index) {
                Ok(buffer) => self.buffers.push(buffer),
                Err(err) => {
                    self.buffers.clear();
                    return Err(err);
                }
            }
        }
        debug!(
            "{}: mapped {} of {} requested buffers",
            self.path, granted, count
        );
        Ok(granted)
    }

    fn region(&self, index: u32) -> Option<&[u8]> {
        self.buffers.get(index as usize).map(MappedBuffer::as_slice)
    }

    fn enqueue(&mut self, index: u32) -> Result<()> {
        let fd = self.fd();
        let mut buf: v4l2_buffer = unsafe { zeroed() };
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = V4L2_MEMORY_MMAP;
        buf.index = index;
        xioctl(|| unsafe { vidioc_qbuf(fd, &mut buf) })
            .map_err(|err| Error::io("VIDIOC_QBUF", err))?;
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<Filled>> {
        let fd = self.fd();
        let mut buf: v4l2_buffer = unsafe { zeroed() };
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = V4L2_MEMORY_MMAP;
        match xioctl(|| unsafe { vidioc_dqbuf(fd, &mut buf) }) {
            Ok(_) => {}
            Err(Errno::EAGAIN) => return Ok(None),
            Err(err) => return Err(Error::io("VIDIOC_DQBUF", err)),
        }

        if buf.flags & V4L2_BUF_FLAG_ERROR != 0 {
            debug!("{}: buffer {} flagged as corrupted", self.path, buf.index);
        }
        let nanos = (buf.timestamp.tv_usec as u32).saturating_mul(1000);
        Ok(Some(Filled {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
            sequence: buf.sequence,
            timestamp: Timestamp::new(buf.timestamp.tv_sec as i64, nanos),
        }))
    }

    fn wait_ready(&mut self) -> Result<Wait> {
        let mut pfd = pollfd {
            fd: self.fd(),
            events: POLLIN,
            revents: 0,
        };
        match unsafe { poll(&mut pfd, 1, POLL_TIMEOUT_MS) } {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(Wait::Interrupted);
                }
                Err(Error::io("poll", err))
            }
            0 => Ok(Wait::Interrupted),
            _ => Ok(Wait::Ready),
        }
    }

    fn start(&mut self) -> Result<()> {
        self.stream(true)
    }

    fn stop(&mut self) -> Result<()> {
        self.stream(false)
    }

    fn release_buffers(&mut self) -> Result<()> {
        self.buffers.clear();
        match self.request(0) {
            Ok(_) | Err(Errno::EINVAL) => Ok(()),
            Err(err) => Err(Error::device(&self.path, "VIDIOC_REQBUFS", err)),
        }
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if self.streaming {
            if let Err(err) = self.stream(false) {
                warn!("{}: {}", self.path, err);
            }
        }
        self.buffers.clear();
        debug!("closed {}", self.path);
    }
}
