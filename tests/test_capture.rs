// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_mjpeg::{
    capture::{self, CancelToken, CaptureConfig, Session},
    error::Error as CaptureError,
    jpeg::{scan, Image, Scan, EOI_MARKER},
    pool::{BufferPool, Owner},
    sink::{Output, Sink},
    source::{
        negotiate, Capabilities, CaptureSource, Filled, Format, FormatRequest, IoMethod, Wait,
    },
    synthetic::{frame, Event, FrameSpec, SyntheticSource},
};
use std::{
    error::Error,
    fs, io,
    sync::{Arc, Mutex},
};
use tracing::level_filters::LevelFilter;

fn spec(seed: u32) -> FrameSpec {
    FrameSpec {
        seed,
        entropy_len: 200 + seed as usize * 30,
        restart_interval: if seed % 3 == 0 { 0 } else { 12 },
        ..Default::default()
    }
}

fn session<W: Sink>(
    events: Vec<Event>,
    buffers: u32,
    sink: W,
) -> Result<Session<SyntheticSource, W>, Box<dyn Error>> {
    let mut source = SyntheticSource::new("stub://test").with_script(events);
    negotiate(&mut source, &FormatRequest::default())?;
    let pool = BufferPool::initialize(source, IoMethod::Mmap, buffers)?;
    Ok(Session::new(pool, sink, CancelToken::new()))
}

/// Splits the concatenated sink output back into images by scanning.
fn images(mut out: &[u8]) -> Vec<Vec<u8>> {
    let mut images = Vec::new();
    while !out.is_empty() {
        let Scan::Complete(end) = scan(out) else {
            panic!("output is not a sequence of complete images");
        };
        images.push(out[..end].to_vec());
        out = &out[end..];
    }
    images
}

#[test]
fn test_quota_and_order() -> Result<(), Box<dyn Error>> {
    let events: Vec<Event> = (0..12).map(|seed| Event::Frame(spec(seed))).collect();
    let mut session = session(events, 4, Vec::new())?;

    let report = session.run(10)?;
    assert_eq!(report.attempts, 10);
    assert_eq!(report.complete, 10);
    assert!(!report.cancelled);

    let expected: Vec<Vec<u8>> = (0..10).map(|seed| frame(&spec(seed))).collect();
    assert_eq!(images(session.sink()), expected);

    // nothing held by the application between frames
    assert!(session
        .pool()
        .buffers()
        .iter()
        .all(|info| info.owner == Owner::Source));
    Ok(())
}

#[test]
fn test_mixed_outcomes() -> Result<(), Box<dyn Error>> {
    let full = frame(&spec(2));
    let cut = full.len() - 17;
    let events = vec![
        Event::Frame(spec(1)),
        Event::Truncated(spec(2), cut),
        // the first segment marker after SOI
        Event::Corrupt(spec(3), 2),
        Event::Raw(b"not a jpeg at all".to_vec()),
        Event::Frame(spec(4)),
    ];
    let mut session = session(events, 2, Vec::new())?;

    let report = session.run(5)?;
    assert_eq!(report.attempts, 5);
    assert_eq!(report.complete, 2);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.malformed, 2);
    assert_eq!(report.images(), 3);

    let mut recovered = full[..cut].to_vec();
    recovered.extend_from_slice(&EOI_MARKER);
    let expected = vec![frame(&spec(1)), recovered, frame(&spec(4))];
    assert_eq!(images(session.sink()), expected);
    assert_eq!(report.bytes_written, session.sink().len() as u64);
    Ok(())
}

#[test]
fn test_padded_buffers_are_trimmed() -> Result<(), Box<dyn Error>> {
    let mut padded = frame(&spec(5));
    let len = padded.len();
    padded.extend_from_slice(&[0u8; 300]);
    let mut session = session(vec![Event::Raw(padded)], 2, Vec::new())?;

    let report = session.run(1)?;
    assert_eq!(report.complete, 1);
    assert_eq!(session.sink().len(), len);
    Ok(())
}

#[test]
fn test_interrupted_wait_resumes() -> Result<(), Box<dyn Error>> {
    let events = vec![
        Event::Interrupt,
        Event::NotReady,
        Event::Frame(spec(0)),
        Event::Interrupt,
        Event::Frame(spec(1)),
    ];
    let mut session = session(events, 2, Vec::new())?;
    let report = session.run(2)?;
    assert_eq!(report.complete, 2);
    assert_eq!(report.retries, 1);
    Ok(())
}

#[test]
fn test_cancelled_before_start() -> Result<(), Box<dyn Error>> {
    let source = SyntheticSource::new("stub://cancel");
    let pool = BufferPool::initialize(source, IoMethod::Mmap, 2)?;
    let cancel = CancelToken::new();
    let mut session = Session::new(pool, Vec::new(), cancel.clone());

    cancel.cancel();
    let report = session.run(100)?;
    assert!(report.cancelled);
    assert_eq!(report.attempts, 0);
    assert!(session.sink().is_empty());
    Ok(())
}

/// Cancels from inside the sink after a number of images, the way a signal
/// handler would between frames.
struct CancelAfter {
    remaining: usize,
    cancel: CancelToken,
}

impl Sink for CancelAfter {
    fn write_image(&mut self, image: &Image) -> io::Result<usize> {
        self.remaining -= 1;
        if self.remaining == 0 {
            self.cancel.cancel();
        }
        Ok(image.len())
    }
}

#[test]
fn test_cancelled_mid_run() -> Result<(), Box<dyn Error>> {
    let source = SyntheticSource::new("stub://cancel");
    let pool = BufferPool::initialize(source, IoMethod::Mmap, 3)?;
    let cancel = CancelToken::new();
    let sink = CancelAfter {
        remaining: 3,
        cancel: cancel.clone(),
    };
    let mut session = Session::new(pool, sink, cancel);

    let report = session.run(1000)?;
    assert!(report.cancelled);
    assert_eq!(report.attempts, 3);
    Ok(())
}

/// A source whose waits always time out. The token is cancelled from
/// outside the loop after a few of them.
struct Idle {
    inner: SyntheticSource,
    waits: u32,
    cancel_after: u32,
    cancel: CancelToken,
}

impl CaptureSource for Idle {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&mut self) -> edgefirst_mjpeg::Result<Capabilities> {
        self.inner.capabilities()
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> edgefirst_mjpeg::Result<Format> {
        self.inner.negotiate_format(request)
    }

    fn request_buffers(&mut self, count: u32) -> edgefirst_mjpeg::Result<u32> {
        self.inner.request_buffers(count)
    }

    fn region(&self, index: u32) -> Option<&[u8]> {
        self.inner.region(index)
    }

    fn enqueue(&mut self, index: u32) -> edgefirst_mjpeg::Result<()> {
        self.inner.enqueue(index)
    }

    fn dequeue(&mut self) -> edgefirst_mjpeg::Result<Option<Filled>> {
        self.inner.dequeue()
    }

    fn wait_ready(&mut self) -> edgefirst_mjpeg::Result<Wait> {
        self.waits += 1;
        if self.waits == self.cancel_after {
            self.cancel.cancel();
        }
        Ok(Wait::Interrupted)
    }

    fn start(&mut self) -> edgefirst_mjpeg::Result<()> {
        self.inner.start()
    }

    fn stop(&mut self) -> edgefirst_mjpeg::Result<()> {
        self.inner.stop()
    }

    fn release_buffers(&mut self) -> edgefirst_mjpeg::Result<()> {
        self.inner.release_buffers()
    }
}

#[test]
fn test_cancel_seen_at_wait_timeout() -> Result<(), Box<dyn Error>> {
    let cancel = CancelToken::new();
    let source = Idle {
        inner: SyntheticSource::new("stub://idle"),
        waits: 0,
        cancel_after: 3,
        cancel: cancel.clone(),
    };
    let pool = BufferPool::initialize(source, IoMethod::Mmap, 2)?;
    let mut session = Session::new(pool, Vec::new(), cancel);

    let report = session.run(5)?;
    assert!(report.cancelled);
    assert_eq!(report.attempts, 0);
    assert_eq!(report.retries, 0);
    // no further wait once the flag was set
    assert_eq!(session.pool().source().waits, 3);
    Ok(())
}

#[test]
fn test_source_failure_is_fatal() -> Result<(), Box<dyn Error>> {
    let events = vec![Event::Frame(spec(0)), Event::Fail(libc::EIO)];
    let mut session = session(events, 2, Vec::new())?;

    let err = session.run(5).unwrap_err();
    assert!(matches!(err, CaptureError::Io { op: "VIDIOC_DQBUF", .. }));
    assert_eq!(err.exit_status(), 4);
    // the first frame made it out before the failure
    assert_eq!(session.sink(), &frame(&spec(0)));
    Ok(())
}

struct Broken;

impl Sink for Broken {
    fn write_image(&mut self, _image: &Image) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

#[test]
fn test_output_failure_continues() -> Result<(), Box<dyn Error>> {
    let mut session = session(Vec::new(), 3, Broken)?;
    let report = session.run(3)?;
    assert_eq!(report.attempts, 3);
    assert_eq!(report.failed_writes, 3);
    assert_eq!(report.bytes_written, 0);

    // every buffer went back to the source
    assert!(session
        .pool()
        .buffers()
        .iter()
        .all(|info| info.owner == Owner::Source));
    Ok(())
}

/// Fails the first write, then collects.
#[derive(Default)]
struct Flaky {
    failed: bool,
    out: Vec<u8>,
}

impl Sink for Flaky {
    fn write_image(&mut self, image: &Image) -> io::Result<usize> {
        if !self.failed {
            self.failed = true;
            return Err(io::Error::other("device gone"));
        }
        self.out.write_image(image)
    }
}

#[test]
fn test_output_recovers_after_failure() -> Result<(), Box<dyn Error>> {
    let events: Vec<Event> = (0..3).map(|seed| Event::Frame(spec(seed))).collect();
    let mut session = session(events, 2, Flaky::default())?;

    let report = session.run(3)?;
    assert_eq!(report.attempts, 3);
    assert_eq!(report.complete, 3);
    assert_eq!(report.failed_writes, 1);

    let expected = vec![frame(&spec(1)), frame(&spec(2))];
    assert_eq!(images(&session.sink().out), expected);
    Ok(())
}

/// Collects formatted log output.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

/// Runs a session over frames with recoverable problems under a subscriber
/// filtered at `level` and returns what it logged.
fn logged(level: LevelFilter) -> Result<String, Box<dyn Error>> {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let capacity = 4096;
    let source = SyntheticSource::new("stub://quiet")
        .with_capacity(capacity)
        .with_script(vec![
            Event::Corrupt(spec(3), 2),
            Event::Overreport(spec(1), 512),
            Event::Frame(spec(2)),
        ]);
    let pool = BufferPool::initialize(source, IoMethod::Mmap, 2)?;
    let mut session = Session::new(pool, Flaky::default(), CancelToken::new());

    let report = tracing::subscriber::with_default(subscriber, || session.run(3))?;
    assert_eq!(report.attempts, 3);
    assert_eq!(report.malformed, 1);
    assert_eq!(report.failed_writes, 1);
    Ok(captured.text())
}

#[test]
fn test_recoverable_problems_are_quiet_by_default() -> Result<(), Box<dyn Error>> {
    // the level used without --verbose
    let quiet = logged(LevelFilter::INFO)?;
    assert!(!quiet.contains("bad marker"), "{quiet}");
    assert!(!quiet.contains("failed"), "{quiet}");
    assert!(!quiet.contains("clamping"), "{quiet}");
    assert!(!quiet.contains("WARN"), "{quiet}");

    let verbose = logged(LevelFilter::DEBUG)?;
    assert!(verbose.contains("bad marker"), "{verbose}");
    assert!(verbose.contains("failed"), "{verbose}");
    assert!(verbose.contains("clamping"), "{verbose}");
    Ok(())
}

#[test]
fn test_insufficient_buffers() -> Result<(), Box<dyn Error>> {
    let source = SyntheticSource::new("stub://tight").with_max_buffers(1);
    let err = BufferPool::initialize(source, IoMethod::Mmap, 4).err().ok_or("no error")?;
    assert!(matches!(
        err,
        CaptureError::InsufficientBuffers {
            requested: 4,
            granted: 1
        }
    ));
    assert_eq!(err.exit_status(), 3);
    Ok(())
}

#[test]
fn test_open_stub_device() -> Result<(), Box<dyn Error>> {
    let config = CaptureConfig {
        device: "stub://camera".to_string(),
        buffers: 6,
        ..Default::default()
    };
    let pool = capture::open(&config)?;
    assert_eq!(pool.len(), 6);
    assert_eq!(pool.source().name(), "stub://camera");

    let unsupported = CaptureConfig {
        io_method: IoMethod::Read,
        ..config
    };
    let err = capture::open(&unsupported).err().ok_or("no error")?;
    assert!(matches!(err, CaptureError::Unsupported(IoMethod::Read)));
    Ok(())
}

#[test]
fn test_file_sequence_output() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let pattern = dir.path().join("frame-%02d.jpg");
    let output = Output::open(pattern.to_str())?;

    let events: Vec<Event> = (0..3).map(|seed| Event::Frame(spec(seed))).collect();
    let mut session = session(events, 2, output)?;
    session.run(3)?;
    session.finish()?;

    for seed in 0..3 {
        let path = dir.path().join(format!("frame-{seed:02}.jpg"));
        assert_eq!(fs::read(path)?, frame(&spec(seed)));
    }
    Ok(())
}
