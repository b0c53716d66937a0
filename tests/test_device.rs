// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_mjpeg::{
    capture::{self, CancelToken, CaptureConfig, Session},
    error::Error as CaptureError,
    jpeg::{scan, Scan},
    source::{self, CaptureSource},
};
use serial_test::serial;
use std::{env, error::Error, time::Instant};

fn device() -> String {
    env::var("DEVICE").unwrap_or_else(|_| "/dev/video0".to_string())
}

#[test]
#[serial]
#[ignore = "camera test is disabled by default (run with --include-ignored to enable)"]
fn test_capabilities() -> Result<(), Box<dyn Error>> {
    let mut source = source::open(&device())?;
    let caps = source.capabilities()?;
    println!("{} {} {}", caps.driver, caps.card, caps.bus_info);
    assert!(caps.capture);
    assert!(caps.streaming);
    Ok(())
}

#[test]
#[serial]
#[ignore = "camera test is disabled by default (run with --include-ignored to enable)"]
fn test_capture() -> Result<(), Box<dyn Error>> {
    let config = CaptureConfig {
        device: device(),
        ..Default::default()
    };
    let pool = capture::open(&config)?;
    let mut session = Session::new(pool, Vec::new(), CancelToken::new());

    let start = Instant::now();
    let report = session.run(30)?;
    println!(
        "{} frames in {:?}: {} complete, {} recovered, {} malformed",
        report.attempts,
        start.elapsed(),
        report.complete,
        report.recovered,
        report.malformed
    );
    assert_eq!(report.attempts, 30);

    let out = session.finish()?;
    assert!(matches!(scan(&out), Scan::Complete(_)));
    Ok(())
}

#[test]
#[serial]
fn test_missing_device() {
    let err = source::open("/dev/video-does-not-exist").err();
    match err {
        Some(err @ CaptureError::Device { .. }) => assert_eq!(err.exit_status(), 2),
        Some(other) => panic!("unexpected {other}"),
        None => panic!("opened a device that does not exist"),
    }
}
