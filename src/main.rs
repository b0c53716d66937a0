// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use args::Args;
use clap::Parser;
use edgefirst_mjpeg::{
    capture::{self, relay, CancelToken, CaptureConfig, RunReport, Session},
    command::{CommandReader, CommandSpec},
    error::{Error, Result},
    sink::Output,
    splitter::Splitter,
};
use serde_json::json;
use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::Path,
    process::ExitCode,
};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

mod args;

/// Read size for command output.
const COMMAND_BUFFER: usize = 128 * 1024;

fn init_logging(args: &Args) {
    if let Err(err) = tracing_log::LogTracer::init() {
        eprintln!("log bridge unavailable: {err}");
    }

    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // stdout carries images, logs go to stderr
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(filter);
    let journald = tracing_journald::layer()
        .ok()
        .map(|layer| layer.with_filter(LevelFilter::INFO));
    let tracy = if args.tracy {
        Some(tracing_tracy::TracyLayer::default())
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(stderr)
        .with(journald)
        .with(tracy);
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("unable to install logger: {err}");
    }
}

fn output(args: &Args) -> Result<Output> {
    Output::open(args.output.as_deref()).map_err(|source| Error::Output { source })
}

fn capture(args: &Args, cancel: &CancelToken) -> Result<RunReport> {
    let config = CaptureConfig::from(args);
    let quota = args.count.unwrap_or(1);
    let output = output(args)?;
    info!("capturing {} frames from {} to {}", quota, config.device, output);

    let pool = capture::open(&config)?;
    let mut session = Session::new(pool, output, cancel.clone());
    let report = session.run(quota)?;
    session.finish()?;
    Ok(report)
}

fn split(
    args: &Args,
    name: &str,
    reader: Box<dyn BufRead>,
    cancel: &CancelToken,
) -> Result<RunReport> {
    let mut output = output(args)?;
    info!("splitting {} to {}", name, output);

    let mut splitter = Splitter::new(reader);
    relay(&mut splitter, &mut output, args.count, cancel)
}

fn input(input: &str) -> Result<Box<dyn BufRead>> {
    if input == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(input).map_err(|source| Error::Device {
        device: input.to_string(),
        op: "open",
        source,
    })?;
    Ok(Box::new(BufReader::new(file)))
}

fn command(spec: &str, cancel: &CancelToken) -> Result<(String, Box<dyn BufRead>)> {
    let spec = CommandSpec::load(spec)?;
    let name = spec.argv.join(" ");
    let mut reader = CommandReader::new(spec, cancel.clone());
    reader.start()?;
    Ok((name, Box::new(BufReader::with_capacity(COMMAND_BUFFER, reader))))
}

fn write_stats(path: &Path, args: &Args, report: &RunReport) -> io::Result<()> {
    let mut line = report.to_json();
    let source = args.input.as_deref().or(args.cmd.as_deref());
    line["source"] = json!(source.unwrap_or(&args.device));
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let cancel = CancelToken::new();
    let handler = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler.cancel()) {
        warn!("unable to install signal handler: {}", err);
    }

    let result = match (&args.input, &args.cmd) {
        (Some(name), _) => input(name).and_then(|reader| split(&args, name, reader, &cancel)),
        (None, Some(spec)) => command(spec, &cancel)
            .and_then(|(name, reader)| split(&args, &name, reader, &cancel)),
        (None, None) => capture(&args, &cancel),
    };

    match result {
        Ok(report) => {
            if let Some(path) = &args.stats {
                if let Err(err) = write_stats(path, &args, &report) {
                    warn!("{}: {}", path.display(), err);
                }
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::from(err.exit_status())
        }
    }
}
