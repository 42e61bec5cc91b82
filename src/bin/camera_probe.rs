//! camera_probe - check that the configured cameras deliver frames.
//!
//! Opens each source with the same open-and-verify sequence the daemon uses
//! (transport fallback, one decoded frame required) and reports the result per
//! camera. Exits 0 when at least one camera is reachable.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use gate_sentry::ingest::{BackendOpener, DefaultOpener, SourceDescriptor};
use gate_sentry::GateConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe gate camera streams")]
struct Args {
    /// Optional JSON config file; environment variables override its values.
    #[arg(long, env = "GATE_CONFIG")]
    config: Option<PathBuf>,

    /// Probe this location instead of the configured cameras (repeatable).
    #[arg(long = "source")]
    sources: Vec<String>,

    /// Verification rounds per camera.
    #[arg(long, default_value = "3")]
    attempts: u32,

    /// Delay between verification rounds.
    #[arg(long, default_value = "2")]
    delay_secs: u64,
}

fn probe(descriptor: &SourceDescriptor, attempts: u32, delay: Duration) -> Result<(u32, u32)> {
    let opener = DefaultOpener;
    let mut last_error = anyhow!("no attempt made");
    for attempt in 1..=attempts.max(1) {
        for &transport in descriptor.transports() {
            match opener.open(descriptor, transport) {
                Ok(mut backend) => {
                    let read = backend.read_frame();
                    backend.release();
                    match read {
                        Ok(frame) => return Ok((frame.width(), frame.height())),
                        Err(err) => {
                            log::warn!(
                                "{}: opened via {:?} but no frame (attempt {}): {:#}",
                                descriptor.id,
                                transport,
                                attempt,
                                err
                            );
                            last_error = err;
                        }
                    }
                }
                Err(err) => {
                    log::warn!(
                        "{}: open via {:?} failed (attempt {}): {:#}",
                        descriptor.id,
                        transport,
                        attempt,
                        err
                    );
                    last_error = err;
                }
            }
        }
        if attempt < attempts {
            std::thread::sleep(delay);
        }
    }
    Err(last_error)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let descriptors: Vec<SourceDescriptor> = if args.sources.is_empty() {
        GateConfig::load_from(args.config.as_deref())?
            .camera_sources()?
            .into_iter()
            .map(|(_, descriptor)| descriptor)
            .collect()
    } else {
        args.sources
            .iter()
            .enumerate()
            .map(|(i, location)| SourceDescriptor::parse(&format!("source-{}", i), location))
            .collect::<Result<_>>()?
    };

    let delay = Duration::from_secs(args.delay_secs);
    let mut reachable = 0usize;
    for descriptor in &descriptors {
        match probe(descriptor, args.attempts, delay) {
            Ok((width, height)) => {
                reachable += 1;
                println!("{}: OK {}x{} ({})", descriptor.id, width, height, descriptor.redacted());
            }
            Err(err) => {
                println!("{}: FAILED ({}): {:#}", descriptor.id, descriptor.redacted(), err);
            }
        }
    }

    println!("{}/{} camera(s) reachable", reachable, descriptors.len());
    if reachable == 0 {
        return Err(anyhow!("no camera is reachable"));
    }
    Ok(())
}
