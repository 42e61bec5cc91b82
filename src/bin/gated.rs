//! gated - license-plate gate daemon
//!
//! This daemon:
//! 1. Starts one capture thread per configured camera (enter, exit)
//! 2. Runs plate detection and recognition on the freshest frame of each camera
//! 3. Confirms plates with the configured policy (counter or quorum)
//! 4. Opens the gate through the backend API, never toggling an open gate
//! 5. Exits non-zero when every camera stays down past the loss budget, so the
//!    supervisor restarts it

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gate_sentry::{FrameSource, GateConfig, HttpGateApi, Orchestrator};

#[derive(Parser, Debug)]
#[command(author, version, about = "License-plate gate controller daemon")]
struct Args {
    /// Optional JSON config file; environment variables override its values.
    #[arg(long, env = "GATE_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = GateConfig::load_from(args.config.as_deref())?;
    log::info!(
        "gated starting: gate {} via {} ({:?} policy)",
        cfg.gate_id,
        cfg.api_url,
        cfg.policy
    );

    let api = Arc::new(HttpGateApi::new(&cfg.api_url, cfg.api_timeout));
    let (detector, recognizer) = cfg.build_detector()?;
    let mut orchestrator = Orchestrator::new(
        cfg.pipeline_settings(),
        detector,
        recognizer,
        api,
        cfg.allow_list(),
    );

    for (role, descriptor) in cfg.camera_sources()? {
        let source = FrameSource::start(descriptor, cfg.reconnect.clone())?;
        orchestrator.add_lane(role, Box::new(source));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    let result = orchestrator.run(&shutdown);
    log::info!("stopping camera sources...");
    orchestrator.shutdown();
    if let Err(err) = &result {
        log::error!("gated exiting: {:#}", err);
    }
    result
}
