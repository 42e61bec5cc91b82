//! Threaded frame source.
//!
//! `FrameSource` owns one capture thread per camera. The thread:
//! 1. Opens the backend, trying each transport in order, and only counts a
//!    connection as live once a frame has actually been decoded
//! 2. Reads frames into the single-slot `LatestFrame`, overwriting unread ones
//! 3. Marks the source disconnected after `failure_threshold` consecutive read
//!    failures and re-initialises after `reconnect_delay`
//! 4. After `max_reconnect_attempts` failed re-initialisations, cools down for
//!    `cooldown`, resets the counter, and keeps trying. It never gives up.
//!
//! The orchestrator only calls `read()`, which never blocks on I/O.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{BackendOpener, DefaultOpener, SourceDescriptor, StreamBackend};
use crate::frame::{Frame, LatestFrame};

/// Sleep granularity while waiting, so `stop()` is observed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Connection state of one source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
}

impl StreamState {
    fn to_u8(self) -> u8 {
        match self {
            StreamState::Disconnected => 0,
            StreamState::Connecting => 1,
            StreamState::Streaming => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Connecting,
            2 => StreamState::Streaming,
            _ => StreamState::Disconnected,
        }
    }
}

/// Retry and timing knobs for a capture thread.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Re-initialisations attempted before entering the cooldown.
    pub max_reconnect_attempts: u32,
    /// Wait before each re-initialisation.
    pub reconnect_delay: Duration,
    /// Extended wait after exhausting `max_reconnect_attempts`.
    pub cooldown: Duration,
    /// Open-and-read verification rounds per initialisation.
    pub verify_attempts: u32,
    /// Wait between verification rounds.
    pub verify_delay: Duration,
    /// Consecutive read failures that mark the source disconnected.
    pub failure_threshold: u32,
    /// Pause after a failed read.
    pub read_retry_delay: Duration,
    /// Bound on joining the capture thread in `stop()`.
    pub stop_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(5),
            cooldown: Duration::from_secs(30),
            verify_attempts: 3,
            verify_delay: Duration::from_secs(2),
            failure_threshold: 10,
            read_retry_delay: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(1),
        }
    }
}

/// Counters for one source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub source_id: String,
    pub state: StreamState,
    pub frames_captured: u64,
    /// Frames overwritten before the orchestrator read them.
    pub frames_dropped: u64,
    pub read_failures: u64,
    /// Successful initialisations, including the first one.
    pub connects: u64,
}

struct Shared {
    latest: LatestFrame,
    state: AtomicU8,
    running: AtomicBool,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    read_failures: AtomicU64,
    connects: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            latest: LatestFrame::new(),
            state: AtomicU8::new(StreamState::Disconnected.to_u8()),
            running: AtomicBool::new(true),
            frames_captured: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    fn publish(&self, frame: Frame) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        if self.latest.replace(frame) {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sleep for `duration` unless stopped first. Returns false when stopped.
    fn sleep_while_running(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
        false
    }
}

/// One camera: a capture thread plus the latest-frame slot it fills.
pub struct FrameSource {
    descriptor: SourceDescriptor,
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl FrameSource {
    /// Spawn the capture thread for `descriptor` using the compiled-in backends.
    pub fn start(descriptor: SourceDescriptor, policy: ReconnectPolicy) -> Result<Self> {
        Self::start_with(descriptor, policy, Arc::new(DefaultOpener))
    }

    pub fn start_with(
        descriptor: SourceDescriptor,
        policy: ReconnectPolicy,
        opener: Arc<dyn BackendOpener>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::new());
        let stop_timeout = policy.stop_timeout;
        let capture = CaptureLoop {
            descriptor: descriptor.clone(),
            policy,
            opener,
            shared: shared.clone(),
            backend: None,
            reconnect_attempts: 0,
        };
        let join = std::thread::Builder::new()
            .name(format!("capture-{}", descriptor.id))
            .spawn(move || capture.run())
            .map_err(|e| anyhow!("spawn capture thread for {}: {}", descriptor.id, e))?;
        log::info!(
            "FrameSource: started {} ({})",
            descriptor.id,
            descriptor.redacted()
        );
        Ok(Self {
            descriptor,
            shared,
            join: Some(join),
            stop_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// Latest unread frame, if any. Never blocks on the stream.
    pub fn read(&self) -> Option<Frame> {
        self.shared.latest.take()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == StreamState::Streaming
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            source_id: self.descriptor.id.clone(),
            state: self.shared.state(),
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            read_failures: self.shared.read_failures.load(Ordering::Relaxed),
            connects: self.shared.connects.load(Ordering::Relaxed),
        }
    }

    /// Signal the capture thread and join it within the policy's stop timeout.
    ///
    /// The capture thread releases its backend on exit. If it is still blocked in
    /// a stream read when the timeout expires, it is detached and releases the
    /// backend as soon as that read returns.
    pub fn stop(mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + self.stop_timeout;
        while !join.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if join.is_finished() {
            join.join()
                .map_err(|_| anyhow!("capture thread for {} panicked", self.descriptor.id))?;
            log::info!("FrameSource: stopped {}", self.descriptor.id);
        } else {
            log::warn!(
                "FrameSource: capture thread for {} did not exit within {:?}; detaching",
                self.descriptor.id,
                self.stop_timeout
            );
        }
        self.shared.latest.clear();
        Ok(())
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Capture thread
// ----------------------------------------------------------------------------

struct CaptureLoop {
    descriptor: SourceDescriptor,
    policy: ReconnectPolicy,
    opener: Arc<dyn BackendOpener>,
    shared: Arc<Shared>,
    backend: Option<Box<dyn StreamBackend>>,
    reconnect_attempts: u32,
}

impl CaptureLoop {
    fn run(mut self) {
        self.initialize();
        while self.shared.is_running() {
            if self.backend.is_some() {
                self.capture_until_failure();
                continue;
            }
            if self.reconnect_attempts < self.policy.max_reconnect_attempts {
                if !self.shared.sleep_while_running(self.policy.reconnect_delay) {
                    break;
                }
                self.reconnect_attempts += 1;
                log::warn!(
                    "FrameSource: reconnecting {} (attempt {}/{})",
                    self.descriptor.id,
                    self.reconnect_attempts,
                    self.policy.max_reconnect_attempts
                );
                self.initialize();
            } else {
                log::error!(
                    "FrameSource: max reconnection attempts reached for {}; cooling down for {:?}",
                    self.descriptor.id,
                    self.policy.cooldown
                );
                if !self.shared.sleep_while_running(self.policy.cooldown) {
                    break;
                }
                self.reconnect_attempts = 0;
            }
        }
        if let Some(mut backend) = self.backend.take() {
            backend.release();
        }
        self.shared.set_state(StreamState::Disconnected);
        log::debug!("FrameSource: capture thread for {} exited", self.descriptor.id);
    }

    /// Open the stream and prove it with one decoded frame. Returns true on success.
    fn initialize(&mut self) -> bool {
        self.shared.set_state(StreamState::Connecting);
        let attempts = self.policy.verify_attempts.max(1);
        for attempt in 1..=attempts {
            for &transport in self.descriptor.transports() {
                if !self.shared.is_running() {
                    self.shared.set_state(StreamState::Disconnected);
                    return false;
                }
                let mut backend = match self.opener.open(&self.descriptor, transport) {
                    Ok(backend) => backend,
                    Err(err) => {
                        log::warn!(
                            "FrameSource: failed to open {} via {:?} (attempt {}/{}): {:#}",
                            self.descriptor.id,
                            transport,
                            attempt,
                            attempts,
                            err
                        );
                        continue;
                    }
                };
                match backend.read_frame() {
                    Ok(frame) => {
                        log::info!(
                            "FrameSource: connected to {} via {} ({:?}), frame {}x{}",
                            self.descriptor.id,
                            backend.name(),
                            transport,
                            frame.width(),
                            frame.height()
                        );
                        self.shared.publish(frame);
                        self.shared.connects.fetch_add(1, Ordering::Relaxed);
                        self.backend = Some(backend);
                        self.reconnect_attempts = 0;
                        self.shared.set_state(StreamState::Streaming);
                        return true;
                    }
                    Err(err) => {
                        log::warn!(
                            "FrameSource: {} opened but cannot read frames via {:?} (attempt {}/{}): {:#}",
                            self.descriptor.id,
                            transport,
                            attempt,
                            attempts,
                            err
                        );
                        backend.release();
                    }
                }
            }
            if attempt < attempts && !self.shared.sleep_while_running(self.policy.verify_delay) {
                break;
            }
        }
        log::error!(
            "FrameSource: all connection attempts failed for {}",
            self.descriptor.id
        );
        self.shared.set_state(StreamState::Disconnected);
        false
    }

    fn capture_until_failure(&mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };
        let mut consecutive_failures = 0u32;
        while self.shared.is_running() {
            match backend.read_frame() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    self.shared.publish(frame);
                }
                Err(err) => {
                    consecutive_failures += 1;
                    self.shared.read_failures.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "FrameSource: read failure on {} ({}/{}): {:#}",
                        self.descriptor.id,
                        consecutive_failures,
                        self.policy.failure_threshold,
                        err
                    );
                    if consecutive_failures >= self.policy.failure_threshold.max(1) {
                        log::warn!(
                            "FrameSource: {} consecutive read failures on {}; marking disconnected",
                            consecutive_failures,
                            self.descriptor.id
                        );
                        backend.release();
                        self.shared.set_state(StreamState::Disconnected);
                        return;
                    }
                    if !self.shared.sleep_while_running(self.policy.read_retry_delay) {
                        break;
                    }
                }
            }
        }
        self.backend = Some(backend);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
