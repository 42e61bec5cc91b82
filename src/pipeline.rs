//! Orchestrator: the single-threaded control loop.
//!
//! Each cycle:
//! 1. Maintenance: allow-list refresh, policy timeouts, stale-entry sweep, and
//!    the total camera loss check
//! 2. For every lane with a fresh frame: detect, gate by ROI, read the plate,
//!    feed the confirmation policy
//! 3. On confirmation: whitelist check (counter policy), snapshot upload (enter
//!    lanes), then the idempotent gate dispatch
//!
//! Tracker and state-machine data is owned here and mutated only on this
//! thread. The only cross-thread state is each source's latest-frame slot.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::{is_whitelisted, GateApi};
use crate::auth::AllowList;
use crate::confirm::{ConfirmationPolicy, PolicySettings, Verdict};
use crate::detect::{PlateDetector, PlateRecognizer};
use crate::frame::{encode_jpeg, Frame};
use crate::gate::{GateActionDispatcher, GateError, GateOutcome};
use crate::ingest::FrameSource;
use crate::plate::{plate_from_recognition, PlateText};
use crate::roi::RoiGate;

const FPS_LOG_INTERVAL_FRAMES: u64 = 100;
const IDLE_SLEEP: Duration = Duration::from_millis(10);
pub const DEFAULT_ALLOW_LIST_REFRESH: Duration = Duration::from_secs(60);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_CAMERA_LOSS_BUDGET: Duration = Duration::from_secs(120);

// ----------------------------------------------------------------------------
// Lanes
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CameraRole {
    Enter,
    Exit,
}

impl CameraRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraRole::Enter => "enter",
            CameraRole::Exit => "exit",
        }
    }
}

impl fmt::Display for CameraRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the orchestrator pulls frames from. `FrameSource` in production.
pub trait FrameFeed: Send {
    fn source_id(&self) -> &str;

    /// Latest unread frame, if any. Must not block on I/O.
    fn read(&self) -> Option<Frame>;

    fn is_connected(&self) -> bool;

    fn stop(self: Box<Self>) -> Result<()>;
}

impl FrameFeed for FrameSource {
    fn source_id(&self) -> &str {
        self.id()
    }

    fn read(&self) -> Option<Frame> {
        FrameSource::read(self)
    }

    fn is_connected(&self) -> bool {
        FrameSource::is_connected(self)
    }

    fn stop(self: Box<Self>) -> Result<()> {
        FrameSource::stop(*self)
    }
}

struct CameraLane {
    role: CameraRole,
    feed: Box<dyn FrameFeed>,
    /// Built from the first frame's dimensions.
    roi: Option<RoiGate>,
    policy: Box<dyn ConfirmationPolicy>,
}

// ----------------------------------------------------------------------------
// Settings and reports
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub gate_id: String,
    pub roi_enabled: bool,
    pub min_confidence: f32,
    /// `None` disables the periodic sweep.
    pub cleanup_interval: Option<Duration>,
    pub allow_list_refresh: Duration,
    pub camera_loss_budget: Duration,
    pub policy: PolicySettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            gate_id: "gate".to_string(),
            roi_enabled: true,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            cleanup_interval: Some(DEFAULT_CLEANUP_INTERVAL),
            allow_list_refresh: DEFAULT_ALLOW_LIST_REFRESH,
            camera_loss_budget: DEFAULT_CAMERA_LOSS_BUDGET,
            policy: PolicySettings::default(),
        }
    }
}

/// A gate action taken during a cycle.
#[derive(Debug)]
pub struct TriggerRecord {
    pub camera_id: String,
    pub role: CameraRole,
    pub plate: PlateText,
    pub snapshot_uploaded: bool,
    pub outcome: Result<GateOutcome, GateError>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    /// Frames processed this cycle.
    pub frames: usize,
    /// In-ROI, non-empty plate readings fed to a policy.
    pub sightings: usize,
    pub triggers: Vec<TriggerRecord>,
}

#[derive(Clone, Debug)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub sightings: u64,
    pub roi_rejections: u64,
    pub detector_errors: u64,
    pub confirmations: u64,
    pub denied: u64,
    pub gate_applied: u64,
    pub gate_already_satisfied: u64,
    pub gate_errors: u64,
    window_start: Option<Instant>,
    window_frames: u64,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            frames_processed: 0,
            sightings: 0,
            roi_rejections: 0,
            detector_errors: 0,
            confirmations: 0,
            denied: 0,
            gate_applied: 0,
            gate_already_satisfied: 0,
            gate_errors: 0,
            window_start: None,
            window_frames: 0,
        }
    }

    fn record_frame(&mut self, now: Instant) {
        self.frames_processed += 1;
        self.window_frames += 1;
        let start = *self.window_start.get_or_insert(now);
        if self.window_frames >= FPS_LOG_INTERVAL_FRAMES {
            let elapsed = now.saturating_duration_since(start).as_secs_f64();
            let fps = if elapsed > 0.0 {
                self.window_frames as f64 / elapsed
            } else {
                0.0
            };
            log::info!(
                "Orchestrator: processed {} frames in {:.1}s ({:.1} FPS), {} total",
                self.window_frames,
                elapsed,
                fps,
                self.frames_processed
            );
            self.window_frames = 0;
            self.window_start = Some(now);
        }
    }
}

// ----------------------------------------------------------------------------
// Orchestrator
// ----------------------------------------------------------------------------

pub struct Orchestrator {
    settings: PipelineSettings,
    lanes: Vec<CameraLane>,
    detector: Box<dyn PlateDetector>,
    recognizer: Box<dyn PlateRecognizer>,
    api: Arc<dyn GateApi>,
    dispatcher: GateActionDispatcher,
    allow_list: AllowList,
    last_sweep: Option<Instant>,
    last_allow_list_refresh: Option<Instant>,
    all_down_since: Option<Instant>,
    stats: PipelineStats,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        mut detector: Box<dyn PlateDetector>,
        recognizer: Box<dyn PlateRecognizer>,
        api: Arc<dyn GateApi>,
        allow_list: AllowList,
    ) -> Self {
        if let Err(err) = detector.warm_up() {
            log::warn!(
                "Orchestrator: detector {} warm-up failed: {:#}",
                detector.name(),
                err
            );
        }
        let dispatcher = GateActionDispatcher::new(api.clone(), &settings.gate_id);
        log::info!(
            "Orchestrator: gate {} using {:?} confirmation, detector {}, recognizer {}",
            settings.gate_id,
            settings.policy.kind,
            detector.name(),
            recognizer.name()
        );
        Self {
            settings,
            lanes: Vec::new(),
            detector,
            recognizer,
            api,
            dispatcher,
            allow_list,
            last_sweep: None,
            last_allow_list_refresh: None,
            all_down_since: None,
            stats: PipelineStats::new(),
        }
    }

    /// Add a camera. Each lane gets its own confirmation policy instance.
    pub fn add_lane(&mut self, role: CameraRole, feed: Box<dyn FrameFeed>) {
        log::info!(
            "Orchestrator: {} camera {} registered",
            role,
            feed.source_id()
        );
        self.lanes.push(CameraLane {
            role,
            feed,
            roi: None,
            policy: self.settings.policy.build(),
        });
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Run cycles until `shutdown` is set or every camera has been down past the
    /// loss budget.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        log::info!(
            "Orchestrator: running with {} camera(s)",
            self.lanes.len()
        );
        while !shutdown.load(Ordering::SeqCst) {
            let report = self.run_cycle(Instant::now())?;
            if report.frames == 0 {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        log::info!("Orchestrator: shutdown requested");
        Ok(())
    }

    /// One pass over every lane at time `now`.
    pub fn run_cycle(&mut self, now: Instant) -> Result<CycleReport> {
        self.maintain(now)?;

        let mut report = CycleReport::default();
        for index in 0..self.lanes.len() {
            let lane = &mut self.lanes[index];
            if !lane.policy.accepting() {
                // Inference is suppressed while access is granted; drop the frame.
                let _ = lane.feed.read();
                continue;
            }
            let Some(frame) = lane.feed.read() else {
                continue;
            };
            self.process_frame(index, frame, now, &mut report);
        }
        Ok(report)
    }

    /// Stop every frame source. Errors are logged.
    pub fn shutdown(&mut self) {
        for lane in self.lanes.drain(..) {
            let id = lane.feed.source_id().to_string();
            if let Err(err) = lane.feed.stop() {
                log::warn!("Orchestrator: failed to stop {}: {:#}", id, err);
            }
        }
    }

    fn maintain(&mut self, now: Instant) -> Result<()> {
        if self.lanes.iter().any(|lane| lane.policy.uses_allow_list()) {
            let due = self.last_allow_list_refresh.map_or(true, |last| {
                now.saturating_duration_since(last) >= self.settings.allow_list_refresh
            });
            if due {
                self.refresh_allow_list(now);
            }
        }

        for lane in &mut self.lanes {
            lane.policy.tick(now);
        }

        if let Some(interval) = self.settings.cleanup_interval {
            let last = *self.last_sweep.get_or_insert(now);
            if now.saturating_duration_since(last) >= interval {
                let removed: usize = self
                    .lanes
                    .iter_mut()
                    .map(|lane| lane.policy.sweep(now))
                    .sum();
                if removed > 0 {
                    log::debug!("Orchestrator: sweep removed {} stale entries", removed);
                }
                self.last_sweep = Some(now);
            }
        }

        self.check_camera_loss(now)
    }

    fn refresh_allow_list(&mut self, now: Instant) {
        match self.api.whitelist() {
            Ok(plates) => {
                self.allow_list.replace_fetched(plates);
                log::info!(
                    "Orchestrator: allow-list refreshed ({} plates)",
                    self.allow_list.len()
                );
            }
            Err(err) => {
                self.allow_list.clear_fetched();
                log::warn!(
                    "Orchestrator: allow-list refresh failed, keeping {} configured plates: {}",
                    self.allow_list.len(),
                    err
                );
            }
        }
        self.last_allow_list_refresh = Some(now);
    }

    fn check_camera_loss(&mut self, now: Instant) -> Result<()> {
        if self.lanes.iter().any(|lane| lane.feed.is_connected()) {
            if self.all_down_since.take().is_some() {
                log::info!("Orchestrator: camera connectivity restored");
            }
            return Ok(());
        }
        let since = *self.all_down_since.get_or_insert_with(|| {
            log::warn!("Orchestrator: no camera is connected");
            now
        });
        let down_for = now.saturating_duration_since(since);
        if down_for > self.settings.camera_loss_budget {
            log::error!(
                "Orchestrator: all cameras down for {:?}, exceeding budget of {:?}",
                down_for,
                self.settings.camera_loss_budget
            );
            return Err(anyhow!(
                "all cameras disconnected for {}s",
                down_for.as_secs()
            ));
        }
        Ok(())
    }

    fn process_frame(
        &mut self,
        index: usize,
        frame: Frame,
        now: Instant,
        report: &mut CycleReport,
    ) {
        let lane = &mut self.lanes[index];
        let camera_id = lane.feed.source_id().to_string();

        if self.settings.roi_enabled && lane.roi.is_none() {
            match RoiGate::for_role(lane.role, frame.width(), frame.height()) {
                Ok(roi) => {
                    log::info!(
                        "Orchestrator: {} ROI set for {}x{} frames",
                        camera_id,
                        frame.width(),
                        frame.height()
                    );
                    lane.roi = Some(roi);
                }
                Err(err) => {
                    log::warn!(
                        "Orchestrator: {} ROI unavailable, admitting all detections: {:#}",
                        camera_id,
                        err
                    );
                    lane.roi = Some(RoiGate::disabled());
                }
            }
        }

        report.frames += 1;
        self.stats.record_frame(now);
        log::debug!(
            "Orchestrator: {} frame {}x{}, {} ms old",
            camera_id,
            frame.width(),
            frame.height(),
            frame.age_ms()
        );

        let boxes = match self.detector.detect(&frame) {
            Ok(boxes) => boxes,
            Err(err) => {
                self.stats.detector_errors += 1;
                log::warn!("Orchestrator: detector failed on {}: {:#}", camera_id, err);
                return;
            }
        };

        for bbox in boxes {
            if bbox.confidence < self.settings.min_confidence {
                continue;
            }
            if let Some(roi) = &lane.roi {
                if !roi.admits(&bbox) {
                    self.stats.roi_rejections += 1;
                    log::debug!(
                        "Orchestrator: plate outside ROI on {} (confidence {:.2})",
                        camera_id,
                        bbox.confidence
                    );
                    continue;
                }
            }
            let Some(crop) = bbox.crop(&frame) else {
                continue;
            };
            let recognition = match self.recognizer.recognize(&crop) {
                Ok(recognition) => recognition,
                Err(err) => {
                    log::warn!("Orchestrator: recognition failed on {}: {:#}", camera_id, err);
                    continue;
                }
            };
            let Some(plate) = plate_from_recognition(&recognition) else {
                continue;
            };

            report.sightings += 1;
            self.stats.sightings += 1;
            let verdict = lane
                .policy
                .observe(&camera_id, &plate, &self.allow_list, now);
            let authorized = match verdict {
                Verdict::Pending => continue,
                Verdict::Confirmed(plate) => {
                    self.stats.confirmations += 1;
                    if is_whitelisted(self.api.as_ref(), &plate) {
                        plate
                    } else {
                        self.stats.denied += 1;
                        continue;
                    }
                }
                Verdict::Granted(plate) => {
                    self.stats.confirmations += 1;
                    plate
                }
            };
            let record = act_on_confirmation(
                self.api.as_ref(),
                &self.dispatcher,
                &mut self.stats,
                lane.role,
                &camera_id,
                authorized,
                &crop,
            );
            report.triggers.push(record);
            if !lane.policy.accepting() {
                break;
            }
        }
    }
}

/// Snapshot upload for enter lanes, then the gate dispatch.
fn act_on_confirmation(
    api: &dyn GateApi,
    dispatcher: &GateActionDispatcher,
    stats: &mut PipelineStats,
    role: CameraRole,
    camera_id: &str,
    plate: PlateText,
    crop: &RgbImage,
) -> TriggerRecord {
    log::info!("{}: {} confirmed at {} camera", camera_id, plate, role);
    let mut snapshot_uploaded = false;
    if role == CameraRole::Enter {
        match encode_jpeg(crop) {
            Ok(jpeg) => match api.upload_plate_snapshot(&jpeg) {
                Ok(status) => {
                    snapshot_uploaded = true;
                    log::info!("{}: snapshot upload returned {}", camera_id, status);
                }
                Err(err) => log::error!("{}: snapshot upload failed: {}", camera_id, err),
            },
            Err(err) => log::error!("{}: snapshot encode failed: {:#}", camera_id, err),
        }
    }

    let outcome = dispatcher.trigger(plate.as_str());
    match &outcome {
        Ok(GateOutcome::Applied) => stats.gate_applied += 1,
        Ok(GateOutcome::AlreadySatisfied) => stats.gate_already_satisfied += 1,
        Err(err) => {
            stats.gate_errors += 1;
            log::error!("{}: gate action for {} failed: {}", camera_id, plate, err);
        }
    }
    TriggerRecord {
        camera_id: camera_id.to_string(),
        role,
        plate,
        snapshot_uploaded,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::detect::{StubDetector, StubRecognizer};
    use std::sync::Mutex;

    struct OneShotFeed {
        id: String,
        frame: Mutex<Option<Frame>>,
        connected: bool,
    }

    impl FrameFeed for OneShotFeed {
        fn source_id(&self) -> &str {
            &self.id
        }

        fn read(&self) -> Option<Frame> {
            self.frame.lock().unwrap().take()
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn stop(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    struct DownApi;

    impl GateApi for DownApi {
        fn whitelist(&self) -> Result<Vec<PlateText>, ApiError> {
            Err(ApiError::new(crate::api::ApiErrorKind::Transport, "down"))
        }
        fn gate_status(&self, _gate_id: &str) -> Result<bool, ApiError> {
            Ok(false)
        }
        fn toggle_gate(&self, _gate_id: &str) -> Result<(), ApiError> {
            Ok(())
        }
        fn upload_plate_snapshot(&self, _jpeg: &[u8]) -> Result<u16, ApiError> {
            Ok(200)
        }
    }

    fn orchestrator(settings: PipelineSettings) -> Orchestrator {
        Orchestrator::new(
            settings,
            Box::new(StubDetector::new()),
            Box::new(StubRecognizer::new(vec!["AB1234C".into()])),
            Arc::new(DownApi),
            AllowList::default(),
        )
    }

    #[test]
    fn total_camera_loss_escalates_after_budget() {
        let mut orchestrator = orchestrator(PipelineSettings {
            camera_loss_budget: Duration::from_secs(120),
            ..PipelineSettings::default()
        });
        orchestrator.add_lane(
            CameraRole::Enter,
            Box::new(OneShotFeed {
                id: "enter".into(),
                frame: Mutex::new(None),
                connected: false,
            }),
        );
        let t0 = Instant::now();
        assert!(orchestrator.run_cycle(t0).is_ok());
        assert!(orchestrator.run_cycle(t0 + Duration::from_secs(120)).is_ok());
        assert!(orchestrator.run_cycle(t0 + Duration::from_secs(121)).is_err());
    }

    #[test]
    fn whitelist_outage_denies_confirmed_plate() -> Result<()> {
        let mut orchestrator = orchestrator(PipelineSettings {
            policy: PolicySettings {
                threshold: 1,
                ..PolicySettings::default()
            },
            ..PipelineSettings::default()
        });
        let frame = Frame::from_rgb(vec![90u8; 64 * 48 * 3], 64, 48, "enter")?;
        orchestrator.add_lane(
            CameraRole::Enter,
            Box::new(OneShotFeed {
                id: "enter".into(),
                frame: Mutex::new(Some(frame)),
                connected: true,
            }),
        );

        let report = orchestrator.run_cycle(Instant::now())?;
        assert_eq!(report.frames, 1);
        assert_eq!(report.sightings, 1);
        assert!(report.triggers.is_empty());
        assert_eq!(orchestrator.stats().denied, 1);
        Ok(())
    }

    #[test]
    fn low_confidence_boxes_are_ignored() -> Result<()> {
        let mut orchestrator = Orchestrator::new(
            PipelineSettings {
                min_confidence: 0.5,
                ..PipelineSettings::default()
            },
            Box::new(StubDetector::with_confidence(0.3)),
            Box::new(StubRecognizer::new(vec!["AB1234C".into()])),
            Arc::new(DownApi),
            AllowList::default(),
        );
        let frame = Frame::from_rgb(vec![90u8; 64 * 48 * 3], 64, 48, "enter")?;
        orchestrator.add_lane(
            CameraRole::Enter,
            Box::new(OneShotFeed {
                id: "enter".into(),
                frame: Mutex::new(Some(frame)),
                connected: true,
            }),
        );

        let report = orchestrator.run_cycle(Instant::now())?;
        assert_eq!(report.frames, 1);
        assert_eq!(report.sightings, 0);
        assert_eq!(orchestrator.stats().roi_rejections, 0);
        Ok(())
    }

    struct WarmUpCounter {
        warm_ups: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl PlateDetector for WarmUpCounter {
        fn name(&self) -> &'static str {
            "warm-up-counter"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<crate::detect::DetectionBox>> {
            Ok(Vec::new())
        }

        fn warm_up(&mut self) -> Result<()> {
            self.warm_ups.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("model not loaded"))
        }
    }

    #[test]
    fn detector_is_warmed_up_once_and_failure_is_not_fatal() -> Result<()> {
        let warm_ups = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut orchestrator = Orchestrator::new(
            PipelineSettings::default(),
            Box::new(WarmUpCounter {
                warm_ups: warm_ups.clone(),
            }),
            Box::new(StubRecognizer::new(Vec::new())),
            Arc::new(DownApi),
            AllowList::default(),
        );
        orchestrator.add_lane(
            CameraRole::Exit,
            Box::new(OneShotFeed {
                id: "exit".into(),
                frame: Mutex::new(None),
                connected: true,
            }),
        );
        orchestrator.run_cycle(Instant::now())?;
        orchestrator.run_cycle(Instant::now())?;
        assert_eq!(warm_ups.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn lanes_without_fresh_frames_are_skipped() -> Result<()> {
        let mut orchestrator = orchestrator(PipelineSettings::default());
        orchestrator.add_lane(
            CameraRole::Exit,
            Box::new(OneShotFeed {
                id: "exit".into(),
                frame: Mutex::new(None),
                connected: true,
            }),
        );
        let report = orchestrator.run_cycle(Instant::now())?;
        assert_eq!(report.frames, 0);
        assert_eq!(orchestrator.stats().frames_processed, 0);
        Ok(())
    }
}
