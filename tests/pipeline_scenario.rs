use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gate_sentry::api::{ApiError, ApiErrorKind, GateApi};
use gate_sentry::detect::{StubDetector, StubRecognizer};
use gate_sentry::ingest::{FrameSource, ReconnectPolicy, SourceDescriptor};
use gate_sentry::{
    AllowList, CameraRole, DetectionBox, Frame, FrameFeed, GateOutcome, Orchestrator,
    PipelineSettings, PlateDetector, PlateText, PolicyKind, PolicySettings,
};

// ---- fakes ----

#[derive(Default)]
struct ApiCalls {
    whitelist: u32,
    status: u32,
    toggles: u32,
    uploads: Vec<usize>,
}

struct RecordingApi {
    whitelisted: Vec<&'static str>,
    whitelist_down: AtomicBool,
    open: Mutex<bool>,
    calls: Mutex<ApiCalls>,
}

impl RecordingApi {
    fn new(whitelisted: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            whitelisted,
            whitelist_down: AtomicBool::new(false),
            open: Mutex::new(false),
            calls: Mutex::new(ApiCalls::default()),
        })
    }

    fn toggles(&self) -> u32 {
        self.calls.lock().unwrap().toggles
    }

    fn uploads(&self) -> usize {
        self.calls.lock().unwrap().uploads.len()
    }

    fn whitelist_calls(&self) -> u32 {
        self.calls.lock().unwrap().whitelist
    }

    fn set_whitelist_down(&self, down: bool) {
        self.whitelist_down.store(down, Ordering::SeqCst);
    }

    fn close_gate(&self) {
        *self.open.lock().unwrap() = false;
    }
}

impl GateApi for RecordingApi {
    fn whitelist(&self) -> Result<Vec<PlateText>, ApiError> {
        self.calls.lock().unwrap().whitelist += 1;
        if self.whitelist_down.load(Ordering::SeqCst) {
            return Err(ApiError::new(ApiErrorKind::Transport, "connection refused"));
        }
        Ok(self
            .whitelisted
            .iter()
            .filter_map(|p| PlateText::normalize(p))
            .collect())
    }

    fn gate_status(&self, gate_id: &str) -> Result<bool, ApiError> {
        assert_eq!(gate_id, "gate-1");
        self.calls.lock().unwrap().status += 1;
        Ok(*self.open.lock().unwrap())
    }

    fn toggle_gate(&self, _gate_id: &str) -> Result<(), ApiError> {
        self.calls.lock().unwrap().toggles += 1;
        let mut open = self.open.lock().unwrap();
        *open = !*open;
        Ok(())
    }

    fn upload_plate_snapshot(&self, jpeg: &[u8]) -> Result<u16, ApiError> {
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        self.calls.lock().unwrap().uploads.push(jpeg.len());
        Ok(201)
    }
}

/// Feed whose next frame is pushed by the test.
#[derive(Clone)]
struct ManualFeed {
    id: &'static str,
    slot: Arc<Mutex<Option<Frame>>>,
}

impl ManualFeed {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    fn push(&self) {
        let frame = Frame::from_rgb(vec![128u8; 320 * 240 * 3], 320, 240, self.id).unwrap();
        *self.slot.lock().unwrap() = Some(frame);
    }
}

impl FrameFeed for ManualFeed {
    fn source_id(&self) -> &str {
        self.id
    }

    fn read(&self) -> Option<Frame> {
        self.slot.lock().unwrap().take()
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn stop(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Detector that reports a confident plate in the top-left corner.
struct CornerDetector;

impl PlateDetector for CornerDetector {
    fn name(&self) -> &'static str {
        "corner"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectionBox>> {
        Ok(vec![DetectionBox::new(0.0, 0.0, 20.0, 10.0, 0.99)])
    }
}

fn settings(kind: PolicyKind, cleanup_interval: Option<Duration>) -> PipelineSettings {
    PipelineSettings {
        gate_id: "gate-1".into(),
        cleanup_interval,
        policy: PolicySettings {
            kind,
            ..PolicySettings::default()
        },
        ..PipelineSettings::default()
    }
}

fn orchestrator(
    settings: PipelineSettings,
    api: Arc<RecordingApi>,
    script: &[&str],
    allow_list: AllowList,
) -> Orchestrator {
    Orchestrator::new(
        settings,
        Box::new(StubDetector::new()),
        Box::new(StubRecognizer::new(
            script.iter().map(|s| s.to_string()).collect(),
        )),
        api,
        allow_list,
    )
}

// ---- scenarios ----

#[test]
fn enter_plate_triggers_once_at_fifth_sighting() -> Result<()> {
    let api = RecordingApi::new(vec!["AB1234C"]);
    let mut orchestrator = orchestrator(
        settings(PolicyKind::Counter, None),
        api.clone(),
        &["AB1234C"],
        AllowList::default(),
    );
    let feed = ManualFeed::new("enter");
    orchestrator.add_lane(CameraRole::Enter, Box::new(feed.clone()));

    let t0 = Instant::now();
    let mut trigger_cycles = Vec::new();
    for second in 0..8u64 {
        feed.push();
        let report = orchestrator.run_cycle(t0 + Duration::from_secs(second))?;
        assert_eq!(report.sightings, 1);
        for trigger in &report.triggers {
            assert_eq!(trigger.plate.as_str(), "AB1234C");
            assert!(trigger.snapshot_uploaded);
            assert_eq!(trigger.outcome, Ok(GateOutcome::Applied));
            trigger_cycles.push(second);
        }
    }

    assert_eq!(trigger_cycles, vec![4]);
    assert_eq!(api.toggles(), 1);
    assert_eq!(api.uploads(), 1);
    // Whitelist is consulted only on the confirming sighting.
    assert_eq!(api.calls.lock().unwrap().whitelist, 1);
    Ok(())
}

#[test]
fn exit_confirmation_opens_without_snapshot() -> Result<()> {
    let api = RecordingApi::new(vec!["AB1234C"]);
    let mut orchestrator = orchestrator(
        settings(PolicyKind::Counter, None),
        api.clone(),
        &["AB1234C"],
        AllowList::default(),
    );
    let feed = ManualFeed::new("exit");
    orchestrator.add_lane(CameraRole::Exit, Box::new(feed.clone()));

    let t0 = Instant::now();
    for second in 0..5u64 {
        feed.push();
        orchestrator.run_cycle(t0 + Duration::from_secs(second))?;
    }
    assert_eq!(api.toggles(), 1);
    assert_eq!(api.uploads(), 0);
    Ok(())
}

#[test]
fn unlisted_plate_never_moves_gate() -> Result<()> {
    let api = RecordingApi::new(vec!["EL106AC"]);
    let mut orchestrator = orchestrator(
        settings(PolicyKind::Counter, None),
        api.clone(),
        &["AB1234C"],
        AllowList::default(),
    );
    let feed = ManualFeed::new("enter");
    orchestrator.add_lane(CameraRole::Enter, Box::new(feed.clone()));

    let t0 = Instant::now();
    for second in 0..6u64 {
        feed.push();
        orchestrator.run_cycle(t0 + Duration::from_secs(second))?;
    }
    assert_eq!(api.toggles(), 0);
    assert_eq!(api.uploads(), 0);
    assert_eq!(orchestrator.stats().denied, 1);
    Ok(())
}

#[test]
fn sweep_allows_a_later_visit_to_trigger_again() -> Result<()> {
    let api = RecordingApi::new(vec!["AB1234C"]);
    let mut orchestrator = orchestrator(
        settings(PolicyKind::Counter, Some(Duration::from_secs(10))),
        api.clone(),
        &["AB1234C"],
        AllowList::default(),
    );
    let feed = ManualFeed::new("enter");
    orchestrator.add_lane(CameraRole::Enter, Box::new(feed.clone()));

    let t0 = Instant::now();
    for second in 0..5u64 {
        feed.push();
        orchestrator.run_cycle(t0 + Duration::from_secs(second))?;
    }
    assert_eq!(api.toggles(), 1);
    api.close_gate();

    // Idle cycles past the reset window let the sweep evict the plate.
    for second in [20u64, 40, 60] {
        orchestrator.run_cycle(t0 + Duration::from_secs(second))?;
    }

    let t1 = t0 + Duration::from_secs(70);
    let mut triggers = 0;
    for second in 0..5u64 {
        feed.push();
        triggers += orchestrator
            .run_cycle(t1 + Duration::from_secs(second))?
            .triggers
            .len();
    }
    assert_eq!(triggers, 1);
    assert_eq!(api.toggles(), 2);
    Ok(())
}

#[test]
fn open_gate_is_left_alone() -> Result<()> {
    let api = RecordingApi::new(vec!["AB1234C"]);
    *api.open.lock().unwrap() = true;
    let mut orchestrator = orchestrator(
        settings(PolicyKind::Counter, None),
        api.clone(),
        &["AB1234C"],
        AllowList::default(),
    );
    let feed = ManualFeed::new("enter");
    orchestrator.add_lane(CameraRole::Enter, Box::new(feed.clone()));

    let t0 = Instant::now();
    let mut outcomes = Vec::new();
    for second in 0..5u64 {
        feed.push();
        let report = orchestrator.run_cycle(t0 + Duration::from_secs(second))?;
        outcomes.extend(report.triggers.into_iter().map(|t| t.outcome));
    }
    assert_eq!(outcomes, vec![Ok(GateOutcome::AlreadySatisfied)]);
    assert_eq!(api.toggles(), 0);
    Ok(())
}

#[test]
fn detections_outside_roi_are_not_tracked() -> Result<()> {
    let api = RecordingApi::new(vec!["AB1234C"]);
    let mut orchestrator = Orchestrator::new(
        settings(PolicyKind::Counter, None),
        Box::new(CornerDetector),
        Box::new(StubRecognizer::new(vec!["AB1234C".into()])),
        api.clone(),
        AllowList::default(),
    );
    let feed = ManualFeed::new("enter");
    orchestrator.add_lane(CameraRole::Enter, Box::new(feed.clone()));

    let t0 = Instant::now();
    for second in 0..10u64 {
        feed.push();
        let report = orchestrator.run_cycle(t0 + Duration::from_secs(second))?;
        assert_eq!(report.frames, 1);
        assert_eq!(report.sightings, 0);
    }
    assert_eq!(orchestrator.stats().roi_rejections, 10);
    assert_eq!(api.toggles(), 0);
    Ok(())
}

#[test]
fn quorum_policy_grants_fuzzy_match_and_suppresses() -> Result<()> {
    let api = RecordingApi::new(vec!["AB1234C"]);
    let mut orchestrator = orchestrator(
        settings(PolicyKind::Quorum, None),
        api.clone(),
        // One OCR slip among exact reads.
        &["AB1234C", "AB1Z34C", "AB1234C"],
        AllowList::default(),
    );
    let feed = ManualFeed::new("enter");
    orchestrator.add_lane(CameraRole::Enter, Box::new(feed.clone()));

    let t0 = Instant::now();
    let mut granted_at = Vec::new();
    for step in 0..6u64 {
        feed.push();
        let now = t0 + Duration::from_millis(500 * step);
        if !orchestrator.run_cycle(now)?.triggers.is_empty() {
            granted_at.push(step);
        }
    }
    // Quorum of 3 reached on the third read; later frames are suppressed.
    assert_eq!(granted_at, vec![2]);
    assert_eq!(api.toggles(), 1);
    assert_eq!(api.uploads(), 1);
    // Allow-list fetched once on the first cycle.
    assert_eq!(api.calls.lock().unwrap().whitelist, 1);
    Ok(())
}

#[test]
fn quorum_policy_with_api_down_uses_configured_plates_only() -> Result<()> {
    let api = Arc::new(RecordingApi {
        whitelisted: vec!["AB1234C"],
        whitelist_down: AtomicBool::new(true),
        open: Mutex::new(false),
        calls: Mutex::new(ApiCalls::default()),
    });
    let configured = AllowList::new(PlateText::normalize("EL106AC"));
    let mut orchestrator = orchestrator(
        settings(PolicyKind::Quorum, None),
        api.clone(),
        &["AB1234C"],
        configured,
    );
    let feed = ManualFeed::new("enter");
    orchestrator.add_lane(CameraRole::Enter, Box::new(feed.clone()));

    let t0 = Instant::now();
    for step in 0..5u64 {
        feed.push();
        orchestrator.run_cycle(t0 + Duration::from_millis(500 * step))?;
    }
    assert_eq!(api.toggles(), 0);
    assert_eq!(orchestrator.allow_list().len(), 1);
    Ok(())
}

#[test]
fn allow_list_is_refetched_every_minute() -> Result<()> {
    let api = RecordingApi::new(vec!["AB1234C"]);
    let mut orchestrator = orchestrator(
        settings(PolicyKind::Quorum, None),
        api.clone(),
        &["AB1234C"],
        AllowList::default(),
    );
    orchestrator.add_lane(CameraRole::Enter, Box::new(ManualFeed::new("enter")));

    let t0 = Instant::now();
    orchestrator.run_cycle(t0)?;
    assert_eq!(api.whitelist_calls(), 1);
    orchestrator.run_cycle(t0 + Duration::from_secs(30))?;
    orchestrator.run_cycle(t0 + Duration::from_secs(59))?;
    assert_eq!(api.whitelist_calls(), 1);
    orchestrator.run_cycle(t0 + Duration::from_secs(60))?;
    assert_eq!(api.whitelist_calls(), 2);
    orchestrator.run_cycle(t0 + Duration::from_secs(90))?;
    assert_eq!(api.whitelist_calls(), 2);
    orchestrator.run_cycle(t0 + Duration::from_secs(120))?;
    assert_eq!(api.whitelist_calls(), 3);
    Ok(())
}

#[test]
fn failed_refresh_drops_fetched_plates_but_keeps_configured() -> Result<()> {
    let api = RecordingApi::new(vec!["AB1234C"]);
    let configured = AllowList::new(PlateText::normalize("EL106AC"));
    let mut orchestrator = orchestrator(
        settings(PolicyKind::Quorum, None),
        api.clone(),
        &["AB1234C"],
        configured,
    );
    let feed = ManualFeed::new("enter");
    orchestrator.add_lane(CameraRole::Enter, Box::new(feed.clone()));
    let fetched = PlateText::normalize("AB1234C").unwrap();
    let static_plate = PlateText::normalize("EL106AC").unwrap();

    let t0 = Instant::now();
    orchestrator.run_cycle(t0)?;
    assert_eq!(orchestrator.allow_list().len(), 2);
    assert_eq!(orchestrator.allow_list().matches(&fetched), Some(fetched.clone()));

    api.set_whitelist_down(true);
    let t1 = t0 + Duration::from_secs(60);
    orchestrator.run_cycle(t1)?;
    assert_eq!(api.whitelist_calls(), 2);
    assert_eq!(orchestrator.allow_list().len(), 1);
    assert_eq!(orchestrator.allow_list().matches(&fetched), None);
    assert_eq!(
        orchestrator.allow_list().matches(&static_plate),
        Some(static_plate.clone())
    );

    // The previously fetched plate can no longer earn a grant.
    for step in 1..6u64 {
        feed.push();
        orchestrator.run_cycle(t1 + Duration::from_millis(500 * step))?;
    }
    assert_eq!(api.toggles(), 0);
    Ok(())
}

#[test]
fn synthetic_camera_drives_pipeline_end_to_end() -> Result<()> {
    let api = RecordingApi::new(vec!["AB1234C"]);
    let mut orchestrator = orchestrator(
        PipelineSettings {
            policy: PolicySettings {
                threshold: 2,
                ..PolicySettings::default()
            },
            ..settings(PolicyKind::Counter, None)
        },
        api.clone(),
        &["AB1234C"],
        AllowList::default(),
    );
    let descriptor = SourceDescriptor::parse("enter", "stub://enter?width=64&height=48&fps=50")?;
    let source = FrameSource::start(
        descriptor,
        ReconnectPolicy {
            stop_timeout: Duration::from_secs(2),
            ..ReconnectPolicy::default()
        },
    )?;
    orchestrator.add_lane(CameraRole::Enter, Box::new(source));

    let deadline = Instant::now() + Duration::from_secs(5);
    while api.toggles() == 0 && Instant::now() < deadline {
        orchestrator.run_cycle(Instant::now())?;
        std::thread::sleep(Duration::from_millis(5));
    }
    orchestrator.shutdown();

    assert_eq!(api.toggles(), 1);
    assert_eq!(orchestrator.lane_count(), 0);
    Ok(())
}
