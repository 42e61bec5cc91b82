//! Daemon configuration.
//!
//! Loading order: optional JSON file named by `GATE_CONFIG`, then environment
//! overrides, then validation. Every file field is optional.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::auth::{
    AllowList, AuthSettings, DEFAULT_ACCESS_TIMEOUT, DEFAULT_RECOGNITION_TIMEOUT,
    DEFAULT_REQUIRED_QUORUM,
};
use crate::confirm::{PolicyKind, PolicySettings};
use crate::detect::{
    HttpDetector, HttpRecognizer, InferenceClient, PlateDetector, PlateRecognizer, StubDetector,
    StubRecognizer,
};
use crate::ingest::{ReconnectPolicy, SourceDescriptor};
use crate::pipeline::{
    CameraRole, PipelineSettings, DEFAULT_ALLOW_LIST_REFRESH, DEFAULT_CAMERA_LOSS_BUDGET,
    DEFAULT_CLEANUP_INTERVAL, DEFAULT_MIN_CONFIDENCE,
};
use crate::plate::PlateText;
use crate::tracker::{DEFAULT_RESET_WINDOW, DEFAULT_THRESHOLD};

const DEFAULT_API_URL: &str = "http://api:8080";
const DEFAULT_API_TIMEOUT_MS: u64 = 5000;
const WEBCAM_ENTER_INDEX: &str = "0";
const WEBCAM_EXIT_INDEX: &str = "1";

#[derive(Debug, Deserialize, Default)]
struct GateConfigFile {
    api_url: Option<String>,
    gate_id: Option<String>,
    api_timeout_ms: Option<u64>,
    cameras: Option<CamerasFile>,
    detection: Option<DetectionFile>,
    policy: Option<PolicyFile>,
    detector: Option<DetectorFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CamerasFile {
    enter_url: Option<String>,
    exit_url: Option<String>,
    use_webcam: Option<bool>,
    loss_budget_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionFile {
    threshold: Option<u32>,
    counter_reset_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    min_confidence: Option<f32>,
    roi_enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyFile {
    kind: Option<String>,
    required_quorum: Option<u32>,
    recognition_timeout_secs: Option<u64>,
    access_timeout_secs: Option<u64>,
    allowed_plates: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorFile {
    backend: Option<String>,
    url: Option<String>,
    stub_plates: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorBackendKind {
    Stub,
    Http,
}

impl FromStr for DetectorBackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(DetectorBackendKind::Stub),
            "http" => Ok(DetectorBackendKind::Http),
            other => Err(anyhow!(
                "unknown detector backend '{}'; expected stub or http",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorBackendKind,
    pub url: Option<String>,
    /// Plates the stub recogniser reads, in order.
    pub stub_plates: Vec<String>,
    pub min_confidence: f32,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub api_url: String,
    pub gate_id: String,
    pub api_timeout: Duration,
    pub enter_url: Option<String>,
    pub exit_url: Option<String>,
    pub use_webcam: bool,
    pub camera_loss_budget: Duration,
    pub threshold: u32,
    pub counter_reset: Duration,
    /// `None` disables the sweep.
    pub cleanup_interval: Option<Duration>,
    pub roi_enabled: bool,
    pub policy: PolicyKind,
    pub required_quorum: u32,
    pub recognition_timeout: Duration,
    pub access_timeout: Duration,
    pub allowed_plates: Vec<PlateText>,
    pub detector: DetectorSettings,
    pub reconnect: ReconnectPolicy,
}

impl GateConfig {
    pub fn load() -> Result<Self> {
        let config_path = env_string("GATE_CONFIG");
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load with an explicit config file path (overrides `GATE_CONFIG`).
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GateConfigFile) -> Result<Self> {
        let cameras = file.cameras.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let policy = file.policy.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();

        let cleanup_interval = match detection.cleanup_interval_secs {
            Some(secs) => interval_from_secs(secs),
            None => Some(DEFAULT_CLEANUP_INTERVAL),
        };
        Ok(Self {
            api_url: file.api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            gate_id: file.gate_id.unwrap_or_default(),
            api_timeout: Duration::from_millis(
                file.api_timeout_ms.unwrap_or(DEFAULT_API_TIMEOUT_MS),
            ),
            enter_url: cameras.enter_url,
            exit_url: cameras.exit_url,
            use_webcam: cameras.use_webcam.unwrap_or(false),
            camera_loss_budget: cameras
                .loss_budget_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CAMERA_LOSS_BUDGET),
            threshold: detection.threshold.unwrap_or(DEFAULT_THRESHOLD),
            counter_reset: detection
                .counter_reset_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RESET_WINDOW),
            cleanup_interval,
            roi_enabled: detection.roi_enabled.unwrap_or(true),
            policy: match policy.kind.as_deref() {
                Some(kind) => kind.parse()?,
                None => PolicyKind::Counter,
            },
            required_quorum: policy.required_quorum.unwrap_or(DEFAULT_REQUIRED_QUORUM),
            recognition_timeout: policy
                .recognition_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RECOGNITION_TIMEOUT),
            access_timeout: policy
                .access_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_ACCESS_TIMEOUT),
            allowed_plates: normalize_plates(policy.allowed_plates.unwrap_or_default()),
            detector: DetectorSettings {
                backend: match detector.backend.as_deref() {
                    Some(backend) => backend.parse()?,
                    None => DetectorBackendKind::Stub,
                },
                url: detector.url,
                stub_plates: detector.stub_plates.unwrap_or_default(),
                min_confidence: detection.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
            },
            reconnect: ReconnectPolicy::default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("API_URL") {
            self.api_url = url;
        }
        if let Some(gate_id) = env_string("GATE_ID") {
            self.gate_id = gate_id;
        }
        if let Some(ms) = env_parse::<u64>("API_TIMEOUT_MS")? {
            self.api_timeout = Duration::from_millis(ms);
        }
        if let Some(url) = env_string("CAM_ENTER_URL") {
            self.enter_url = Some(url);
        }
        if let Some(url) = env_string("CAM_EXIT_URL") {
            self.exit_url = Some(url);
        }
        if let Some(use_webcam) = env_bool("USE_WEBCAM")? {
            self.use_webcam = use_webcam;
        }
        if let Some(secs) = env_parse::<u64>("CAMERA_LOSS_BUDGET_SECS")? {
            self.camera_loss_budget = Duration::from_secs(secs);
        }
        if let Some(threshold) = env_parse::<u32>("DETECTION_THRESHOLD")? {
            self.threshold = threshold;
        }
        if let Some(secs) = env_parse::<u64>("COUNTER_RESET_SECS")? {
            self.counter_reset = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CLEANUP_INTERVAL_SECS")? {
            self.cleanup_interval = interval_from_secs(secs);
        }
        if let Some(enabled) = env_bool("ROI_ENABLED")? {
            self.roi_enabled = enabled;
        }
        if let Some(kind) = env_string("CONFIRMATION_POLICY") {
            self.policy = kind.parse()?;
        }
        if let Some(quorum) = env_parse::<u32>("REQUIRED_QUORUM")? {
            self.required_quorum = quorum;
        }
        if let Some(secs) = env_parse::<u64>("RECOGNITION_TIMEOUT_SECS")? {
            self.recognition_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("ACCESS_TIMEOUT_SECS")? {
            self.access_timeout = Duration::from_secs(secs);
        }
        if let Some(plates) = env_string("ALLOWED_PLATES") {
            self.allowed_plates = normalize_plates(split_csv(&plates));
        }
        if let Some(backend) = env_string("DETECTOR_BACKEND") {
            self.detector.backend = backend.parse()?;
        }
        if let Some(url) = env_string("DETECTOR_URL") {
            self.detector.url = Some(url);
        }
        if let Some(plates) = env_string("STUB_PLATES") {
            self.detector.stub_plates = split_csv(&plates);
        }
        if let Some(confidence) = env_parse::<f32>("MIN_DETECTION_CONFIDENCE")? {
            self.detector.min_confidence = confidence;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        validate_gate_id(&self.gate_id)?;

        let api_url = url::Url::parse(&self.api_url)
            .map_err(|e| anyhow!("API_URL '{}' is not a valid url: {}", self.api_url, e))?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(anyhow!("API_URL must use http or https"));
        }
        self.api_url = self.api_url.trim_end_matches('/').to_string();

        if self.api_timeout.is_zero() {
            return Err(anyhow!("API_TIMEOUT_MS must be greater than zero"));
        }
        if self.threshold == 0 {
            return Err(anyhow!("DETECTION_THRESHOLD must be at least 1"));
        }
        if self.required_quorum == 0 {
            return Err(anyhow!("REQUIRED_QUORUM must be at least 1"));
        }
        if self.counter_reset.is_zero() {
            return Err(anyhow!("COUNTER_RESET_SECS must be greater than zero"));
        }
        if self.recognition_timeout.is_zero() || self.access_timeout.is_zero() {
            return Err(anyhow!(
                "RECOGNITION_TIMEOUT_SECS and ACCESS_TIMEOUT_SECS must be greater than zero"
            ));
        }
        if self.camera_loss_budget.is_zero() {
            return Err(anyhow!("CAMERA_LOSS_BUDGET_SECS must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            return Err(anyhow!("MIN_DETECTION_CONFIDENCE must be within 0.0..=1.0"));
        }
        if self.detector.backend == DetectorBackendKind::Http && self.detector.url.is_none() {
            return Err(anyhow!("DETECTOR_BACKEND=http requires DETECTOR_URL"));
        }

        let sources = self.camera_sources()?;
        if sources.is_empty() {
            return Err(anyhow!(
                "no camera configured; set CAM_ENTER_URL, CAM_EXIT_URL, or USE_WEBCAM=true"
            ));
        }
        Ok(())
    }

    /// Configured cameras. `USE_WEBCAM` replaces both stream URLs with local
    /// devices 0 (enter) and 1 (exit).
    pub fn camera_sources(&self) -> Result<Vec<(CameraRole, SourceDescriptor)>> {
        let (enter, exit) = if self.use_webcam {
            (
                Some(WEBCAM_ENTER_INDEX.to_string()),
                Some(WEBCAM_EXIT_INDEX.to_string()),
            )
        } else {
            (self.enter_url.clone(), self.exit_url.clone())
        };
        let mut sources = Vec::new();
        if let Some(location) = enter {
            sources.push((
                CameraRole::Enter,
                SourceDescriptor::parse(CameraRole::Enter.as_str(), &location)?,
            ));
        }
        if let Some(location) = exit {
            sources.push((
                CameraRole::Exit,
                SourceDescriptor::parse(CameraRole::Exit.as_str(), &location)?,
            ));
        }
        Ok(sources)
    }

    pub fn policy_settings(&self) -> PolicySettings {
        PolicySettings {
            kind: self.policy,
            threshold: self.threshold,
            reset_window: self.counter_reset,
            auth: AuthSettings {
                required_quorum: self.required_quorum,
                recognition_timeout: self.recognition_timeout,
                access_timeout: self.access_timeout,
            },
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            gate_id: self.gate_id.clone(),
            roi_enabled: self.roi_enabled,
            min_confidence: self.detector.min_confidence,
            cleanup_interval: self.cleanup_interval,
            allow_list_refresh: DEFAULT_ALLOW_LIST_REFRESH,
            camera_loss_budget: self.camera_loss_budget,
            policy: self.policy_settings(),
        }
    }

    pub fn allow_list(&self) -> AllowList {
        AllowList::new(self.allowed_plates.iter().cloned())
    }

    /// Detector and recogniser for the configured backend.
    pub fn build_detector(&self) -> Result<(Box<dyn PlateDetector>, Box<dyn PlateRecognizer>)> {
        match self.detector.backend {
            DetectorBackendKind::Stub => Ok((
                Box::new(StubDetector::new()),
                Box::new(StubRecognizer::new(self.detector.stub_plates.clone())),
            )),
            DetectorBackendKind::Http => {
                let url = self
                    .detector
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow!("DETECTOR_URL is not set"))?;
                let client = InferenceClient::new(url, self.api_timeout)?;
                Ok((
                    Box::new(HttpDetector::new(client.clone())),
                    Box::new(HttpRecognizer::new(client)),
                ))
            }
        }
    }
}

pub fn validate_gate_id(gate_id: &str) -> Result<()> {
    static GATE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = GATE_ID_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());
    if gate_id.is_empty() {
        return Err(anyhow!("GATE_ID is required"));
    }
    if !re.is_match(gate_id) {
        return Err(anyhow!("GATE_ID must match ^[A-Za-z0-9_-]{{1,64}}$"));
    }
    Ok(())
}

fn interval_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn normalize_plates(plates: Vec<String>) -> Vec<PlateText> {
    plates
        .iter()
        .filter_map(|plate| {
            let normalized = PlateText::normalize(plate);
            if normalized.is_none() {
                log::warn!("GateConfig: ignoring empty allowed plate '{}'", plate);
            }
            normalized
        })
        .collect()
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has invalid value '{}'", key, value)),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match env_string(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(None),
        Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some("0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(other) => Err(anyhow!("{} must be true or false, got '{}'", key, other)),
    }
}

fn read_config_file(path: &Path) -> Result<GateConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_id_pattern() {
        assert!(validate_gate_id("gate-01_A").is_ok());
        assert!(validate_gate_id("").is_err());
        assert!(validate_gate_id("gate/../1").is_err());
        assert!(validate_gate_id(&"g".repeat(65)).is_err());
    }

    #[test]
    fn file_defaults_match_deployment() -> Result<()> {
        let cfg = GateConfig::from_file(GateConfigFile::default())?;
        assert_eq!(cfg.api_url, "http://api:8080");
        assert_eq!(cfg.threshold, 5);
        assert_eq!(cfg.counter_reset, Duration::from_secs(30));
        assert_eq!(cfg.cleanup_interval, Some(Duration::from_secs(10)));
        assert_eq!(cfg.policy, PolicyKind::Counter);
        assert_eq!(cfg.required_quorum, 3);
        assert!(cfg.roi_enabled);
        assert_eq!(cfg.detector.backend, DetectorBackendKind::Stub);
        assert_eq!(cfg.detector.min_confidence, 0.5);
        assert_eq!(cfg.camera_loss_budget, Duration::from_secs(120));
        assert_eq!(cfg.recognition_timeout, Duration::from_secs(5));
        assert_eq!(cfg.access_timeout, Duration::from_secs(10));
        assert_eq!(cfg.reconnect.max_reconnect_attempts, 10);
        Ok(())
    }

    #[test]
    fn file_defaults_agree_with_component_defaults() -> Result<()> {
        let cfg = GateConfig::from_file(GateConfigFile::default())?;
        let policy = cfg.policy_settings();
        let component = PolicySettings::default();
        assert_eq!(policy.threshold, component.threshold);
        assert_eq!(policy.reset_window, component.reset_window);
        assert_eq!(policy.auth.required_quorum, component.auth.required_quorum);
        assert_eq!(
            policy.auth.recognition_timeout,
            component.auth.recognition_timeout
        );
        assert_eq!(policy.auth.access_timeout, component.auth.access_timeout);

        let pipeline = cfg.pipeline_settings();
        let defaults = PipelineSettings::default();
        assert_eq!(pipeline.min_confidence, defaults.min_confidence);
        assert_eq!(pipeline.cleanup_interval, defaults.cleanup_interval);
        assert_eq!(pipeline.camera_loss_budget, defaults.camera_loss_budget);
        Ok(())
    }

    #[test]
    fn zero_cleanup_interval_disables_sweep() {
        assert_eq!(interval_from_secs(0), None);
        assert_eq!(interval_from_secs(3), Some(Duration::from_secs(3)));
    }

    #[test]
    fn webcam_mode_uses_local_devices() -> Result<()> {
        let mut cfg = GateConfig::from_file(GateConfigFile::default())?;
        cfg.enter_url = Some("rtsp://10.0.0.2/h264".into());
        cfg.use_webcam = true;
        let sources = cfg.camera_sources()?;
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].1.location, "0");
        assert_eq!(sources[1].0, CameraRole::Exit);
        assert_eq!(sources[1].1.location, "1");
        Ok(())
    }
}
