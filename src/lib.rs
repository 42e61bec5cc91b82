//! Gate Sentry
//!
//! License-plate gate controller: watches the entry and exit cameras of one
//! gate, reads plates, and opens the gate for confirmed, authorised vehicles.
//!
//! # Architecture
//!
//! ```text
//! FrameSource (thread per camera) -> Orchestrator (single loop)
//!     -> PlateDetector -> RoiGate -> PlateRecognizer -> PlateText
//!     -> ConfirmationPolicy (DetectionTracker | AuthorizationStateMachine)
//!     -> GateActionDispatcher -> gate API
//! ```
//!
//! The pipeline holds to a few rules:
//!
//! 1. **Freshest frame only**: each source keeps a single slot; a new frame
//!    replaces an unread one, so the loop never works through a backlog.
//! 2. **Never give up on a camera**: stream failures are retried with backoff
//!    and cooldown. Only sustained loss of every camera stops the daemon.
//! 3. **Debounced decisions**: one-off misreads never move the gate.
//! 4. **Fail closed**: a whitelist outage denies access.
//! 5. **Idempotent actions**: gate state is re-queried before every toggle.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and the `LatestFrame` hand-off slot
//! - `ingest`: stream backends and the `FrameSource` capture thread
//! - `detect`: detector and recogniser boundaries plus backends
//! - `roi`, `plate`: geometric gating and plate text assembly
//! - `tracker`, `auth`, `confirm`: confirmation policies
//! - `api`, `gate`: gate backend client and idempotent dispatch
//! - `pipeline`: the orchestrator
//! - `config`: environment and file configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod confirm;
pub mod detect;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod pipeline;
pub mod plate;
pub mod roi;
pub mod tracker;

pub use api::{ApiError, ApiErrorKind, GateApi, HttpGateApi};
pub use auth::{AllowList, AuthPhase, AuthSettings, AuthorizationStateMachine};
pub use config::GateConfig;
pub use confirm::{ConfirmationPolicy, PolicyKind, PolicySettings, Verdict};
pub use detect::{CharDetection, DetectionBox, PlateDetector, PlateRecognizer, Recognition};
pub use frame::{Frame, LatestFrame};
pub use gate::{GateActionDispatcher, GateCommand, GateError, GateOutcome};
pub use ingest::{FrameSource, ReconnectPolicy, SourceDescriptor, StreamState};
pub use pipeline::{CameraRole, FrameFeed, Orchestrator, PipelineSettings};
pub use plate::PlateText;
pub use roi::{Polygon, RoiGate};
pub use tracker::DetectionTracker;
