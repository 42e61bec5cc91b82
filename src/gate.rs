//! Idempotent gate actions.
//!
//! The gate state is re-queried before every action and never cached. When the
//! gate already is where the command would put it, nothing is sent. Failures are
//! reported to the caller and never retried: a blind retry can double-cycle the
//! motor.

use std::fmt;
use std::sync::Arc;

use crate::api::{ApiError, GateApi};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateCommand {
    Open,
    Close,
}

impl GateCommand {
    fn wants_open(self) -> bool {
        matches!(self, GateCommand::Open)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    /// The toggle was sent.
    Applied,
    /// The gate was already in the commanded state; nothing was sent.
    AlreadySatisfied,
}

/// Which step of a dispatch failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateError {
    Status(ApiError),
    Toggle(ApiError),
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::Status(err) => write!(f, "gate status query failed: {}", err),
            GateError::Toggle(err) => write!(f, "gate toggle failed: {}", err),
        }
    }
}

impl std::error::Error for GateError {}

pub struct GateActionDispatcher {
    api: Arc<dyn GateApi>,
    gate_id: String,
}

impl GateActionDispatcher {
    pub fn new(api: Arc<dyn GateApi>, gate_id: &str) -> Self {
        Self {
            api,
            gate_id: gate_id.to_string(),
        }
    }

    pub fn gate_id(&self) -> &str {
        &self.gate_id
    }

    /// Open the gate for `identity` (a plate or operator label, used in logs).
    pub fn trigger(&self, identity: &str) -> Result<GateOutcome, GateError> {
        self.dispatch(GateCommand::Open, identity)
    }

    pub fn dispatch(&self, command: GateCommand, identity: &str) -> Result<GateOutcome, GateError> {
        let is_open = self
            .api
            .gate_status(&self.gate_id)
            .map_err(GateError::Status)?;
        if is_open == command.wants_open() {
            log::info!(
                "Gate {}: already {} for {}",
                self.gate_id,
                if is_open { "open" } else { "closed" },
                identity
            );
            return Ok(GateOutcome::AlreadySatisfied);
        }
        self.api
            .toggle_gate(&self.gate_id)
            .map_err(GateError::Toggle)?;
        log::info!(
            "Gate {}: {} for {}",
            self.gate_id,
            if command.wants_open() { "opening" } else { "closing" },
            identity
        );
        Ok(GateOutcome::Applied)
    }
}
