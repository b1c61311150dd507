//! Persisted records and request payloads.
//!
//! Both records are plain data. All mutation goes through the
//! [`Coordinator`](crate::Coordinator), which applies the rules in
//! [`lifecycle`](crate::lifecycle).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoordinatorError;

/// Key of the one-and-only machine state record.
pub const MACHINE_STATE_KEY: &str = "main";

/// Identifier of a production batch.
pub type BatchId = Uuid;

/// Binary sufficiency flag for a consumable supply.
///
/// Encoded on the wire as `0` (low) or `1` (sufficient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SupplyLevel {
    Low,
    #[default]
    Sufficient,
}

impl SupplyLevel {
    pub fn is_low(self) -> bool {
        self == Self::Low
    }
}

impl TryFrom<u8> for SupplyLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Sufficient),
            other => Err(format!("supply level must be 0 or 1, got {other}")),
        }
    }
}

impl From<SupplyLevel> for u8 {
    fn from(level: SupplyLevel) -> Self {
        match level {
            SupplyLevel::Low => 0,
            SupplyLevel::Sufficient => 1,
        }
    }
}

impl fmt::Display for SupplyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => f.write_str("low"),
            Self::Sufficient => f.write_str("sufficient"),
        }
    }
}

/// Snapshot of both supply sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Supplies {
    pub soil: SupplyLevel,
    pub cup: SupplyLevel,
}

impl Supplies {
    pub fn new(soil: SupplyLevel, cup: SupplyLevel) -> Self {
        Self { soil, cup }
    }

    /// True when neither supply reads low.
    pub fn is_sufficient(&self) -> bool {
        !self.soil.is_low() && !self.cup.is_low()
    }
}

impl fmt::Display for Supplies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "soil {}, cups {}", self.soil, self.cup)
    }
}

/// Status of a batch.
///
/// `Ongoing` is the only initial state; `Finished` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Ongoing,
    Paused,
    Finished,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ongoing => "Ongoing",
            Self::Paused => "Paused",
            Self::Finished => "Finished",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ongoing" => Ok(Self::Ongoing),
            "Paused" => Ok(Self::Paused),
            "Finished" => Ok(Self::Finished),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

/// One production run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: BatchId,
    pub title: String,
    pub seed_type: u32,
    pub output_count: u32,
    pub pots_done_count: u32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    /// Build a fresh batch, already running, from a validated request.
    pub fn start(new: NewBatch) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: new.title,
            seed_type: new.seed_type,
            output_count: new.output_count,
            pots_done_count: 0,
            status: BatchStatus::Ongoing,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Process-wide machine record: supply levels and the active batch, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineState {
    #[serde(default = "default_state_key")]
    pub singleton_key: String,
    pub soil_level: SupplyLevel,
    pub cup_level: SupplyLevel,
    /// Lookup key of the running batch. Never an ownership edge.
    pub active_batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_state_key() -> String {
    MACHINE_STATE_KEY.to_owned()
}

impl Default for MachineState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            singleton_key: default_state_key(),
            soil_level: SupplyLevel::Sufficient,
            cup_level: SupplyLevel::Sufficient,
            active_batch_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl MachineState {
    pub fn supplies(&self) -> Supplies {
        Supplies::new(self.soil_level, self.cup_level)
    }

    /// Apply whichever levels are present. Returns true if anything changed.
    pub fn apply_reading(&mut self, reading: SupplyReading) -> bool {
        let before = self.supplies();
        if let Some(soil) = reading.soil_level {
            self.soil_level = soil;
        }
        if let Some(cup) = reading.cup_level {
            self.cup_level = cup;
        }
        self.supplies() != before
    }

    pub fn is_active(&self, id: BatchId) -> bool {
        self.active_batch_id == Some(id)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Dashboard view of the machine: the record plus derived flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(flatten)]
    pub state: MachineState,
    pub is_batch_active: bool,
    pub are_supplies_low: bool,
}

impl From<MachineState> for MachineStatus {
    fn from(state: MachineState) -> Self {
        Self {
            is_batch_active: state.active_batch_id.is_some(),
            are_supplies_low: !state.supplies().is_sufficient(),
            state,
        }
    }
}

/// Request to start a new batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBatch {
    pub title: String,
    pub seed_type: u32,
    pub output_count: u32,
}

impl NewBatch {
    pub fn new(title: impl Into<String>, seed_type: u32, output_count: u32) -> Self {
        Self {
            title: title.into(),
            seed_type,
            output_count,
        }
    }

    /// Trim the title and reject blank titles or an empty target.
    pub fn validate(mut self) -> Result<Self, CoordinatorError> {
        let trimmed = self.title.trim();
        if trimmed.is_empty() {
            return Err(CoordinatorError::InvalidInput(
                "title must not be blank".into(),
            ));
        }
        if self.output_count == 0 {
            return Err(CoordinatorError::InvalidInput(
                "outputCount must be at least 1".into(),
            ));
        }
        if trimmed.len() != self.title.len() {
            self.title = trimmed.to_owned();
        }
        Ok(self)
    }
}

/// Partial sensor update. Absent fields are left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplyReading {
    #[serde(default)]
    pub soil_level: Option<SupplyLevel>,
    #[serde(default)]
    pub cup_level: Option<SupplyLevel>,
}

impl SupplyReading {
    pub fn soil(level: SupplyLevel) -> Self {
        Self {
            soil_level: Some(level),
            cup_level: None,
        }
    }

    pub fn cup(level: SupplyLevel) -> Self {
        Self {
            soil_level: None,
            cup_level: Some(level),
        }
    }

    pub fn both(soil: SupplyLevel, cup: SupplyLevel) -> Self {
        Self {
            soil_level: Some(soil),
            cup_level: Some(cup),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.soil_level.is_none() && self.cup_level.is_none()
    }
}

/// Progress report from the controller, optionally carrying sensor levels
/// sampled at the same moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    #[serde(default)]
    pub pots_increment: Option<u32>,
    #[serde(flatten)]
    pub reading: SupplyReading,
}

impl ProgressReport {
    pub fn pots(increment: u32) -> Self {
        Self {
            pots_increment: Some(increment),
            reading: SupplyReading::default(),
        }
    }

    pub fn with_reading(mut self, reading: SupplyReading) -> Self {
        self.reading = reading;
        self
    }

    /// The increment, which must be present and positive.
    pub fn increment(&self) -> Result<u32, CoordinatorError> {
        match self.pots_increment {
            Some(n) if n > 0 => Ok(n),
            Some(_) => Err(CoordinatorError::InvalidInput(
                "potsIncrement must be positive".into(),
            )),
            None => Err(CoordinatorError::InvalidInput(
                "potsIncrement is required".into(),
            )),
        }
    }
}
