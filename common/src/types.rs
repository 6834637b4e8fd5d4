use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
    #[serde(rename = "unitPrice")]
    pub unit_price: f64,
}

impl PricePoint {
    pub fn new(starts_at: DateTime<Utc>, unit_price: f64) -> Self {
        Self {
            starts_at,
            unit_price,
        }
    }
}

/// A contiguous stretch of time and its time-weighted average price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(rename = "avgPrice")]
    pub avg_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionPhase {
    Idle,
    Confirming,
    Running,
    EndGrace,
    PostConfirm,
}

impl DetectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Confirming => "CONFIRMING",
            Self::Running => "RUNNING",
            Self::EndGrace => "END_GRACE",
            Self::PostConfirm => "POST_CONFIRM",
        }
    }

    /// True for every phase in which the appliance counts as running.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::EndGrace | Self::PostConfirm)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub name: String,
    pub kind: &'static str,
    pub phase: &'static str,
    pub running: bool,
    pub scheduled: bool,
    #[serde(rename = "startTime")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "lastPowerW")]
    pub last_power_w: Option<f64>,
    #[serde(rename = "runtimeMin")]
    pub runtime_min: u64,
    #[serde(rename = "inCooldown")]
    pub in_cooldown: bool,
    #[serde(rename = "cooldownRemainingMs")]
    pub cooldown_remaining_ms: u64,
    #[serde(rename = "automaticStartInProgress")]
    pub automatic_start_in_progress: bool,
    #[serde(rename = "armedTimers")]
    pub armed_timers: Vec<&'static str>,
}
