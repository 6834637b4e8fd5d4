use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state key {key} holds an unexpected value: {found}")]
    UnexpectedValue { key: String, found: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriceFeedError {
    #[error("price feed is not configured")]
    NotConfigured,
    #[error("price feed returned no prices")]
    Empty,
    #[error("price data unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorError {
    #[error("switch command for {device} failed: {reason}")]
    CommandFailed { device: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstantError {
    #[error("empty time value")]
    Empty,
    #[error("unrecognised time value: {0}")]
    Unparseable(String),
    #[error("local time {0} does not exist in the configured timezone")]
    Nonexistent(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error(transparent)]
    Prices(#[from] PriceFeedError),
    #[error("no price window of {duration_minutes} minutes fits the published prices")]
    NoWindow { duration_minutes: u32 },
    #[error("appliance is already running")]
    AlreadyRunning,
}
