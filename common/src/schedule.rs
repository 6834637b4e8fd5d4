//! Scheduled start of one appliance.
//!
//! The persisted pair `(<id>.scheduled, <id>.startTime)` is the source of truth.
//! The manager keeps at most one `ScheduledStart` timer armed for it and brings
//! the two back in line after restarts and operator edits.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    config::ScheduleConfig,
    error::ActuatorError,
    instant::{format_instant, format_local, parse_instant},
    ports::Notifier,
    store::{self, Origin, StateChange, StateField, StateStore},
    timers::{TimerSlot, TimerTable},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Unchanged,
    Armed(DateTime<Utc>),
    /// Start time accepted without arming anything.
    Stored(DateTime<Utc>),
    Started,
    StartFailed(String),
    Cancelled,
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct ScheduleManager {
    device: String,
    name: String,
    config: ScheduleConfig,
    timezone: Tz,
    // Last start time this manager accepted, used to undo rejected edits.
    accepted_start: Option<DateTime<Utc>>,
}

impl ScheduleManager {
    pub fn new(device: &str, name: &str, mut config: ScheduleConfig, timezone: Tz) -> Self {
        config.sanitize();
        Self {
            device: device.to_string(),
            name: name.to_string(),
            config,
            timezone,
            accepted_start: None,
        }
    }

    pub fn is_scheduled(&self, store: &dyn StateStore) -> bool {
        store::read_bool(store, &self.key(StateField::Scheduled)).unwrap_or_else(|err| {
            warn!("{}: could not read scheduled flag: {err}", self.device);
            false
        })
    }

    pub fn start_time(&self, store: &dyn StateStore) -> Option<DateTime<Utc>> {
        self.read_start_time(store).ok().flatten()
    }

    pub fn schedule_at<F>(
        &mut self,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
        store: &mut dyn StateStore,
        timers: &mut TimerTable,
        start: F,
    ) -> ScheduleOutcome
    where
        F: FnOnce(DateTime<Utc>, &mut TimerTable) -> Result<(), ActuatorError>,
    {
        self.persist_start_time(store, Some(at));
        self.persist_scheduled(store, true);
        self.arm_or_start(at, now, store, timers, start)
    }

    /// Returns false if there was nothing to cancel.
    pub fn cancel(
        &mut self,
        notify: bool,
        store: &mut dyn StateStore,
        timers: &mut TimerTable,
        notifier: &mut dyn Notifier,
    ) -> bool {
        let disarmed = timers.cancel(TimerSlot::ScheduledStart);
        let persisted = store::read_bool(store, &self.key(StateField::Scheduled))
            .unwrap_or_else(|err| {
                warn!("{}: could not read scheduled flag: {err}", self.device);
                true
            });

        if !disarmed && !persisted {
            return false;
        }

        info!("{}: scheduled start cancelled", self.device);
        self.persist_scheduled(store, false);
        if notify {
            notifier.notify(&format!("Scheduled start of {} cancelled.", self.name));
        }
        true
    }

    pub fn restore_on_startup<F>(
        &mut self,
        now: DateTime<Utc>,
        store: &mut dyn StateStore,
        timers: &mut TimerTable,
        notifier: &mut dyn Notifier,
        start: F,
    ) -> ScheduleOutcome
    where
        F: FnOnce(DateTime<Utc>, &mut TimerTable) -> Result<(), ActuatorError>,
    {
        // Remembered even when nothing is scheduled, so a rejected edit can
        // put the persisted value back.
        if let Ok(Some(at)) = self.read_start_time(store) {
            self.accepted_start = Some(at);
        }
        if !self.is_scheduled(store) {
            return ScheduleOutcome::Unchanged;
        }

        let at = match self.read_start_time(store) {
            Ok(Some(at)) => at,
            Ok(None) => {
                return self.cancel_with_warning(
                    "no start time was stored",
                    store,
                    timers,
                    notifier,
                );
            }
            Err(reason) => return self.cancel_with_warning(&reason, store, timers, notifier),
        };
        self.accepted_start = Some(at);

        if at > now && at - now >= self.horizon() {
            warn!("{}: persisted start {at} is implausibly far out", self.device);
            timers.cancel(TimerSlot::ScheduledStart);
            self.persist_scheduled(store, false);
            notifier.notify(&format!(
                "Stale scheduled start of {} for {} cancelled.",
                self.name,
                format_local(at, self.timezone)
            ));
            return ScheduleOutcome::Cancelled;
        }

        if at <= now {
            info!("{}: scheduled start elapsed while offline", self.device);
        }
        self.arm_or_start(at, now, store, timers, start)
    }

    pub fn on_manual_edit<F>(
        &mut self,
        change: &StateChange,
        now: DateTime<Utc>,
        store: &mut dyn StateStore,
        timers: &mut TimerTable,
        notifier: &mut dyn Notifier,
        start: F,
    ) -> ScheduleOutcome
    where
        F: FnOnce(DateTime<Utc>, &mut TimerTable) -> Result<(), ActuatorError>,
    {
        if change.origin == Origin::System {
            return ScheduleOutcome::Unchanged;
        }

        match change.field {
            StateField::StartTime => {
                let raw = value_text(&change.value);
                let at = match parse_instant(&raw, self.timezone) {
                    Ok(at) => at,
                    Err(err) => {
                        warn!("{}: rejected start time {raw:?}: {err}", self.device);
                        self.persist_start_time(store, self.accepted_start);
                        notifier.notify(&format!(
                            "Start time '{raw}' for {} rejected: {err}.",
                            self.name
                        ));
                        return ScheduleOutcome::Rejected(err.to_string());
                    }
                };

                self.persist_start_time(store, Some(at));
                if timers.is_armed(TimerSlot::ScheduledStart) || self.is_scheduled(store) {
                    self.arm_or_start(at, now, store, timers, start)
                } else {
                    debug!("{}: start time stored, not scheduled", self.device);
                    ScheduleOutcome::Stored(at)
                }
            }
            StateField::Scheduled => match value_flag(&change.value) {
                Some(true) => self.enable_from_edit(now, store, timers, notifier, start),
                Some(false) => {
                    if self.cancel(true, store, timers, notifier) {
                        ScheduleOutcome::Cancelled
                    } else {
                        self.persist_scheduled(store, false);
                        ScheduleOutcome::Unchanged
                    }
                }
                None => {
                    let armed = timers.is_armed(TimerSlot::ScheduledStart);
                    warn!("{}: rejected scheduled value {}", self.device, change.value);
                    self.persist_scheduled(store, armed);
                    ScheduleOutcome::Rejected(format!("not a flag: {}", change.value))
                }
            },
            StateField::Running => ScheduleOutcome::Unchanged,
        }
    }

    /// Runs the start for a fired `ScheduledStart` timer.
    pub fn on_timer<F>(
        &mut self,
        now: DateTime<Utc>,
        store: &mut dyn StateStore,
        timers: &mut TimerTable,
        start: F,
    ) -> ScheduleOutcome
    where
        F: FnOnce(DateTime<Utc>, &mut TimerTable) -> Result<(), ActuatorError>,
    {
        info!("{}: scheduled start due", self.device);
        self.run_start(now, store, timers, start)
    }

    fn enable_from_edit<F>(
        &mut self,
        now: DateTime<Utc>,
        store: &mut dyn StateStore,
        timers: &mut TimerTable,
        notifier: &mut dyn Notifier,
        start: F,
    ) -> ScheduleOutcome
    where
        F: FnOnce(DateTime<Utc>, &mut TimerTable) -> Result<(), ActuatorError>,
    {
        if timers.is_armed(TimerSlot::ScheduledStart) {
            self.persist_scheduled(store, true);
            return ScheduleOutcome::Unchanged;
        }

        match self.read_start_time(store) {
            Ok(Some(at)) => {
                self.accepted_start = Some(at);
                self.persist_scheduled(store, true);
                self.arm_or_start(at, now, store, timers, start)
            }
            Ok(None) | Err(_) => {
                warn!("{}: cannot schedule without a valid start time", self.device);
                self.persist_scheduled(store, false);
                notifier.notify(&format!(
                    "{} cannot be scheduled: set a valid start time first.",
                    self.name
                ));
                ScheduleOutcome::Rejected("no valid start time".to_string())
            }
        }
    }

    fn arm_or_start<F>(
        &mut self,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
        store: &mut dyn StateStore,
        timers: &mut TimerTable,
        start: F,
    ) -> ScheduleOutcome
    where
        F: FnOnce(DateTime<Utc>, &mut TimerTable) -> Result<(), ActuatorError>,
    {
        timers.cancel(TimerSlot::ScheduledStart);
        if at <= now {
            return self.run_start(now, store, timers, start);
        }

        timers.arm(TimerSlot::ScheduledStart, at);
        info!(
            "{}: start armed for {} (in {} min)",
            self.device,
            format_instant(at),
            (at - now).num_minutes()
        );
        ScheduleOutcome::Armed(at)
    }

    fn run_start<F>(
        &mut self,
        now: DateTime<Utc>,
        store: &mut dyn StateStore,
        timers: &mut TimerTable,
        start: F,
    ) -> ScheduleOutcome
    where
        F: FnOnce(DateTime<Utc>, &mut TimerTable) -> Result<(), ActuatorError>,
    {
        let result = start(now, timers);
        // Cleared whether or not the start worked, so nothing stays armed
        // for an action that did not happen.
        self.persist_scheduled(store, false);

        match result {
            Ok(()) => ScheduleOutcome::Started,
            Err(err) => {
                warn!("{}: scheduled start failed: {err}", self.device);
                ScheduleOutcome::StartFailed(err.to_string())
            }
        }
    }

    fn cancel_with_warning(
        &mut self,
        reason: &str,
        store: &mut dyn StateStore,
        timers: &mut TimerTable,
        notifier: &mut dyn Notifier,
    ) -> ScheduleOutcome {
        warn!("{}: dropping persisted schedule: {reason}", self.device);
        timers.cancel(TimerSlot::ScheduledStart);
        self.persist_scheduled(store, false);
        notifier.notify(&format!(
            "Scheduled start of {} cancelled: {reason}.",
            self.name
        ));
        ScheduleOutcome::Cancelled
    }

    fn read_start_time(&self, store: &dyn StateStore) -> Result<Option<DateTime<Utc>>, String> {
        let raw = store::read_text(store, &self.key(StateField::StartTime))
            .map_err(|err| err.to_string())?;
        match raw {
            None => Ok(None),
            Some(raw) => parse_instant(&raw, self.timezone)
                .map(Some)
                .map_err(|err| err.to_string()),
        }
    }

    fn persist_start_time(&mut self, store: &mut dyn StateStore, at: Option<DateTime<Utc>>) {
        let value = at
            .map(|at| Value::String(format_instant(at)))
            .unwrap_or(Value::Null);
        if let Err(err) = store.set(&self.key(StateField::StartTime), value, true) {
            warn!("{}: failed to persist start time: {err}", self.device);
        }
        if at.is_some() {
            self.accepted_start = at;
        }
    }

    fn persist_scheduled(&self, store: &mut dyn StateStore, scheduled: bool) {
        if let Err(err) = store.set(&self.key(StateField::Scheduled), Value::Bool(scheduled), true) {
            warn!("{}: failed to persist scheduled={scheduled}: {err}", self.device);
        }
    }

    fn horizon(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.config.max_schedule_horizon_ms).unwrap_or(i64::MAX))
    }

    fn key(&self, field: StateField) -> String {
        store::key(&self.device, field)
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn value_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "1" => Some(true),
            "false" | "off" | "0" => Some(false),
            _ => None,
        },
        Value::Number(number) => match number.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}
