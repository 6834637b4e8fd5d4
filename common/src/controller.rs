//! One appliance: detection, scheduled start and the kind-specific policy on
//! top of them.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::{ApplianceConfig, ApplianceKind, RuntimeConfig, ScheduleConfig},
    detection::{DetectionEngine, DetectionEvent},
    error::{ActuatorError, PlanError},
    instant::format_local,
    ports::{Ports, SwitchActuator},
    schedule::{ScheduleManager, ScheduleOutcome},
    store::{self, Origin, StateChange, StateField, StateStore},
    timers::{TimerSlot, TimerTable},
    types::{DeviceStatus, PriceWindow},
    window::{find_cheapest_window, plan_chained, ChainVariant},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedStart {
    pub device: String,
    pub window: PriceWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub device: String,
    pub window: PriceWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<ChainVariant>,
    /// Start planned for the chained appliance; the caller schedules it there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked: Option<LinkedStart>,
    pub outcome: ScheduleOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    ManualStart,
    Started,
    Finished { runtime_ms: u64 },
    Planned(Plan),
    Schedule(ScheduleOutcome),
}

#[derive(Debug, Clone)]
struct LinkedDryer {
    id: String,
    name: String,
    program_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct DeviceController {
    config: ApplianceConfig,
    detection: DetectionEngine,
    schedule: ScheduleManager,
    timers: TimerTable,
    timezone: Tz,
    dryer: Option<LinkedDryer>,
}

/// Builds one controller per configured appliance, resolving washer → dryer
/// links.
pub fn build_controllers(runtime: &RuntimeConfig) -> Vec<DeviceController> {
    let timezone = runtime.timezone.parse::<Tz>().unwrap_or_else(|_| {
        warn!("unknown timezone {:?}, using UTC", runtime.timezone);
        Tz::UTC
    });

    runtime
        .appliances
        .iter()
        .map(|appliance| {
            let mut controller =
                DeviceController::new(appliance.clone(), runtime.schedule.clone(), timezone);
            if let ApplianceKind::Washer { dryer: Some(id) } = &appliance.kind {
                if let Some(dryer) = runtime.appliance(id) {
                    controller.link_dryer(&dryer.id, &dryer.name, dryer.program_minutes);
                }
            }
            controller
        })
        .collect()
}

impl DeviceController {
    pub fn new(config: ApplianceConfig, schedule: ScheduleConfig, timezone: Tz) -> Self {
        let detection = DetectionEngine::new(&config.id, config.detection.clone());
        let schedule = ScheduleManager::new(&config.id, &config.name, schedule, timezone);
        Self {
            config,
            detection,
            schedule,
            timers: TimerTable::new(),
            timezone,
            dryer: None,
        }
    }

    pub fn link_dryer(&mut self, id: &str, name: &str, program_minutes: u32) {
        self.dryer = Some(LinkedDryer {
            id: id.to_string(),
            name: name.to_string(),
            program_minutes,
        });
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn timers(&self) -> &TimerTable {
        &self.timers
    }

    pub fn detection(&self) -> &DetectionEngine {
        &self.detection
    }

    pub fn restore(&mut self, now: DateTime<Utc>, ports: &mut Ports<'_>) -> Vec<ControllerEvent> {
        self.detection.restore(&*ports.store, now);

        if self.detection.is_running() {
            if self
                .schedule
                .cancel(false, &mut *ports.store, &mut self.timers, &mut *ports.notifier)
            {
                info!("{}: dropped schedule persisted alongside a run", self.config.id);
            }
            return Vec::new();
        }

        let switch: &mut dyn SwitchActuator = &mut *ports.switch;
        let config = &self.config;
        let detection = &mut self.detection;
        let outcome = self.schedule.restore_on_startup(
            now,
            &mut *ports.store,
            &mut self.timers,
            &mut *ports.notifier,
            |now, timers| perform_scheduled_start(config, detection, switch, now, timers),
        );
        self.report_failure(&outcome, ports);

        match outcome {
            ScheduleOutcome::Unchanged => Vec::new(),
            outcome => vec![ControllerEvent::Schedule(outcome)],
        }
    }

    /// Feeds one power sample. `None` means no reading this tick.
    pub fn on_power(
        &mut self,
        sample: Option<f64>,
        now: DateTime<Utc>,
        ports: &mut Ports<'_>,
    ) -> Vec<ControllerEvent> {
        let events = self.tick(now, ports);
        let pending = self.schedule_pending(ports);
        self.detection
            .on_power(sample, now, pending, &mut self.timers);
        events
    }

    /// Fires every timer that is due.
    pub fn tick(&mut self, now: DateTime<Utc>, ports: &mut Ports<'_>) -> Vec<ControllerEvent> {
        let mut events = Vec::new();

        while let Some(fired) = self.timers.pop_due(now) {
            match fired.slot {
                TimerSlot::Detection
                | TimerSlot::StartConfirm
                | TimerSlot::EndGrace
                | TimerSlot::PostConfirm => {
                    let pending = self.schedule_pending(ports);
                    let event = self.detection.on_timer(
                        fired.slot,
                        now,
                        pending,
                        &mut *ports.store,
                        &mut self.timers,
                    );
                    if let Some(event) = event {
                        events.extend(self.on_detection(event, now, ports));
                    }
                }
                TimerSlot::ScheduledStart => {
                    let switch: &mut dyn SwitchActuator = &mut *ports.switch;
                    let config = &self.config;
                    let detection = &mut self.detection;
                    let outcome = self.schedule.on_timer(
                        now,
                        &mut *ports.store,
                        &mut self.timers,
                        |now, timers| perform_scheduled_start(config, detection, switch, now, timers),
                    );
                    self.report_failure(&outcome, ports);
                    events.push(ControllerEvent::Schedule(outcome));
                }
                TimerSlot::Press => {
                    if let Err(err) = ports.switch.press(&self.config.id) {
                        warn!("{}: button press failed: {err}", self.config.id);
                    }
                }
                TimerSlot::DryReminder => self.remind_dryer(ports),
            }
        }

        events
    }

    /// Host command "set start time".
    pub fn schedule_at(
        &mut self,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
        ports: &mut Ports<'_>,
    ) -> ScheduleOutcome {
        if self.detection.is_running() {
            warn!("{}: not scheduling while running", self.config.id);
            return ScheduleOutcome::Rejected("appliance is already running".to_string());
        }

        let switch: &mut dyn SwitchActuator = &mut *ports.switch;
        let config = &self.config;
        let detection = &mut self.detection;
        let outcome =
            self.schedule
                .schedule_at(at, now, &mut *ports.store, &mut self.timers, |now, timers| {
                    perform_scheduled_start(config, detection, switch, now, timers)
                });
        self.report_failure(&outcome, ports);
        outcome
    }

    pub fn cancel(&mut self, notify: bool, ports: &mut Ports<'_>) -> bool {
        self.schedule
            .cancel(notify, &mut *ports.store, &mut self.timers, &mut *ports.notifier)
    }

    /// Reconciles an observed write to one of this appliance's fields.
    pub fn on_state_change(
        &mut self,
        change: &StateChange,
        now: DateTime<Utc>,
        ports: &mut Ports<'_>,
    ) -> ScheduleOutcome {
        if change.device != self.config.id || change.origin == Origin::System {
            return ScheduleOutcome::Unchanged;
        }

        if change.field == StateField::Scheduled && self.detection.is_running() {
            warn!("{}: operator tried to schedule a running appliance", self.config.id);
            let key = store::key(&self.config.id, StateField::Scheduled);
            if let Err(err) = ports.store.set(&key, serde_json::Value::Bool(false), true) {
                warn!("{}: failed to reset scheduled flag: {err}", self.config.id);
            }
            return ScheduleOutcome::Rejected("appliance is already running".to_string());
        }

        let switch: &mut dyn SwitchActuator = &mut *ports.switch;
        let config = &self.config;
        let detection = &mut self.detection;
        let outcome = self.schedule.on_manual_edit(
            change,
            now,
            &mut *ports.store,
            &mut self.timers,
            &mut *ports.notifier,
            |now, timers| perform_scheduled_start(config, detection, switch, now, timers),
        );
        self.report_failure(&outcome, ports);
        outcome
    }

    /// Host command "plan program": finds the cheapest start and schedules it.
    pub fn plan(&mut self, now: DateTime<Utc>, ports: &mut Ports<'_>) -> Result<Plan, PlanError> {
        match self.try_plan(now, ports) {
            Ok(plan) => {
                let mut text = format!(
                    "{} planned for {} (avg {:.4}/kWh).",
                    self.config.name,
                    format_local(plan.window.start, self.timezone),
                    plan.window.avg_price
                );
                if let (Some(linked), Some(dryer)) = (&plan.linked, &self.dryer) {
                    text.push_str(&format!(
                        " {} from {}.",
                        dryer.name,
                        format_local(linked.window.start, self.timezone)
                    ));
                }
                ports.notifier.notify(&text);
                Ok(plan)
            }
            Err(err) => {
                warn!("{}: planning failed: {err}", self.config.id);
                ports
                    .notifier
                    .notify(&format!("Could not plan {}: {err}.", self.config.name));
                Err(err)
            }
        }
    }

    pub fn status(&self, now: DateTime<Utc>, ports: &Ports<'_>) -> DeviceStatus {
        let store: &dyn StateStore = &*ports.store;
        DeviceStatus {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            kind: self.config.kind.as_str(),
            phase: self.detection.phase().as_str(),
            running: store::read_bool(store, &store::key(&self.config.id, StateField::Running))
                .unwrap_or(false),
            scheduled: self.schedule.is_scheduled(store),
            start_time: self.schedule.start_time(store),
            last_power_w: self.detection.last_power_w(),
            runtime_min: self.detection.runtime_ms(now) / 60_000,
            in_cooldown: self.detection.is_in_cooldown(now),
            cooldown_remaining_ms: self.detection.cooldown_remaining_ms(now),
            automatic_start_in_progress: self.detection.automatic_start_in_progress(now),
            armed_timers: self.timers.armed().map(TimerSlot::as_str).collect(),
        }
    }

    fn try_plan(&mut self, now: DateTime<Utc>, ports: &mut Ports<'_>) -> Result<Plan, PlanError> {
        if self.detection.is_running() {
            return Err(PlanError::AlreadyRunning);
        }

        let prices = ports.prices.fetch_prices()?;
        let minutes = self.config.program_minutes;

        let (window, variant, linked) = match &self.dryer {
            Some(dryer) => {
                let chained = plan_chained(
                    &prices,
                    minutes,
                    dryer.program_minutes,
                    self.config.transfer_buffer_min,
                    now,
                )
                .ok_or(PlanError::NoWindow {
                    duration_minutes: minutes + dryer.program_minutes,
                })?;
                let linked = LinkedStart {
                    device: dryer.id.clone(),
                    window: chained.second,
                };
                (chained.first, Some(chained.variant), Some(linked))
            }
            None => {
                let window = find_cheapest_window(&prices, minutes, now).ok_or(PlanError::NoWindow {
                    duration_minutes: minutes,
                })?;
                (window, None, None)
            }
        };

        info!(
            "{}: cheapest start {} at avg {:.4}",
            self.config.id, window.start, window.avg_price
        );
        let outcome = self.schedule_at(window.start, now, ports);

        Ok(Plan {
            device: self.config.id.clone(),
            window,
            variant,
            linked,
            outcome,
        })
    }

    fn on_detection(
        &mut self,
        event: DetectionEvent,
        now: DateTime<Utc>,
        ports: &mut Ports<'_>,
    ) -> Vec<ControllerEvent> {
        match event {
            DetectionEvent::ManualStart => {
                let mut events = vec![ControllerEvent::ManualStart];
                if let Err(err) = ports.switch.set_switch(&self.config.id, false) {
                    warn!("{}: could not switch off after manual start: {err}", self.config.id);
                }
                ports.notifier.notify(&format!(
                    "{} was switched on by hand; holding it for the cheapest start.",
                    self.config.name
                ));
                if let Ok(plan) = self.plan(now, ports) {
                    events.push(ControllerEvent::Planned(plan));
                }
                events
            }
            DetectionEvent::Started => {
                if self.schedule_pending(ports) {
                    debug!("{}: run started, clearing pending schedule", self.config.id);
                    self.cancel(false, ports);
                }
                self.timers.cancel(TimerSlot::DryReminder);
                vec![ControllerEvent::Started]
            }
            DetectionEvent::Finished { runtime_ms } => {
                self.on_finish(now, runtime_ms, ports);
                vec![ControllerEvent::Finished { runtime_ms }]
            }
        }
    }

    fn on_finish(&mut self, now: DateTime<Utc>, runtime_ms: u64, ports: &mut Ports<'_>) {
        let minutes = runtime_ms / 60_000;
        let text = match &self.config.kind {
            ApplianceKind::Dryer => {
                format!("{} finished after {minutes} min, ready to empty.", self.config.name)
            }
            _ => format!("{} finished after {minutes} min.", self.config.name),
        };
        ports.notifier.notify(&text);

        if self.dryer.is_some() {
            let due = now + millis(self.config.dry_reminder_ms);
            self.timers.arm(TimerSlot::DryReminder, due);
        }
    }

    fn remind_dryer(&mut self, ports: &mut Ports<'_>) {
        let Some(dryer) = &self.dryer else {
            return;
        };
        let key = store::key(&dryer.id, StateField::Running);
        match store::read_bool(&*ports.store, &key) {
            Ok(true) => debug!("{}: dryer already running, no reminder", self.config.id),
            Ok(false) => ports.notifier.notify(&format!(
                "Laundry in {} is waiting. Move it to the dryer.",
                self.config.name
            )),
            Err(err) => warn!("{}: could not read dryer state: {err}", self.config.id),
        }
    }

    fn report_failure(&self, outcome: &ScheduleOutcome, ports: &mut Ports<'_>) {
        if let ScheduleOutcome::StartFailed(reason) = outcome {
            ports.notifier.notify(&format!(
                "Scheduled start of {} failed: {reason}.",
                self.config.name
            ));
        }
    }

    fn schedule_pending(&self, ports: &Ports<'_>) -> bool {
        self.timers.is_armed(TimerSlot::ScheduledStart) || self.schedule.is_scheduled(&*ports.store)
    }
}

fn perform_scheduled_start(
    config: &ApplianceConfig,
    detection: &mut DetectionEngine,
    switch: &mut dyn SwitchActuator,
    now: DateTime<Utc>,
    timers: &mut TimerTable,
) -> Result<(), ActuatorError> {
    info!("{}: performing scheduled start", config.id);
    // Before switching, so our own power-on is not read as a manual start.
    detection.begin_automatic_start(now);
    switch.set_switch(&config.id, true)?;

    let press_delay = match (&config.kind, config.press_delay_ms) {
        (_, Some(delay)) => Some(delay),
        (ApplianceKind::Dishwasher, None) => Some(DEFAULT_PRESS_DELAY_MS),
        _ => None,
    };
    if let Some(delay) = press_delay {
        timers.arm(TimerSlot::Press, now + millis(delay));
    }
    Ok(())
}

const DEFAULT_PRESS_DELAY_MS: u64 = 5_000;

fn millis(value: u64) -> Duration {
    Duration::milliseconds(i64::try_from(value).unwrap_or(i64::MAX))
}
