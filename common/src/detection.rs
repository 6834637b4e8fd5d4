//! Power-threshold cycle detection.
//!
//! ```text
//! Idle ──above EPS──▶ Confirming ──held detect_time──▶ Running
//!   ▲                    │ (manual: switch off, re-plan)   │ below EPS after
//!   │                    └──below EPS──▶ Idle              │ min runtime
//!   │                                                      ▼
//!   └──still below── PostConfirm ◀──still below── EndGrace
//!                        │ above EPS                  │ above EPS
//!                        └──────────▶ Running ◀───────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    config::DetectionConfig,
    store::{self, StateField, StateStore},
    timers::{TimerSlot, TimerTable},
    types::DetectionPhase,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionEvent {
    /// Sustained draw that nobody here asked for.
    ManualStart,
    Started,
    Finished { runtime_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct DetectionEngine {
    device: String,
    pub config: DetectionConfig,

    phase: DetectionPhase,
    last_power_w: Option<f64>,
    last_above_threshold_at: Option<DateTime<Utc>>,
    last_finish_at: Option<DateTime<Utc>>,
    run_started_at: Option<DateTime<Utc>>,

    automatic_start_until: Option<DateTime<Utc>>,
    // Set after a manual start until power drops, so a failed switch-off is
    // not reported again every detection window.
    manual_start_latched: bool,
}

impl DetectionEngine {
    pub fn new(device: &str, mut config: DetectionConfig) -> Self {
        config.sanitize();
        Self {
            device: device.to_string(),
            config,
            phase: DetectionPhase::Idle,
            last_power_w: None,
            last_above_threshold_at: None,
            last_finish_at: None,
            run_started_at: None,
            automatic_start_until: None,
            manual_start_latched: false,
        }
    }

    pub fn phase(&self) -> DetectionPhase {
        self.phase
    }

    pub fn last_power_w(&self) -> Option<f64> {
        self.last_power_w
    }

    pub fn is_running(&self) -> bool {
        self.phase.is_active()
    }

    pub fn runtime_ms(&self, now: DateTime<Utc>) -> u64 {
        match self.run_started_at {
            Some(start) if self.is_running() => millis_between(start, now),
            _ => 0,
        }
    }

    pub fn cooldown_remaining_ms(&self, now: DateTime<Utc>) -> u64 {
        let Some(finished) = self.last_finish_at else {
            return 0;
        };
        self.config
            .cooldown_after_finish_ms
            .saturating_sub(millis_between(finished, now))
    }

    pub fn is_in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_remaining_ms(now) > 0
    }

    pub fn automatic_start_in_progress(&self, now: DateTime<Utc>) -> bool {
        self.automatic_start_until
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Marks the next rise in power as commanded by us for the suppression
    /// window.
    pub fn begin_automatic_start(&mut self, now: DateTime<Utc>) {
        self.automatic_start_until = Some(now + ms(self.config.start_suppression_ms));
        self.manual_start_latched = false;
    }

    /// Resumes a run that was in progress before a restart.
    pub fn restore(&mut self, store: &dyn StateStore, now: DateTime<Utc>) {
        let key = store::key(&self.device, StateField::Running);
        match store::read_bool(store, &key) {
            Ok(true) => {
                info!("{}: resuming run persisted before restart", self.device);
                self.phase = DetectionPhase::Running;
                self.run_started_at = Some(now);
                self.last_above_threshold_at = Some(now);
            }
            Ok(false) => {}
            Err(err) => warn!("{}: could not read running flag: {err}", self.device),
        }
    }

    pub fn on_power(
        &mut self,
        sample: Option<f64>,
        now: DateTime<Utc>,
        schedule_pending: bool,
        timers: &mut TimerTable,
    ) {
        let Some(watts) = sample.filter(|watts| watts.is_finite()) else {
            if sample.is_some() {
                warn!("{}: ignoring non-finite power sample", self.device);
            }
            return;
        };

        self.last_power_w = Some(watts);
        let above = watts > self.config.power_threshold_w;
        if above {
            self.last_above_threshold_at = Some(now);
        } else {
            self.manual_start_latched = false;
        }

        match self.phase {
            DetectionPhase::Idle => {
                if !above || self.manual_start_latched {
                    return;
                }
                if self.is_in_cooldown(now) {
                    debug!("{}: draw during cooldown ignored", self.device);
                    return;
                }

                let due = now + ms(self.config.detect_time_ms);
                if schedule_pending || self.automatic_start_in_progress(now) {
                    timers.arm(TimerSlot::StartConfirm, due);
                } else {
                    timers.arm(TimerSlot::Detection, due);
                }
                self.phase = DetectionPhase::Confirming;
            }
            DetectionPhase::Confirming => {
                if !above {
                    debug!("{}: power dropped before confirmation", self.device);
                    timers.cancel(TimerSlot::Detection);
                    timers.cancel(TimerSlot::StartConfirm);
                    self.phase = DetectionPhase::Idle;
                }
            }
            DetectionPhase::Running => {
                if !above && self.runtime_ms(now) >= self.config.min_runtime_before_end_ms {
                    timers.arm(TimerSlot::EndGrace, now + ms(self.config.zero_grace_ms));
                    self.phase = DetectionPhase::EndGrace;
                }
            }
            DetectionPhase::EndGrace | DetectionPhase::PostConfirm => {
                if above {
                    debug!("{}: draw resumed, end detection reset", self.device);
                    self.reset_end_detection(timers);
                }
            }
        }
    }

    pub fn on_timer(
        &mut self,
        slot: TimerSlot,
        now: DateTime<Utc>,
        schedule_pending: bool,
        store: &mut dyn StateStore,
        timers: &mut TimerTable,
    ) -> Option<DetectionEvent> {
        match slot {
            TimerSlot::Detection | TimerSlot::StartConfirm => {
                if self.phase != DetectionPhase::Confirming || !self.power_above() {
                    return None;
                }
                let commanded = slot == TimerSlot::StartConfirm
                    || schedule_pending
                    || self.automatic_start_in_progress(now);

                if commanded {
                    self.start_run(now, store);
                    Some(DetectionEvent::Started)
                } else {
                    info!("{}: manual start detected", self.device);
                    self.phase = DetectionPhase::Idle;
                    self.manual_start_latched = true;
                    Some(DetectionEvent::ManualStart)
                }
            }
            TimerSlot::EndGrace => {
                if self.phase != DetectionPhase::EndGrace {
                    return None;
                }
                let quiet_for = self
                    .last_above_threshold_at
                    .map(|last| millis_between(last, now))
                    .unwrap_or(u64::MAX);

                if !self.power_above() && quiet_for >= self.config.zero_grace_ms {
                    timers.arm(TimerSlot::PostConfirm, now + ms(self.config.post_confirm_ms));
                    self.phase = DetectionPhase::PostConfirm;
                } else {
                    self.reset_end_detection(timers);
                }
                None
            }
            TimerSlot::PostConfirm => {
                if self.phase != DetectionPhase::PostConfirm {
                    return None;
                }
                if self.power_above() {
                    self.reset_end_detection(timers);
                    return None;
                }
                let runtime_ms = self.finish_run(now, store);
                Some(DetectionEvent::Finished { runtime_ms })
            }
            _ => None,
        }
    }

    fn power_above(&self) -> bool {
        self.last_power_w
            .map(|watts| watts > self.config.power_threshold_w)
            .unwrap_or(false)
    }

    fn start_run(&mut self, now: DateTime<Utc>, store: &mut dyn StateStore) {
        info!("{}: run started", self.device);
        self.phase = DetectionPhase::Running;
        self.run_started_at = Some(now);
        self.automatic_start_until = None;
        self.persist_running(store, true);
    }

    fn finish_run(&mut self, now: DateTime<Utc>, store: &mut dyn StateStore) -> u64 {
        let runtime_ms = self.runtime_ms(now);
        info!(
            "{}: run finished after {} min",
            self.device,
            runtime_ms / 60_000
        );
        self.phase = DetectionPhase::Idle;
        self.run_started_at = None;
        self.last_finish_at = Some(now);
        self.persist_running(store, false);
        runtime_ms
    }

    fn reset_end_detection(&mut self, timers: &mut TimerTable) {
        timers.cancel(TimerSlot::EndGrace);
        timers.cancel(TimerSlot::PostConfirm);
        self.phase = DetectionPhase::Running;
    }

    fn persist_running(&self, store: &mut dyn StateStore, running: bool) {
        let key = store::key(&self.device, StateField::Running);
        if let Err(err) = store.set(&key, Value::Bool(running), true) {
            warn!("{}: failed to persist running={running}: {err}", self.device);
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::milliseconds(i64::try_from(value).unwrap_or(i64::MAX))
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn config() -> DetectionConfig {
        DetectionConfig {
            power_threshold_w: 0.5,
            detect_time_ms: 10_000,
            min_runtime_before_end_ms: 60_000,
            zero_grace_ms: 30_000,
            post_confirm_ms: 20_000,
            cooldown_after_finish_ms: 120_000,
            start_suppression_ms: 60_000,
        }
    }

    struct Rig {
        engine: DetectionEngine,
        store: MemoryStore,
        timers: TimerTable,
        now: DateTime<Utc>,
        schedule_pending: bool,
        events: Vec<DetectionEvent>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                engine: DetectionEngine::new("washer", config()),
                store: MemoryStore::new(),
                timers: TimerTable::new(),
                now: t0(),
                schedule_pending: false,
                events: Vec::new(),
            }
        }

        /// One sample per second for `secs` seconds, firing timers first.
        fn feed(&mut self, watts: f64, secs: i64) {
            for _ in 0..secs {
                self.now += Duration::seconds(1);
                while let Some(fired) = self.timers.pop_due(self.now) {
                    let event = self.engine.on_timer(
                        fired.slot,
                        self.now,
                        self.schedule_pending,
                        &mut self.store,
                        &mut self.timers,
                    );
                    self.events.extend(event);
                }
                self.engine.on_power(
                    Some(watts),
                    self.now,
                    self.schedule_pending,
                    &mut self.timers,
                );
            }
        }

        fn running_flag(&self) -> bool {
            store::read_bool(&self.store, "washer.running").unwrap()
        }

        fn start_run(&mut self) {
            self.schedule_pending = true;
            self.feed(800.0, 12);
            self.schedule_pending = false;
            self.events.clear();
        }
    }

    #[test]
    fn short_spike_never_starts_a_run() {
        let mut rig = Rig::new();

        rig.feed(0.8, 9);
        rig.feed(0.0, 20);

        assert_eq!(rig.engine.phase(), DetectionPhase::Idle);
        assert!(rig.events.is_empty());
        assert_eq!(rig.timers.armed().count(), 0);
    }

    #[test]
    fn unscheduled_sustained_draw_is_a_manual_start() {
        let mut rig = Rig::new();

        rig.feed(0.8, 12);
        rig.feed(0.0, 5);

        assert_eq!(rig.events, vec![DetectionEvent::ManualStart]);
        assert_eq!(rig.engine.phase(), DetectionPhase::Idle);
        assert!(!rig.running_flag());
    }

    #[test]
    fn manual_start_is_reported_once_while_draw_persists() {
        let mut rig = Rig::new();

        rig.feed(0.8, 40);

        assert_eq!(rig.events, vec![DetectionEvent::ManualStart]);
    }

    #[test]
    fn scheduled_draw_confirms_a_run() {
        let mut rig = Rig::new();
        rig.schedule_pending = true;

        rig.feed(800.0, 11);

        assert_eq!(rig.events, vec![DetectionEvent::Started]);
        assert_eq!(rig.engine.phase(), DetectionPhase::Running);
        assert!(rig.running_flag());
    }

    #[test]
    fn automatic_start_suppresses_manual_detection() {
        let mut rig = Rig::new();
        rig.engine.begin_automatic_start(rig.now);

        rig.feed(800.0, 11);

        assert_eq!(rig.events, vec![DetectionEvent::Started]);
        assert!(!rig.engine.automatic_start_in_progress(rig.now));
    }

    #[test]
    fn end_requires_grace_and_post_confirm() {
        let mut rig = Rig::new();
        rig.start_run();
        rig.feed(800.0, 60);

        rig.feed(0.0, 30);
        assert_eq!(rig.engine.phase(), DetectionPhase::EndGrace);
        rig.feed(0.0, 1);
        assert_eq!(rig.engine.phase(), DetectionPhase::PostConfirm);
        assert!(rig.events.is_empty());

        rig.feed(0.0, 20);
        assert!(matches!(
            rig.events.as_slice(),
            [DetectionEvent::Finished { .. }]
        ));
        assert_eq!(rig.engine.phase(), DetectionPhase::Idle);
        assert!(!rig.running_flag());
        assert!(rig.engine.is_in_cooldown(rig.now));
    }

    #[test]
    fn draw_during_grace_resets_end_detection() {
        let mut rig = Rig::new();
        rig.start_run();
        rig.feed(800.0, 60);

        rig.feed(0.0, 20);
        rig.feed(900.0, 1);
        assert_eq!(rig.engine.phase(), DetectionPhase::Running);
        assert!(!rig.timers.is_armed(TimerSlot::EndGrace));

        rig.feed(0.0, 35);
        rig.feed(900.0, 1);
        assert_eq!(rig.engine.phase(), DetectionPhase::Running);
        assert!(!rig.timers.is_armed(TimerSlot::PostConfirm));
        assert!(rig.events.is_empty());
    }

    #[test]
    fn low_draw_early_in_run_does_not_arm_end_detection() {
        let mut rig = Rig::new();
        rig.start_run();

        rig.feed(0.0, 40);

        assert_eq!(rig.engine.phase(), DetectionPhase::Running);
        assert!(!rig.timers.is_armed(TimerSlot::EndGrace));
    }

    #[test]
    fn cooldown_blocks_new_detection() {
        let mut rig = Rig::new();
        rig.start_run();
        rig.feed(800.0, 60);
        rig.feed(0.0, 51);
        assert!(matches!(
            rig.events.as_slice(),
            [DetectionEvent::Finished { .. }]
        ));
        rig.events.clear();

        rig.feed(0.8, 30);
        assert!(rig.events.is_empty());
        assert_eq!(rig.engine.phase(), DetectionPhase::Idle);

        rig.feed(0.0, 90);
        rig.feed(0.8, 11);
        assert_eq!(rig.events, vec![DetectionEvent::ManualStart]);
    }

    #[test]
    fn restores_persisted_run() {
        let mut rig = Rig::new();
        rig.store
            .set("washer.running", Value::Bool(true), true)
            .unwrap();

        rig.engine.restore(&rig.store, rig.now);

        assert_eq!(rig.engine.phase(), DetectionPhase::Running);
    }

    struct BrokenStore;

    impl StateStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<Value>, StoreError> {
            Err(StoreError::Unavailable("disk gone".to_string()))
        }

        fn set(&mut self, _key: &str, _value: Value, _committed: bool) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk gone".to_string()))
        }
    }

    #[test]
    fn store_failures_do_not_stop_detection() {
        let mut engine = DetectionEngine::new("washer", config());
        let mut store = BrokenStore;
        let mut timers = TimerTable::new();

        engine.restore(&store, t0());
        engine.on_power(Some(500.0), t0(), true, &mut timers);
        let later = t0() + Duration::seconds(10);
        let fired = timers.pop_due(later).unwrap();
        let event = engine.on_timer(fired.slot, later, true, &mut store, &mut timers);

        assert_eq!(event, Some(DetectionEvent::Started));
        assert!(engine.is_running());
        engine.on_power(None, later, false, &mut timers);
        assert_eq!(engine.last_power_w(), Some(500.0));
    }
}
