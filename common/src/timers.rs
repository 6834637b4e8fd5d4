//! Per-appliance timer table.
//!
//! One slot per purpose, so at most one pending timer exists for each. Arming a
//! slot replaces whatever was there. `pop_due` clears a slot before handing it
//! out, which makes a later `cancel` of the same timer a no-op.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TimerSlot {
    Detection = 0,
    StartConfirm = 1,
    EndGrace = 2,
    PostConfirm = 3,
    DryReminder = 4,
    ScheduledStart = 5,
    Press = 6,
}

impl TimerSlot {
    pub const COUNT: usize = 7;

    pub const ALL: [TimerSlot; Self::COUNT] = [
        Self::Detection,
        Self::StartConfirm,
        Self::EndGrace,
        Self::PostConfirm,
        Self::DryReminder,
        Self::ScheduledStart,
        Self::Press,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::StartConfirm => "start_confirm",
            Self::EndGrace => "end_grace",
            Self::PostConfirm => "post_confirm",
            Self::DryReminder => "dry_reminder",
            Self::ScheduledStart => "scheduled_start",
            Self::Press => "press",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer {
    pub slot: TimerSlot,
    pub due: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TimerTable {
    slots: [Option<DateTime<Utc>>; TimerSlot::COUNT],
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, slot: TimerSlot, due: DateTime<Utc>) {
        self.slots[slot as usize] = Some(due);
    }

    /// Returns true if something was disarmed.
    pub fn cancel(&mut self, slot: TimerSlot) -> bool {
        self.slots[slot as usize].take().is_some()
    }

    pub fn is_armed(&self, slot: TimerSlot) -> bool {
        self.slots[slot as usize].is_some()
    }

    pub fn due_at(&self, slot: TimerSlot) -> Option<DateTime<Utc>> {
        self.slots[slot as usize]
    }

    pub fn armed(&self) -> impl Iterator<Item = TimerSlot> + '_ {
        TimerSlot::ALL
            .into_iter()
            .filter(|slot| self.is_armed(*slot))
    }

    /// Removes and returns the earliest timer due at `now`. Callers drain one
    /// at a time so that a handler's cancels reach timers still queued.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<FiredTimer> {
        let (slot, due) = TimerSlot::ALL
            .into_iter()
            .filter_map(|slot| self.slots[slot as usize].map(|due| (slot, due)))
            .filter(|(_, due)| *due <= now)
            .min_by_key(|(_, due)| *due)?;
        self.slots[slot as usize] = None;
        Some(FiredTimer { slot, due })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn drain(timers: &mut TimerTable, now: DateTime<Utc>) -> Vec<TimerSlot> {
        std::iter::from_fn(|| timers.pop_due(now))
            .map(|fired| fired.slot)
            .collect()
    }

    #[test]
    fn rearming_replaces_the_pending_timer() {
        let mut timers = TimerTable::new();
        timers.arm(TimerSlot::ScheduledStart, base() + Duration::minutes(5));
        timers.arm(TimerSlot::ScheduledStart, base() + Duration::minutes(10));

        assert_eq!(timers.armed().count(), 1);
        assert_eq!(
            timers.due_at(TimerSlot::ScheduledStart),
            Some(base() + Duration::minutes(10))
        );
        assert_eq!(timers.pop_due(base() + Duration::minutes(5)), None);
    }

    #[test]
    fn due_timers_come_out_earliest_first() {
        let mut timers = TimerTable::new();
        timers.arm(TimerSlot::PostConfirm, base() + Duration::seconds(20));
        timers.arm(TimerSlot::Detection, base() + Duration::seconds(30));
        timers.arm(TimerSlot::EndGrace, base() + Duration::seconds(10));

        let slots = drain(&mut timers, base() + Duration::seconds(20));

        assert_eq!(slots, vec![TimerSlot::EndGrace, TimerSlot::PostConfirm]);
        assert!(!timers.cancel(TimerSlot::EndGrace));
        assert!(timers.is_armed(TimerSlot::Detection));
    }

    #[test]
    fn cancel_between_pops_drops_a_queued_timer() {
        let mut timers = TimerTable::new();
        timers.arm(TimerSlot::StartConfirm, base());
        timers.arm(TimerSlot::DryReminder, base() + Duration::seconds(5));
        let now = base() + Duration::seconds(5);

        let first = timers.pop_due(now).map(|fired| fired.slot);
        timers.cancel(TimerSlot::DryReminder);

        assert_eq!(first, Some(TimerSlot::StartConfirm));
        assert_eq!(timers.pop_due(now), None);
    }
}
