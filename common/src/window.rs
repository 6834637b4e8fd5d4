//! Cheapest contiguous window search over an hourly price curve.
//!
//! Prices are piecewise constant: point `i` covers
//! `[prices[i].starts_at, prices[i + 1].starts_at)` and the last point covers
//! one hour. Candidate starts are `not_before` and every later segment start,
//! truncated to the minute.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use crate::types::{PricePoint, PriceWindow};

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainVariant {
    Combined,
    Split,
}

/// Start times for two appliances that run one after the other, e.g. a
/// washer followed by a dryer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChainedPlan {
    pub variant: ChainVariant,
    pub first: PriceWindow,
    pub second: PriceWindow,
    /// Time-weighted average over both runs.
    #[serde(rename = "avgPrice")]
    pub avg_price: f64,
}

pub fn find_cheapest_window(
    prices: &[PricePoint],
    duration_minutes: u32,
    not_before: DateTime<Utc>,
) -> Option<PriceWindow> {
    if duration_minutes == 0 {
        return None;
    }

    let segments = build_segments(prices);
    let duration = Duration::minutes(i64::from(duration_minutes));

    let mut best: Option<PriceWindow> = None;
    for start in candidate_starts(&segments, not_before) {
        let Some(avg_price) = average_over(&segments, start, duration) else {
            continue;
        };

        if best.map(|current| avg_price < current.avg_price).unwrap_or(true) {
            best = Some(PriceWindow {
                start,
                end: start + duration,
                avg_price,
            });
        }
    }

    best
}

pub fn plan_chained(
    prices: &[PricePoint],
    first_minutes: u32,
    second_minutes: u32,
    transfer_buffer_minutes: u32,
    not_before: DateTime<Utc>,
) -> Option<ChainedPlan> {
    let segments = build_segments(prices);

    let combined = find_cheapest_window(prices, first_minutes + second_minutes, not_before)
        .and_then(|window| {
            let first = window_at(&segments, window.start, first_minutes)?;
            let second = window_at(&segments, first.end, second_minutes)?;
            Some(ChainedPlan {
                variant: ChainVariant::Combined,
                first,
                second,
                avg_price: window.avg_price,
            })
        });

    let split = find_cheapest_window(prices, first_minutes, not_before).and_then(|first| {
        let earliest = first.end + Duration::minutes(i64::from(transfer_buffer_minutes));
        let second = find_cheapest_window(prices, second_minutes, earliest)?;
        let total = f64::from(first_minutes + second_minutes);
        let avg_price = (first.avg_price * f64::from(first_minutes)
            + second.avg_price * f64::from(second_minutes))
            / total;
        Some(ChainedPlan {
            variant: ChainVariant::Split,
            first,
            second,
            avg_price,
        })
    });

    match (combined, split) {
        // Combined keeps exact ties: one trip to the appliance instead of two.
        (Some(combined), Some(split)) if split.avg_price < combined.avg_price => Some(split),
        (Some(combined), _) => Some(combined),
        (None, split) => split,
    }
}

fn build_segments(prices: &[PricePoint]) -> Vec<Segment> {
    let mut points: Vec<&PricePoint> = prices
        .iter()
        .filter(|point| point.unit_price.is_finite())
        .collect();
    points.sort_by_key(|point| point.starts_at);
    points.dedup_by_key(|point| point.starts_at);

    points
        .iter()
        .enumerate()
        .map(|(i, point)| Segment {
            start: point.starts_at,
            end: points
                .get(i + 1)
                .map(|next| next.starts_at)
                .unwrap_or(point.starts_at + Duration::hours(1)),
            price: point.unit_price,
        })
        .collect()
}

fn candidate_starts(segments: &[Segment], not_before: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let mut starts: Vec<DateTime<Utc>> = std::iter::once(not_before)
        .chain(
            segments
                .iter()
                .map(|segment| segment.start)
                .filter(|start| *start >= not_before),
        )
        .map(truncate_to_minute)
        .collect();
    starts.sort();
    starts.dedup();
    starts
}

fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .duration_trunc(Duration::minutes(1))
        .unwrap_or(instant)
}

fn window_at(segments: &[Segment], start: DateTime<Utc>, minutes: u32) -> Option<PriceWindow> {
    let duration = Duration::minutes(i64::from(minutes));
    average_over(segments, start, duration).map(|avg_price| PriceWindow {
        start,
        end: start + duration,
        avg_price,
    })
}

/// Time-weighted average price over `[start, start + duration)`, or `None`
/// when any part of the range has no price.
fn average_over(segments: &[Segment], start: DateTime<Utc>, duration: Duration) -> Option<f64> {
    let end = start + duration;
    let mut weighted = 0.0;
    let mut covered_secs: i64 = 0;

    for segment in segments {
        let overlap_start = segment.start.max(start);
        let overlap_end = segment.end.min(end);
        if overlap_end <= overlap_start {
            continue;
        }
        let secs = (overlap_end - overlap_start).num_seconds();
        weighted += segment.price * secs as f64 / 60.0;
        covered_secs += secs;
    }

    if covered_secs == 0 || covered_secs < duration.num_seconds() {
        return None;
    }

    Some(weighted / (covered_secs as f64 / 60.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
    }

    fn hourly(prices: &[f64]) -> Vec<PricePoint> {
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| PricePoint::new(t0() + Duration::hours(i as i64), *price))
            .collect()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn picks_cheapest_ninety_minutes() {
        let prices = hourly(&[0.30, 0.10, 0.20, 0.35]);

        let window = find_cheapest_window(&prices, 90, t0()).unwrap();

        assert_eq!(window.start, t0() + Duration::hours(1));
        assert_eq!(window.end, t0() + Duration::minutes(150));
        assert_close(window.avg_price, (60.0 * 0.10 + 30.0 * 0.20) / 90.0);
    }

    #[test]
    fn not_before_inside_an_hour_is_a_candidate() {
        let prices = hourly(&[0.10, 0.50, 0.50]);
        let not_before = t0() + Duration::minutes(20);

        let window = find_cheapest_window(&prices, 30, not_before).unwrap();

        assert_eq!(window.start, not_before);
        assert_close(window.avg_price, 0.10);
    }

    #[test]
    fn not_before_is_truncated_to_the_minute() {
        let prices = hourly(&[0.10, 0.50]);
        let not_before = t0() + Duration::seconds(20 * 60 + 42);

        let window = find_cheapest_window(&prices, 10, not_before).unwrap();

        assert_eq!(window.start, t0() + Duration::minutes(20));
    }

    #[test]
    fn last_point_extends_one_hour() {
        let prices = hourly(&[0.40, 0.05]);

        let window = find_cheapest_window(&prices, 60, t0()).unwrap();

        assert_eq!(window.start, t0() + Duration::hours(1));
        assert_close(window.avg_price, 0.05);
    }

    #[test]
    fn returns_none_when_horizon_too_short() {
        let prices = hourly(&[0.10, 0.20]);

        assert_eq!(find_cheapest_window(&prices, 121, t0()), None);
        assert_eq!(
            find_cheapest_window(&prices, 60, t0() + Duration::minutes(61)),
            None
        );
        assert_eq!(find_cheapest_window(&[], 30, t0()), None);
        assert_eq!(find_cheapest_window(&prices, 0, t0()), None);
    }

    #[test]
    fn windows_before_the_first_price_are_rejected() {
        let prices = hourly(&[0.01, 0.30]);
        let not_before = t0() - Duration::minutes(30);

        let window = find_cheapest_window(&prices, 60, not_before).unwrap();

        assert_eq!(window.start, t0());
    }

    #[test]
    fn equal_cost_keeps_the_earliest_start() {
        let prices = hourly(&[0.20, 0.20, 0.20]);

        let window = find_cheapest_window(&prices, 60, t0()).unwrap();

        assert_eq!(window.start, t0());
    }

    #[test]
    fn unordered_points_are_sorted_first() {
        let mut prices = hourly(&[0.30, 0.10, 0.20]);
        prices.reverse();

        let window = find_cheapest_window(&prices, 60, t0()).unwrap();

        assert_eq!(window.start, t0() + Duration::hours(1));
    }

    #[test]
    fn chained_prefers_split_when_cheaper() {
        // Cheap hour for washing, expensive middle, cheap again for drying.
        let prices = hourly(&[0.10, 0.90, 0.90, 0.10, 0.50]);

        let plan = plan_chained(&prices, 60, 60, 30, t0()).unwrap();

        assert_eq!(plan.variant, ChainVariant::Split);
        assert_eq!(plan.first.start, t0());
        assert_eq!(plan.second.start, t0() + Duration::hours(3));
        assert_close(plan.avg_price, 0.10);
    }

    #[test]
    fn chained_prefers_combined_on_tie() {
        let prices = hourly(&[0.20, 0.20, 0.20, 0.20]);

        let plan = plan_chained(&prices, 60, 60, 0, t0()).unwrap();

        assert_eq!(plan.variant, ChainVariant::Combined);
        assert_eq!(plan.first.start, t0());
        assert_eq!(plan.second.start, t0() + Duration::hours(1));
    }

    #[test]
    fn chained_falls_back_to_the_only_fitting_variant() {
        // Buffer too long for a split plan inside the horizon.
        let prices = hourly(&[0.20, 0.30]);

        let plan = plan_chained(&prices, 60, 60, 120, t0()).unwrap();

        assert_eq!(plan.variant, ChainVariant::Combined);
        assert_close(plan.avg_price, 0.25);
        assert_eq!(plan_chained(&prices, 90, 60, 0, t0()), None);
    }
}
