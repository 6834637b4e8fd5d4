//! Property tests for the cheapest-window search.

use appliance_common::{find_cheapest_window, plan_chained, ChainVariant, PricePoint};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 0, 0, 0).unwrap()
}

fn hourly(prices: &[f64]) -> Vec<PricePoint> {
    prices
        .iter()
        .enumerate()
        .map(|(hour, price)| PricePoint::new(t0() + Duration::hours(hour as i64), *price))
        .collect()
}

/// Brute force over `offset` and every later hour boundary.
fn brute_force_best(prices: &[f64], minutes: u32, offset_min: i64) -> Option<f64> {
    let horizon = prices.len() as i64 * 60;
    let duration = i64::from(minutes);
    std::iter::once(offset_min)
        .chain((0..prices.len() as i64).map(|hour| hour * 60).filter(|start| *start >= offset_min))
        .filter(|start| start + duration <= horizon)
        .map(|start| {
            let total: f64 = (start..start + duration)
                .map(|minute| prices[(minute / 60) as usize])
                .sum();
            total / duration as f64
        })
        .min_by(|a, b| a.total_cmp(b))
}

proptest! {
    #[test]
    fn window_is_never_beaten_by_another_candidate(
        prices in proptest::collection::vec(0.0f64..1.0, 1..24),
        minutes in 1u32..300,
        offset_min in 0i64..120,
    ) {
        let curve = hourly(&prices);
        let not_before = t0() + Duration::minutes(offset_min);

        let found = find_cheapest_window(&curve, minutes, not_before);
        let best = brute_force_best(&prices, minutes, offset_min);

        match (found, best) {
            (Some(window), Some(best)) => {
                prop_assert!(window.start >= not_before);
                prop_assert_eq!(window.end - window.start, Duration::minutes(i64::from(minutes)));
                prop_assert!((window.avg_price - best).abs() < 1e-9,
                    "found {} but {} is possible", window.avg_price, best);
            }
            (None, None) => {}
            (found, best) => prop_assert!(false, "found {:?}, brute force {:?}", found, best),
        }
    }

    #[test]
    fn chained_plan_keeps_order_and_buffer(
        prices in proptest::collection::vec(0.0f64..1.0, 4..30),
        first in 30u32..180,
        second in 30u32..180,
        buffer in 0u32..60,
    ) {
        let curve = hourly(&prices);
        if let Some(plan) = plan_chained(&curve, first, second, buffer, t0()) {
            prop_assert!(plan.first.start >= t0());
            match plan.variant {
                ChainVariant::Combined => prop_assert_eq!(plan.second.start, plan.first.end),
                ChainVariant::Split => prop_assert!(
                    plan.second.start >= plan.first.end + Duration::minutes(i64::from(buffer))
                ),
            }
        }
    }
}

#[test]
fn finds_the_cheap_two_hours() {
    let curve = hourly(&[0.2, 0.1, 0.1, 0.3]);

    let window = find_cheapest_window(&curve, 120, t0()).unwrap();

    assert_eq!(window.start, t0() + Duration::hours(1));
    assert!((window.avg_price - 0.1).abs() < 1e-9);
}
