use crate::types::{Direction, Marketplace, MarketSnapshot};

/// One computed comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionDiff {
    pub direction: Direction,
    pub percent_diff: f64,
    /// Cross-market directions only.
    pub percent_diff_with_fee: Option<f64>,
}

/// `(reference − floor) / reference × 100`. Undefined for a non-positive reference.
pub fn percent_diff(floor: f64, reference: f64) -> Option<f64> {
    if !floor.is_finite() || !reference.is_finite() || reference <= 0.0 {
        return None;
    }
    Some((reference - floor) / reference * 100.0)
}

/// Same as `percent_diff` with a fixed absolute fee taken off the numerator.
pub fn percent_diff_with_fee(floor: f64, reference: f64, fee: f64) -> Option<f64> {
    percent_diff(floor + fee, reference)
}

fn snapshot_for<'a>(market: Marketplace, tonnel: &'a MarketSnapshot, portals: &'a MarketSnapshot) -> &'a MarketSnapshot {
    match market {
        Marketplace::Tonnel => tonnel,
        Marketplace::Portals => portals,
    }
}

/// Every direction whose prices are known, in priority order.
pub fn compute_diffs(tonnel: &MarketSnapshot, portals: &MarketSnapshot, fee: f64) -> Vec<DirectionDiff> {
    Direction::ALL
        .into_iter()
        .filter_map(|direction| {
            let floor = snapshot_for(direction.buy_market(), tonnel, portals).floor_price()?;
            let reference_side = snapshot_for(direction.reference_market(), tonnel, portals);
            let reference = if direction.is_cross_market() {
                reference_side.floor_price()?
            } else {
                reference_side.second_floor_price()?
            };
            Some(DirectionDiff {
                direction,
                percent_diff: percent_diff(floor, reference)?,
                percent_diff_with_fee: if direction.is_cross_market() {
                    percent_diff_with_fee(floor, reference, fee)
                } else {
                    None
                },
            })
        })
        .collect()
}

/// Strict maximum; among equal maxima the earliest in `diffs` wins. A negative
/// maximum is no signal.
pub fn select_direction(diffs: &[DirectionDiff]) -> Option<DirectionDiff> {
    let mut best: Option<DirectionDiff> = None;
    for d in diffs {
        if best.map_or(true, |b| d.percent_diff > b.percent_diff) {
            best = Some(*d);
        }
    }
    best.filter(|b| b.percent_diff >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivityLevel, Listing, Venue};

    fn diff(direction: Direction, percent_diff: f64) -> DirectionDiff {
        DirectionDiff { direction, percent_diff, percent_diff_with_fee: None }
    }

    fn listing(market: Marketplace, price: f64) -> Listing {
        Listing {
            marketplace: market,
            collection_name: "Plush Pepe".to_string(),
            model_name: "Cozy Galaxy".to_string(),
            model_rarity_pct: 1.5,
            backdrop_name: "Onyx Black".to_string(),
            backdrop_rarity_pct: 2.0,
            price,
            external_id: "1".to_string(),
            raw_status: "listed".to_string(),
            gift_number: None,
        }
    }

    fn snapshot(market: Marketplace, floor: Option<f64>, second: Option<f64>) -> MarketSnapshot {
        MarketSnapshot {
            marketplace: market,
            floor: floor.map(|p| listing(market, p)),
            second_floor: second.map(|p| listing(market, p)),
            activity: Vec::new(),
            percentile_25: None,
            percentile_75: None,
            max_activity_price: None,
            last_sale: None,
            activity_level: ActivityLevel::Low,
            metadata: None,
            venue: Venue::Portals { attributes: Vec::new() },
        }
    }

    #[test]
    fn tied_maxima_resolve_to_the_earliest() {
        let diffs = [
            diff(Direction::TonnelFloor, 5.0),
            diff(Direction::TonnelToPortals, 12.0),
            diff(Direction::PortalsFloor, -1.0),
            diff(Direction::PortalsToTonnel, 12.0),
        ];
        assert_eq!(select_direction(&diffs).unwrap().direction, Direction::TonnelToPortals);
    }

    #[test]
    fn negative_maximum_is_no_signal() {
        let diffs = [diff(Direction::TonnelFloor, -5.0), diff(Direction::PortalsFloor, -0.1)];
        assert!(select_direction(&diffs).is_none());
        assert!(select_direction(&[]).is_none());
    }

    #[test]
    fn fee_comes_off_the_numerator() {
        let with_fee = percent_diff_with_fee(80.0, 100.0, 0.36).unwrap();
        assert!((with_fee - 19.64).abs() < 1e-9, "{with_fee}");
        assert_eq!(percent_diff(80.0, 100.0), Some(20.0));
        assert_eq!(percent_diff(80.0, 0.0), None);
    }

    #[test]
    fn four_directions_from_two_snapshots() {
        let tonnel = snapshot(Marketplace::Tonnel, Some(80.0), Some(100.0));
        let portals = snapshot(Marketplace::Portals, Some(120.0), Some(130.0));
        let diffs = compute_diffs(&tonnel, &portals, 0.36);
        let directions: Vec<Direction> = diffs.iter().map(|d| d.direction).collect();
        assert_eq!(directions, Direction::ALL.to_vec());

        assert_eq!(diffs[0].percent_diff, 20.0);
        assert!(diffs[0].percent_diff_with_fee.is_none());
        assert!((diffs[1].percent_diff - 100.0 / 3.0).abs() < 1e-9);
        assert!(diffs[1].percent_diff_with_fee.is_some());
        assert!(diffs[2].percent_diff_with_fee.is_none());
        assert!(diffs[3].percent_diff < 0.0);

        assert_eq!(select_direction(&diffs).unwrap().direction, Direction::TonnelToPortals);
    }

    #[test]
    fn missing_prices_skip_their_directions() {
        let tonnel = snapshot(Marketplace::Tonnel, Some(80.0), None);
        let portals = snapshot(Marketplace::Portals, None, None);
        assert!(compute_diffs(&tonnel, &portals, 0.36).is_empty());
    }
}
