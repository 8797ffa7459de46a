//! Source attribution for circuit-level consumption
//!
//! House generation is shared across circuits in proportion to each
//! circuit's share of the total house load: solar covers its share first,
//! battery discharge covers what solar could not, and the remainder is
//! grid import. Generation beyond the whole-house load is export, carried
//! at house level; a circuit attribution never goes negative and never
//! exceeds the circuit's own draw.

use crate::types::{HouseFlow, PowerFlow, SourceMix, SourceSplit};

/// Loads below this count as zero to keep the share division sane
const MIN_LOAD_W: f64 = 1.0;

/// A hub sample that cannot participate in attribution
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttributionError {
    #[error("hub reported a non-finite power value")]
    InvalidFlow,
}

/// Checks a hub sample before it is used for a cycle.
///
/// On failure the caller degrades the cycle to grid-only attribution.
pub fn check_flow(flow: &PowerFlow) -> Result<(), AttributionError> {
    if flow.solar_w.is_finite() && flow.battery_w.is_finite() {
        Ok(())
    } else {
        Err(AttributionError::InvalidFlow)
    }
}

/// Splits one circuit's draw across solar, battery, and grid.
///
/// With a near-zero house load the split is all-zero rather than a division
/// blow-up; callers treat that cycle as unattributed.
pub fn attribute(watts: f64, house_load_w: f64, flow: &PowerFlow) -> SourceSplit {
    if watts <= 0.0 || house_load_w < MIN_LOAD_W {
        return SourceSplit::default();
    }

    let share = watts / house_load_w;
    let solar = (flow.solar_w.max(0.0) * share).min(watts);
    // charging batteries are a load, not a source
    let discharge = flow.battery_w.max(0.0);
    let battery = (discharge * share).min(watts - solar);
    let grid = (watts - solar - battery).max(0.0);

    SourceSplit {
        solar_w: solar,
        battery_w: battery,
        grid_w: grid,
    }
}

/// Builds the whole-house panel view for one cycle.
///
/// `grid_w` goes negative while generation exceeds load; the excess is also
/// reported as `export_w`.
pub fn house_flow(load_w: f64, flow: Option<&PowerFlow>) -> HouseFlow {
    let (solar, discharge, soc) = match flow {
        Some(f) => (f.solar_w.max(0.0), f.battery_w.max(0.0), f.battery_soc),
        None => (0.0, 0.0, None),
    };

    let generation = solar + discharge;
    HouseFlow {
        load_w,
        solar_w: solar,
        battery_w: discharge,
        grid_w: load_w - generation,
        export_w: (generation - load_w).max(0.0),
        battery_soc: soc,
        mix: source_mix(load_w, solar, discharge),
    }
}

/// Percentages are shares of total supply, not of house load, so a house
/// that is exporting still shows where its power comes from.
fn source_mix(load_w: f64, solar_w: f64, battery_w: f64) -> SourceMix {
    let grid_supply = (load_w - solar_w - battery_w).max(0.0);
    let total = solar_w + battery_w + grid_supply;
    if total < MIN_LOAD_W {
        return SourceMix::default();
    }
    SourceMix {
        solar_pct: solar_w / total * 100.0,
        battery_pct: battery_w / total * 100.0,
        grid_pct: grid_supply / total * 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    fn solar_only(watts: f64) -> PowerFlow {
        PowerFlow {
            solar_w: watts,
            battery_w: 0.0,
            battery_soc: None,
        }
    }

    #[test]
    fn test_proportional_solar_split() {
        // 800 W of solar over a 1500 W house: a 1000 W circuit gets two
        // thirds of it, a 500 W circuit one third
        let flow = solar_only(800.0);

        let big = attribute(1000.0, 1500.0, &flow);
        assert!(close(big.solar_w, 533.333333));
        assert!(close(big.battery_w, 0.0));
        assert!(close(big.grid_w, 466.666667));

        let small = attribute(500.0, 1500.0, &flow);
        assert!(close(small.solar_w, 266.666667));
        assert!(close(small.grid_w, 233.333333));
    }

    #[test]
    fn test_split_sums_to_circuit_draw() {
        let flow = PowerFlow {
            solar_w: 1200.0,
            battery_w: 300.0,
            battery_soc: Some(81.0),
        };
        for watts in [0.5, 40.0, 350.0, 2200.0] {
            let split = attribute(watts, 2590.5, &flow);
            assert!(close(split.total(), watts), "watts {watts}");
        }
    }

    #[test]
    fn test_battery_covers_after_solar() {
        let flow = PowerFlow {
            solar_w: 500.0,
            battery_w: 400.0,
            battery_soc: None,
        };
        let split = attribute(1000.0, 1000.0, &flow);
        assert!(close(split.solar_w, 500.0));
        assert!(close(split.battery_w, 400.0));
        assert!(close(split.grid_w, 100.0));
    }

    #[test]
    fn test_attribution_capped_at_circuit_draw() {
        // abundant generation fully covers the circuit, never exceeds it
        let flow = solar_only(5000.0);
        let split = attribute(100.0, 1000.0, &flow);
        assert!(close(split.solar_w, 100.0));
        assert!(close(split.battery_w, 0.0));
        assert!(close(split.grid_w, 0.0));
    }

    #[test]
    fn test_zero_house_load_yields_zero_split() {
        let flow = solar_only(800.0);
        assert_eq!(attribute(120.0, 0.0, &flow), SourceSplit::default());
        assert_eq!(attribute(120.0, 0.4, &flow), SourceSplit::default());
    }

    #[test]
    fn test_no_flow_is_grid_only() {
        let split = attribute(750.0, 1500.0, &PowerFlow::default());
        assert_eq!(split, SourceSplit::grid_only(750.0));
    }

    #[test]
    fn test_charging_battery_contributes_nothing() {
        let flow = PowerFlow {
            solar_w: 0.0,
            battery_w: -1200.0,
            battery_soc: Some(40.0),
        };
        let split = attribute(600.0, 1000.0, &flow);
        assert_eq!(split, SourceSplit::grid_only(600.0));

        let house = house_flow(1000.0, Some(&flow));
        assert!(close(house.battery_w, 0.0));
        assert!(close(house.grid_w, 1000.0));
    }

    #[test]
    fn test_house_export() {
        let house = house_flow(1000.0, Some(&solar_only(3000.0)));
        assert!(close(house.grid_w, -2000.0));
        assert!(close(house.export_w, 2000.0));
        assert!(close(house.mix.solar_pct, 100.0));
        assert!(close(house.mix.grid_pct, 0.0));
    }

    #[test]
    fn test_house_mix_percentages() {
        let flow = PowerFlow {
            solar_w: 500.0,
            battery_w: 250.0,
            battery_soc: Some(77.5),
        };
        let house = house_flow(1000.0, Some(&flow));
        assert!(close(house.mix.solar_pct, 50.0));
        assert!(close(house.mix.battery_pct, 25.0));
        assert!(close(house.mix.grid_pct, 25.0));
        assert_eq!(house.battery_soc, Some(77.5));
    }

    #[test]
    fn test_mix_is_supply_based_while_exporting() {
        // exporting house: shares are of total generation, not of load
        let flow = PowerFlow {
            solar_w: 2000.0,
            battery_w: 500.0,
            battery_soc: None,
        };
        let house = house_flow(1000.0, Some(&flow));
        assert!(close(house.mix.solar_pct, 80.0));
        assert!(close(house.mix.battery_pct, 20.0));
        assert!(close(house.mix.grid_pct, 0.0));
        assert!(close(house.export_w, 1500.0));
    }

    #[test]
    fn test_house_flow_without_hub() {
        let house = house_flow(900.0, None);
        assert!(close(house.grid_w, 900.0));
        assert!(close(house.export_w, 0.0));
        assert!(close(house.mix.grid_pct, 100.0));
        assert_eq!(house.battery_soc, None);
    }

    #[test]
    fn test_check_flow_rejects_non_finite() {
        let bad = PowerFlow {
            solar_w: f64::NAN,
            battery_w: 0.0,
            battery_soc: None,
        };
        assert_eq!(check_flow(&bad), Err(AttributionError::InvalidFlow));
        assert!(check_flow(&solar_only(100.0)).is_ok());
    }
}
