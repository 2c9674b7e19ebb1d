//! Timestamp grid arithmetic shared by the classifier, synthesizer and
//! restoration passes. All timestamps are milliseconds since the epoch.

use crate::error::{CoreError, Result};

/// Round a timestamp up to the next multiple of `interval`. If `ts` already
/// falls on the grid, it is returned unchanged.
pub fn ceil_timestamp(ts: i64, interval: i64) -> i64 {
    let k = ts.div_euclid(interval);
    let modulo = ts.rem_euclid(interval);
    let k = if modulo > 0 { k + 1 } else { k };
    k * interval
}

/// Round a timestamp down to the nearest multiple of `interval`.
pub fn floor_timestamp(ts: i64, interval: i64) -> i64 {
    ts.div_euclid(interval) * interval
}

/// Build the closed grid `[start_rts, end_rts]` stepping by `time_resample`.
///
/// `end_rts` must be reachable from `start_rts` in whole steps of
/// `time_resample`; callers are expected to have already rounded both ends
/// to the grid (typically via [`ceil_timestamp`]).
pub fn create_grid(start_rts: i64, end_rts: i64, time_resample: i64) -> Result<Vec<i64>> {
    if end_rts < start_rts {
        return Err(CoreError::Validation(
            "create_grid: end_rts < start_rts".to_string(),
        ));
    }
    if (end_rts - start_rts) % time_resample != 0 {
        return Err(CoreError::Validation(
            "create_grid: (end_rts - start_rts) % time_resample != 0".to_string(),
        ));
    }

    let mut grid = vec![start_rts];
    let mut ts = start_rts;
    while ts < end_rts {
        ts += time_resample;
        grid.push(ts);
    }
    Ok(grid)
}

/// Round a raw reading value for persistence: integer-typed variables round
/// to the nearest whole number, continuous variables keep full precision.
pub fn round_for_storage(value: f64, is_integer_valued: bool) -> f64 {
    if is_integer_valued {
        value.round()
    } else {
        value
    }
}

/// Round a value for external/API presentation to 3 decimal places.
pub fn round_for_api(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_rounds_up_to_next_multiple() {
        assert_eq!(ceil_timestamp(1000, 60_000), 60_000);
        assert_eq!(ceil_timestamp(60_000, 60_000), 60_000);
        assert_eq!(ceil_timestamp(60_001, 60_000), 120_000);
    }

    #[test]
    fn floor_rounds_down() {
        assert_eq!(floor_timestamp(60_001, 60_000), 60_000);
        assert_eq!(floor_timestamp(60_000, 60_000), 60_000);
    }

    #[test]
    fn grid_includes_both_ends() {
        let grid = create_grid(0, 180_000, 60_000).unwrap();
        assert_eq!(grid, vec![0, 60_000, 120_000, 180_000]);
    }

    #[test]
    fn grid_single_point_when_equal() {
        let grid = create_grid(60_000, 60_000, 60_000).unwrap();
        assert_eq!(grid, vec![60_000]);
    }

    #[test]
    fn grid_rejects_misaligned_span() {
        assert!(create_grid(0, 100_000, 60_000).is_err());
    }

    #[test]
    fn grid_rejects_inverted_span() {
        assert!(create_grid(60_000, 0, 60_000).is_err());
    }

    #[test]
    fn api_rounding_keeps_three_decimals() {
        assert_eq!(round_for_api(1.0 / 3.0), 0.333);
    }
}
