//! Raw reading classification (C2): acceptance-window sorting, plausibility
//! validation, and rate-of-change filtering, the triage a `Datastream`'s
//! incoming `{timestamp: value}` pairs go through before becoming canonical
//! `DsReading`s.

use std::collections::BTreeMap;

use crate::model::{
    Datastream, DsReading, InvalidDsReading, NoDataMarker, NonRocDsReading, UnusedDsReading, UnusedNoDataMarker,
};

/// Output of [`create_ds_readings`].
#[derive(Debug, Default)]
pub struct ClassifiedReadings {
    pub accepted: Vec<DsReading>,
    pub unused: Vec<UnusedDsReading>,
    pub invalid: Vec<InvalidDsReading>,
    pub non_roc: Vec<NonRocDsReading>,
}

/// Split incoming `{ts: value}` pairs into those inside the datastream's
/// acceptance window `(ts_to_start_with, now)` and those outside it.
pub fn sort_unused_ds_readings(
    pairs: &BTreeMap<i64, f64>,
    ds: &Datastream,
    now: i64,
) -> (Vec<DsReading>, Vec<UnusedDsReading>) {
    let mut used = Vec::new();
    let mut unused = Vec::new();
    for (&ts, &value) in pairs {
        if ts > ds.ts_to_start_with && ts < now {
            used.push(DsReading {
                datastream_id: ds.id,
                time: ts,
                value,
            });
        } else {
            unused.push(UnusedDsReading {
                datastream_id: ds.id,
                time: ts,
                value,
            });
        }
    }
    (used, unused)
}

/// Drop readings outside `[min_plausible_value, max_plausible_value]`.
pub fn validate_ds_readings(
    readings: Vec<DsReading>,
    ds: &Datastream,
) -> (Vec<DsReading>, Vec<InvalidDsReading>) {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for r in readings {
        if r.value <= ds.max_plausible_value && r.value >= ds.min_plausible_value {
            valid.push(r);
        } else {
            invalid.push(InvalidDsReading {
                datastream_id: r.datastream_id,
                time: r.time,
                value: r.value,
            });
        }
    }
    (valid, invalid)
}

/// Clamp readings whose rate of change from the previous accepted value
/// exceeds `ds.max_rate_of_change` (units per second). `base_point` is the
/// last persisted reading strictly before `readings[0].time`, if any; when
/// absent the filter seeds itself from the first incoming reading (so the
/// first point in a fresh series is never clamped against itself).
///
/// Only applies to CONTINUOUS + AVG datastreams — callers gate on that
/// before invoking this.
pub fn roc_filter_ds_readings(
    mut readings: Vec<DsReading>,
    ds: &Datastream,
    base_point: Option<(i64, f64)>,
) -> (Vec<DsReading>, Vec<NonRocDsReading>) {
    readings.sort_by_key(|r| r.time);

    let mut non_roc = Vec::new();
    if readings.is_empty() {
        return (readings, non_roc);
    }

    let (mut prev_ts, mut prev_val) = base_point.unwrap_or((readings[0].time, readings[0].value));

    for r in readings.iter_mut() {
        let sign: f64 = if r.value - prev_val < 0.0 { -1.0 } else { 1.0 };
        let limit_value = prev_val + sign * ds.max_rate_of_change * (r.time - prev_ts) as f64 / 1000.0;

        let overshoot = (sign > 0.0 && limit_value < r.value) || (sign < 0.0 && limit_value > r.value);
        if overshoot {
            non_roc.push(NonRocDsReading {
                datastream_id: r.datastream_id,
                time: r.time,
                value: r.value,
            });
            r.value = limit_value;
        }

        prev_val = r.value;
        prev_ts = r.time;
    }

    (readings, non_roc)
}

/// Whether `ds` is subject to rate-of-change filtering: CONTINUOUS variable
/// type aggregated with AVG.
pub fn is_roc_filtered(ds: &Datastream) -> bool {
    use crate::model::{DataAggType, VariableType};
    ds.var_type == VariableType::Continuous && ds.agg_type == DataAggType::Avg
}

/// Full classification pipeline for one datastream's cycle of incoming
/// readings.
pub fn create_ds_readings(
    pairs: &BTreeMap<i64, f64>,
    ds: &Datastream,
    now: i64,
    base_point: Option<(i64, f64)>,
) -> ClassifiedReadings {
    let (used, unused) = sort_unused_ds_readings(pairs, ds, now);
    let (valid, invalid) = validate_ds_readings(used, ds);

    let (accepted, non_roc) = if is_roc_filtered(ds) {
        roc_filter_ds_readings(valid, ds, base_point)
    } else {
        (valid, Vec::new())
    };

    ClassifiedReadings {
        accepted,
        unused,
        invalid,
        non_roc,
    }
}

/// Split incoming no-data timestamps by the same acceptance window used for
/// value readings.
pub fn create_nodata_markers(
    tss: impl IntoIterator<Item = i64>,
    ds: &Datastream,
    now: i64,
) -> (Vec<NoDataMarker>, Vec<UnusedNoDataMarker>) {
    let from_ts = ds.ts_to_start_with;
    let mut markers = Vec::new();
    let mut unused = Vec::new();
    for ts in tss {
        if ts > from_ts && ts < now {
            markers.push(NoDataMarker {
                datastream_id: ds.id,
                time: ts,
            });
        } else {
            unused.push(UnusedNoDataMarker {
                datastream_id: ds.id,
                time: ts,
            });
        }
    }
    (markers, unused)
}
