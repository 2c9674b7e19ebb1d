//! Datafeed reading synthesizer (C5): resample + augment + restore.
//!
//! Turns a native datafeed's backing datastream readings (plus no-data
//! markers) into a uniform-grid series of `DfReading`s, applying
//! PCHIP-spline restoration for CONTINUOUS+AVG series, linear restoration
//! for totalizers, and zero/carry-forward augmentation for report-by-
//! exception SUM/LAST series. Implements the refactored `NewDfrCreator`
//! algorithm only (see DESIGN.md for why the older `DfrCreator` variant is
//! not reproduced).

use std::collections::BTreeMap;

use crate::config;
use crate::error::{CoreError, Result};
use crate::model::{
    AugmentationPolicy, DataAggType, Datafeed, Datastream, DfReading, DsReading, DsrOrNdm,
    NoDataMarker, NotToUseDfrType, VariableType,
};
use crate::repo::Repo;
use crate::spline::PchipInterpolator;
use crate::time_grid::{ceil_timestamp, create_grid};

/// Result of one synthesizer invocation for a single native datafeed.
#[derive(Debug, Default)]
pub struct SynthesisOutcome {
    /// Readings safe to persist (already filtered of `not_to_use` tags).
    pub committed: Vec<DfReading>,
    /// Whether this batch did not reach wall-clock/`end_rts` and another
    /// invocation should follow immediately at a shorter interval.
    pub is_catching_up: bool,
}

/// Run one synthesis cycle for `df` (native, backed by `ds`). Advances
/// `df.ts_to_start_with`/`last_reading_ts` and `ds.ts_to_start_with` in
/// place; callers persist the mutated entities and `outcome.committed`.
pub async fn synthesize(
    repo: &Repo,
    cursor_ts: i64,
    df: &mut Datafeed,
    ds: &mut Datastream,
    now: i64,
) -> Result<SynthesisOutcome> {
    let resample = df.time_resample;
    let mut start_rts = cursor_ts.max(df.ts_to_start_with);

    if ds.is_rbe && df.is_aug_on {
        start_rts = maybe_skip_dead_gap(repo, ds, df, start_rts).await?;
    }

    let end_rts = match resolve_end_rts(repo, ds, df, start_rts, now).await? {
        Some(e) => e,
        None => return Ok(SynthesisOutcome::default()),
    };

    if start_rts >= end_rts {
        return Ok(SynthesisOutcome::default());
    }

    let batching = &config::get().batching;
    let max_ds = batching.num_max_dsreadings_to_process;

    let mut batch_size_steps = (batching.num_max_dfreadings_to_process as i64).max(1);
    let mut extension = 0u32;
    let ext_cap = config::get().scheduling.spline_batch_extension_cap;

    loop {
        let ds_readings = repo.ds_readings_after(ds.id, start_rts, max_ds).await?;
        if ds_readings.is_empty() {
            return Ok(SynthesisOutcome::default());
        }

        let batch_end_rts = if ds.is_rbe && df.is_aug_on {
            (start_rts + batch_size_steps * resample).min(end_rts)
        } else {
            ceil_timestamp(ds_readings.last().unwrap().time, resample).min(end_rts)
        };

        if batch_end_rts <= start_rts {
            return Ok(SynthesisOutcome::default());
        }

        let in_window: Vec<DsReading> = ds_readings
            .into_iter()
            .filter(|r| r.time <= batch_end_rts)
            .collect();

        let nodata = if ds.is_rbe && df.is_aug_on {
            repo.nodata_markers_after(ds.id, start_rts, max_ds)
                .await?
                .into_iter()
                .filter(|m| m.time <= batch_end_rts)
                .collect()
        } else {
            Vec::new()
        };

        let mut produced = dispatch(repo, df, ds, start_rts, batch_end_rts, in_window, nodata).await?;

        let all_not_to_use = !produced.is_empty() && produced.iter().all(|r| r.not_to_use.is_some());
        if all_not_to_use && batch_end_rts < end_rts {
            extension += 1;
            if extension > ext_cap {
                return Err(CoreError::RestorationBatchOverflow {
                    limit: ext_cap as usize,
                });
            }
            batch_size_steps *= 2;
            continue;
        }

        produced.sort_by_key(|r| r.time);
        let stop_at = produced.iter().position(|r| r.not_to_use.is_some());

        let (committed, next_start): (Vec<DfReading>, i64) = match stop_at {
            None => (produced, batch_end_rts),
            Some(idx) => {
                let tag = produced[idx].not_to_use.unwrap();
                let tagged_ts = produced[idx].time;
                let next = match tag {
                    NotToUseDfrType::SplineUnclosed => {
                        if idx > 0 {
                            produced[idx - 1].time
                        } else {
                            tagged_ts - resample
                        }
                    }
                    NotToUseDfrType::Unclosed | NotToUseDfrType::SplineNotToUse => tagged_ts - resample,
                };
                (produced.into_iter().take(idx).collect(), next)
            }
        };

        df.ts_to_start_with = df.ts_to_start_with.max(next_start);
        if let Some(last) = committed.last() {
            df.last_reading_ts = df.last_reading_ts.max(last.time);
        }
        ds.ts_to_start_with = ds.ts_to_start_with.max(batch_end_rts);

        return Ok(SynthesisOutcome {
            committed,
            is_catching_up: batch_end_rts < end_rts,
        });
    }
}

/// RBE+augment window adjustment: skip a dead gap at the start of the
/// window when the last nodata period is still open, the first reading
/// after `start_rts` would otherwise begin mid-gap, or (LAST aggregation
/// with no prior reading at all) there is nothing sensible to carry
/// forward from.
async fn maybe_skip_dead_gap(repo: &Repo, ds: &Datastream, df: &Datafeed, start_rts: i64) -> Result<i64> {
    let last_marker = repo.last_nodata_marker_at_or_before(ds.id, start_rts).await?;
    let last_dsr = repo.last_ds_reading_at_or_before(ds.id, start_rts).await?;

    let is_nd_period_open = match (&last_marker, &last_dsr) {
        (Some(m), Some(r)) => m.time >= r.time,
        (Some(_), None) => true,
        _ => false,
    };

    let Some(first_after) = repo.ds_readings_after(ds.id, start_rts, 1).await?.into_iter().next() else {
        return Ok(start_rts);
    };

    let last_is_last_agg_with_no_prior = ds.agg_type == DataAggType::Last && last_dsr.is_none();

    let first_marker_after = repo.nodata_markers_after(ds.id, start_rts, 1).await?.into_iter().next();
    let marker_one_bin_past_start = first_marker_after
        .map(|m| m.time == start_rts + df.time_resample)
        .unwrap_or(false);

    if is_nd_period_open || last_is_last_agg_with_no_prior || marker_one_bin_past_start {
        let shifted = ceil_timestamp(first_after.time - df.time_resample, df.time_resample);
        Ok(start_rts.max(shifted))
    } else {
        Ok(start_rts)
    }
}

/// Resolve `end_rts`, or `None` when the synthesizer should yield nothing
/// this cycle.
async fn resolve_end_rts(repo: &Repo, ds: &Datastream, df: &Datafeed, start_rts: i64, now: i64) -> Result<Option<i64>> {
    let resample = df.time_resample;

    if ds.is_rbe && df.aug_policy == AugmentationPolicy::TillNow {
        let mut end_rts = ceil_timestamp(now - ds.till_now_margin, resample);

        if let Some(marker) = repo.last_nodata_marker_at_or_before(ds.id, end_rts).await? {
            let follower = repo.ds_readings_after(ds.id, marker.time, 1).await?;
            if follower.is_empty() {
                end_rts = end_rts.min(ceil_timestamp(marker.time, resample));
            }
        }
        return Ok(Some(end_rts));
    }

    let max_batch = config::get().batching.num_max_dsreadings_to_process;
    match repo.ds_readings_after(ds.id, start_rts, max_batch).await?.last() {
        Some(last) => Ok(Some(ceil_timestamp(last.time, resample))),
        None => Ok(None),
    }
}

async fn dispatch(
    _repo: &Repo,
    df: &Datafeed,
    ds: &Datastream,
    start_rts: i64,
    batch_end_rts: i64,
    readings: Vec<DsReading>,
    nodata: Vec<NoDataMarker>,
) -> Result<Vec<DfReading>> {
    let resample = df.time_resample;

    match (ds.agg_type, ds.is_totalizer, ds.var_type) {
        (DataAggType::Avg, _, VariableType::Continuous) => {
            restore_continuous_avg(_repo, df, start_rts, batch_end_rts, readings).await
        }
        (DataAggType::Sum, true, _) => {
            restore_totalizer(df, ds, start_rts, batch_end_rts, readings)
        }
        (DataAggType::Sum, false, _) => {
            if ds.is_rbe && df.is_aug_on {
                resample_and_augment(_repo, df, start_rts, batch_end_rts, readings, nodata, BinAgg::Sum).await
            } else {
                Ok(bin_direct(df.id, &readings, start_rts, batch_end_rts, resample, BinAgg::Sum))
            }
        }
        (DataAggType::Last, _, _) => {
            if ds.is_rbe && df.is_aug_on {
                resample_and_augment(_repo, df, start_rts, batch_end_rts, readings, nodata, BinAgg::Last).await
            } else {
                Ok(bin_direct(df.id, &readings, start_rts, batch_end_rts, resample, BinAgg::Last))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinAgg {
    Sum,
    Last,
}

fn bin_direct(df_id: u64, readings: &[DsReading], start_rts: i64, batch_end_rts: i64, resample: i64, agg: BinAgg) -> Vec<DfReading> {
    let mut bins: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for r in readings {
        if r.time > start_rts && r.time <= batch_end_rts {
            bins.entry(ceil_timestamp(r.time, resample)).or_default().push(r.value);
        }
    }
    bins.into_iter()
        .map(|(ts, vals)| {
            let value = match agg {
                BinAgg::Sum => vals.iter().sum(),
                BinAgg::Last => *vals.last().unwrap(),
            };
            let mut reading = DfReading::new(df_id, ts, value, false);
            if ts == batch_end_rts {
                reading.not_to_use = Some(NotToUseDfrType::Unclosed);
            }
            reading
        })
        .collect()
}

/// RBE+augment resample: merge ds readings and nodata markers by time
/// (marker after reading on a tie), carry a nodata-period-open flag across
/// the grid, and fill empty non-nodata bins with zero (SUM) or the last
/// known value (LAST, carried forward — seeded from any existing DF
/// reading at `start_rts`).
async fn resample_and_augment(
    repo: &Repo,
    df: &Datafeed,
    start_rts: i64,
    end_rts: i64,
    readings: Vec<DsReading>,
    nodata: Vec<NoDataMarker>,
    agg: BinAgg,
) -> Result<Vec<DfReading>> {
    let resample = df.time_resample;
    let grid = create_grid(start_rts, end_rts, resample)?;

    let mut merged: Vec<DsrOrNdm> = readings.into_iter().map(DsrOrNdm::Reading).collect();
    merged.extend(nodata.into_iter().map(DsrOrNdm::NoData));
    merged.sort_by_key(|m| (m.time(), matches!(m, DsrOrNdm::Reading(_)) as u8 * 0 + matches!(m, DsrOrNdm::NoData(_)) as u8));

    let mut seed_value = repo.df_reading_at(df.id, start_rts).await?.map(|r| r.value);

    let mut bins: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    let mut bin_has_marker_last: BTreeMap<i64, bool> = BTreeMap::new();
    for item in &merged {
        let bin_ts = ceil_timestamp(item.time(), resample);
        if bin_ts <= start_rts || bin_ts > end_rts {
            continue;
        }
        match item {
            DsrOrNdm::Reading(r) => {
                bins.entry(bin_ts).or_default().push(r.value);
                bin_has_marker_last.insert(bin_ts, false);
            }
            DsrOrNdm::NoData(_) => {
                bin_has_marker_last.insert(bin_ts, true);
            }
        }
    }

    let mut out = Vec::new();
    let mut nd_period_open = false;

    for &ts in grid.iter().filter(|&&t| t > start_rts) {
        let is_marker_last = bin_has_marker_last.get(&ts).copied().unwrap_or(false);
        let has_readings = bins.get(&ts).map(|v| !v.is_empty()).unwrap_or(false);

        if has_readings {
            nd_period_open = is_marker_last;
            let vals = &bins[&ts];
            let value = match agg {
                BinAgg::Sum => vals.iter().sum(),
                BinAgg::Last => *vals.last().unwrap(),
            };
            seed_value = Some(value);
            let mut reading = DfReading::new(df.id, ts, value, false);
            if ts == end_rts {
                reading.not_to_use = Some(NotToUseDfrType::Unclosed);
            }
            out.push(reading);
        } else if bin_has_marker_last.contains_key(&ts) {
            nd_period_open = true;
        } else if !nd_period_open {
            let value = match agg {
                BinAgg::Sum => 0.0,
                BinAgg::Last => seed_value.unwrap_or(0.0),
            };
            seed_value = Some(value);
            let mut reading = DfReading::new(df.id, ts, value, true);
            if ts == end_rts {
                reading.not_to_use = Some(NotToUseDfrType::Unclosed);
            }
            out.push(reading);
        }
        // nd period still open and bin empty: no reading emitted for this bin.
    }

    Ok(out)
}

/// CONTINUOUS+AVG restoration: bin to per-grid-point arithmetic means, tag
/// the trailing (still-accumulating) bin `UNCLOSED`, then PCHIP-spline-fill
/// gaps within clusters of native points no further than `time_change`
/// apart. All clusters but the last are fully trusted; the last cluster is
/// tagged per its length (§4.5).
async fn restore_continuous_avg(
    repo: &Repo,
    df: &Datafeed,
    start_rts: i64,
    batch_end_rts: i64,
    readings: Vec<DsReading>,
) -> Result<Vec<DfReading>> {
    let resample = df.time_resample;
    let mut bins: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for r in &readings {
        if r.time > start_rts && r.time <= batch_end_rts {
            bins.entry(ceil_timestamp(r.time, resample)).or_default().push(r.value);
        }
    }

    let mut knots: Vec<(i64, f64)> = bins
        .into_iter()
        .map(|(ts, vals)| (ts, vals.iter().sum::<f64>() / vals.len() as f64))
        .collect();

    if knots.is_empty() {
        return Ok(Vec::new());
    }

    let max_bin_ts = knots.last().unwrap().0;

    if df.is_rest_on {
        let mut prior = repo.last_n_df_readings_before(df.id, start_rts, 3).await?; // newest first
        prior.reverse(); // oldest first
        let mut prepend = Vec::new();
        for p in prior {
            if let Some(&(first_ts, _)) = knots.first() {
                if first_ts - p.time <= df.time_change {
                    prepend.push((p.time, p.value));
                }
            }
        }
        prepend.extend(knots);
        knots = prepend;
    }

    // form clusters by gap <= time_change
    let mut clusters: Vec<Vec<(i64, f64)>> = Vec::new();
    for knot in knots {
        match clusters.last_mut() {
            Some(last) if knot.0 - last.last().unwrap().0 <= df.time_change => last.push(knot),
            _ => clusters.push(vec![knot]),
        }
    }

    let mut out: Vec<DfReading> = Vec::new();
    let n_clusters = clusters.len();

    for (ci, cluster) in clusters.into_iter().enumerate() {
        let is_last_cluster = ci == n_clusters - 1;

        if cluster.len() == 1 {
            let (ts, v) = cluster[0];
            if ts <= start_rts {
                continue;
            }
            let mut reading = DfReading::new(df.id, ts, v, false);
            if is_last_cluster {
                reading.not_to_use = Some(NotToUseDfrType::SplineNotToUse);
            }
            out.push(reading);
            continue;
        }

        // Short last clusters (2 or 3 native points) are not trusted at all:
        // every point they'd produce (native knots and any interpolated gap
        // fill between them) is tagged SPLINE_NOT_TO_USE. A long last cluster
        // (>=4) is fully spline-filled up to (excluding) its last knot, which
        // alone is tagged SPLINE_UNCLOSED.
        let untrusted_tail = is_last_cluster && cluster.len() < 4;

        let xs: Vec<f64> = cluster.iter().map(|(t, _)| *t as f64).collect();
        let ys: Vec<f64> = cluster.iter().map(|(_, v)| *v).collect();
        let spline = PchipInterpolator::new(xs, ys);

        let fill_up_to_idx = if is_last_cluster && !untrusted_tail {
            cluster.len() - 2
        } else {
            cluster.len() - 1
        };
        let first_ts = cluster[0].0;
        let last_fill_ts = cluster[fill_up_to_idx].0;

        let mut ts = first_ts;
        while ts <= last_fill_ts {
            if ts > start_rts {
                let native = cluster.iter().find(|(t, _)| *t == ts);
                let (value, restored) = match native {
                    Some((_, v)) => (*v, false),
                    None => (spline.eval(ts as f64), true),
                };
                let mut reading = DfReading::new(df.id, ts, value, restored);
                if untrusted_tail {
                    reading.not_to_use = Some(NotToUseDfrType::SplineNotToUse);
                }
                out.push(reading);
            }
            ts += resample;
        }

        if is_last_cluster && !untrusted_tail {
            let (ts, v) = cluster[fill_up_to_idx + 1];
            if ts > start_rts {
                let mut reading = DfReading::new(df.id, ts, v, false);
                reading.not_to_use = Some(NotToUseDfrType::SplineUnclosed);
                out.push(reading);
            }
        }
    }

    out.retain(|r| r.time <= max_bin_ts);
    if let Some(max_reading) = out.iter_mut().filter(|r| r.time == max_bin_ts).last() {
        if max_reading.not_to_use.is_none() {
            max_reading.not_to_use = Some(NotToUseDfrType::Unclosed);
        }
    }

    Ok(out)
}

/// Totalizer (SUM + `is_totalizer`) restoration: last-value per bin, with
/// linear interpolation across gaps `<= time_change` when `is_rest_on` and
/// the datastream is non-RBE (totalizers read on a fixed schedule). Per the
/// Open Question resolution in DESIGN.md, the not-to-use tag applies only
/// to the chronologically last produced bin.
fn restore_totalizer(df: &Datafeed, ds: &Datastream, start_rts: i64, batch_end_rts: i64, readings: Vec<DsReading>) -> Result<Vec<DfReading>> {
    let resample = df.time_resample;
    let mut bins: BTreeMap<i64, f64> = BTreeMap::new();
    for r in &readings {
        if r.time > start_rts && r.time <= batch_end_rts {
            bins.insert(ceil_timestamp(r.time, resample), r.value);
        }
    }

    let mut native: Vec<(i64, f64)> = bins.into_iter().collect();
    if native.is_empty() {
        return Ok(Vec::new());
    }

    let mut out: Vec<DfReading> = Vec::new();
    let mut last_gap_restorable = false;

    if df.is_rest_on && !ds.is_rbe {
        let mut filled = Vec::new();
        for w in native.windows(2) {
            let (t0, v0) = w[0];
            let (t1, v1) = w[1];
            filled.push(DfReading::new(df.id, t0, v0, false));
            let gap = t1 - t0;
            last_gap_restorable = gap > resample && gap <= df.time_change;
            if last_gap_restorable {
                let mut ts = t0 + resample;
                while ts < t1 {
                    let frac = (ts - t0) as f64 / (t1 - t0) as f64;
                    let value = v0 + (v1 - v0) * frac;
                    filled.push(DfReading::new(df.id, ts, value, true));
                    ts += resample;
                }
            }
        }
        filled.push(DfReading::new(df.id, native.last().unwrap().0, native.last().unwrap().1, false));
        out = filled;
    } else {
        out = native
            .drain(..)
            .map(|(ts, v)| DfReading::new(df.id, ts, v, false))
            .collect();
    }

    out.sort_by_key(|r| r.time);
    if let Some(last) = out.last_mut() {
        last.not_to_use = Some(if last_gap_restorable {
            NotToUseDfrType::SplineUnclosed
        } else {
            NotToUseDfrType::SplineNotToUse
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlarmMap, HealthGrade};

    fn test_df(id: u64, resample: i64, time_change: i64, is_rest_on: bool) -> Datafeed {
        Datafeed {
            id,
            datastream_id: Some(1),
            application_id: Some(1),
            name: "flow".into(),
            df_type: crate::model::DfType::None,
            time_resample: resample,
            time_change,
            agg_type: DataAggType::Avg,
            var_type: VariableType::Continuous,
            is_totalizer: false,
            is_rest_on,
            is_aug_on: false,
            aug_policy: AugmentationPolicy::TillLastDfReading,
            ts_to_start_with: 0,
            last_reading_ts: 0,
            update_fields: Default::default(),
        }
    }

    fn test_ds(is_rbe: bool, is_totalizer: bool, agg: DataAggType, var: VariableType) -> Datastream {
        Datastream {
            id: 1,
            device_id: 1,
            name: "flow".into(),
            is_enabled: true,
            is_value_integer: false,
            is_rbe,
            var_type: var,
            agg_type: agg,
            is_totalizer,
            min_plausible_value: -1e9,
            max_plausible_value: 1e9,
            max_rate_of_change: 1e9,
            errors: AlarmMap::new(),
            warnings: AlarmMap::new(),
            msg_health: HealthGrade::Undefined,
            nd_health: HealthGrade::Undefined,
            health: HealthGrade::Undefined,
            ts_to_start_with: -1,
            last_valid_reading_ts: 0,
            time_update: None,
            health_next_eval_ts: None,
            time_nd_health_error: crate::config::defaults::DEFAULT_TIME_ND_HEALTH_ERROR_MS,
            till_now_margin: 0,
            created_ts: 0,
            update_fields: Default::default(),
        }
    }

    fn test_repo() -> Repo {
        static DIR: std::sync::OnceLock<tempfile::TempDir> = std::sync::OnceLock::new();
        let dir = DIR.get_or_init(|| tempfile::tempdir().expect("tempdir"));
        let _ = crate::store::open(dir.path());
        Repo::open().expect("open repo")
    }

    #[tokio::test]
    async fn continuous_avg_restore_tags_long_tail_cluster_only_last() {
        // is_rest_on=false so restore_continuous_avg never queries the repo;
        // a real one is still needed to satisfy the function signature.
        let repo = test_repo();
        let df = test_df(7, 60_000, 180_000, false);
        let readings: Vec<DsReading> = vec![(60_000, 10.0), (120_000, 12.0), (180_000, 14.0), (240_000, 20.0)]
            .into_iter()
            .map(|(t, v)| DsReading { datastream_id: 1, time: t, value: v })
            .collect();

        let out = restore_continuous_avg(&repo, &df, 0, 240_000, readings).await.unwrap();

        // cluster length 4 (>= 4): the three leading knots are trusted and
        // untagged, only the final knot carries SPLINE_UNCLOSED.
        assert_eq!(out.len(), 4);
        for r in &out[..3] {
            assert_eq!(r.not_to_use, None);
        }
        assert_eq!(out[3].time, 240_000);
        assert_eq!(out[3].not_to_use, Some(NotToUseDfrType::SplineUnclosed));
    }

    #[tokio::test]
    async fn continuous_avg_restore_untrusts_short_tail_cluster() {
        let repo = test_repo();
        let df = test_df(7, 60_000, 180_000, false);
        // only 2 native knots in the (only, hence last) cluster: both must
        // be tagged SPLINE_NOT_TO_USE, not just the final one.
        let readings: Vec<DsReading> = vec![(60_000, 10.0), (120_000, 12.0)]
            .into_iter()
            .map(|(t, v)| DsReading { datastream_id: 1, time: t, value: v })
            .collect();

        let out = restore_continuous_avg(&repo, &df, 0, 120_000, readings).await.unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].not_to_use, Some(NotToUseDfrType::SplineNotToUse));
        assert_eq!(out[1].not_to_use, Some(NotToUseDfrType::SplineNotToUse));
    }

    #[test]
    fn totalizer_restore_interpolates_gap_and_tags_last() {
        let df = test_df(8, 60_000, 300_000, true);
        let ds = test_ds(false, true, DataAggType::Sum, VariableType::Continuous);
        let readings = vec![
            DsReading { datastream_id: 1, time: 60_000, value: 100.0 },
            DsReading { datastream_id: 1, time: 180_000, value: 130.0 },
        ];
        let out = restore_totalizer(&df, &ds, 0, 180_000, readings).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].time, 60_000);
        assert_eq!(out[0].value, 100.0);
        assert_eq!(out[1].time, 120_000);
        assert!((out[1].value - 115.0).abs() < 1e-9);
        assert!(out[1].restored);
        assert_eq!(out[2].time, 180_000);
        assert_eq!(out[2].not_to_use, Some(NotToUseDfrType::SplineUnclosed));
    }

    #[test]
    fn bin_direct_sums_multiple_readings_per_bin() {
        let readings = vec![
            DsReading { datastream_id: 1, time: 10_000, value: 1.0 },
            DsReading { datastream_id: 1, time: 20_000, value: 2.0 },
        ];
        let out = bin_direct(9, &readings, 0, 60_000, 60_000, BinAgg::Sum);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 3.0);
        assert_eq!(out[0].not_to_use, Some(NotToUseDfrType::Unclosed));
    }
}
