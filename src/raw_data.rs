//! Raw-data processor (C4): the per-device routine MQTT ingress drives for
//! every payload — classify readings, fold alarm activity, derive
//! `msg_health`, and persist everything in one all-or-nothing step.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::alarm_state::{update_alarm_map, AlarmMapKind};
use crate::classifier::create_ds_readings;
use crate::config;
use crate::error::Result;
use crate::model::{
    at_least_one_alarm_in, AlarmMap, Datastream, Device, HealthGrade, IncomingAlarmDict,
};
use crate::repo::Repo;
use crate::scheduling::{self, ChangeTracker, PendingPublish};
use crate::store;

/// One datastream's row within a timestamp's device payload.
#[derive(Debug, Clone, Default)]
pub struct RawDsRow {
    pub v: Option<f64>,
    pub errors: IncomingAlarmDict,
    pub warnings: IncomingAlarmDict,
    pub infos: Vec<String>,
}

/// One timestamp's worth of a device payload: device-level alarms plus
/// per-datastream rows keyed by datastream name.
#[derive(Debug, Clone, Default)]
pub struct RawRow {
    pub errors: IncomingAlarmDict,
    pub warnings: IncomingAlarmDict,
    pub infos: Vec<String>,
    pub ds_rows: BTreeMap<String, RawDsRow>,
}

/// A decoded device payload, already sorted ascending by timestamp (the
/// `BTreeMap` key order) — §6's generic or Chirpstack shape, post-parse.
pub type DevicePayload = BTreeMap<i64, RawRow>;

/// Decode one device's body (the `"<ts_ms_decimal_string>": {...}` object)
/// under §6's generic shape into a [`DevicePayload`], logging and skipping
/// any per-timestamp entry that doesn't parse rather than failing the whole
/// message.
pub fn decode_generic_device_body(dev_ui: &str, body: &serde_json::Value) -> DevicePayload {
    let mut out = DevicePayload::new();
    let Some(obj) = body.as_object() else {
        warn!(dev_ui, "device body is not a JSON object, dropping");
        return out;
    };

    for (ts_str, entry) in obj {
        let Ok(ts) = ts_str.parse::<i64>() else {
            warn!(dev_ui, ts_str, "non-numeric timestamp key, dropping entry");
            continue;
        };
        let Some(entry) = entry.as_object() else {
            warn!(dev_ui, ts, "timestamp entry is not a JSON object, dropping");
            continue;
        };

        let mut row = RawRow::default();
        for (key, value) in entry {
            match key.as_str() {
                "e" => row.errors = parse_incoming_alarm_dict(value),
                "w" => row.warnings = parse_incoming_alarm_dict(value),
                "i" => {
                    row.infos = value
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                        .unwrap_or_default();
                }
                ds_name => {
                    let Some(ds_entry) = value.as_object() else { continue };
                    let mut ds_row = RawDsRow::default();
                    for (dk, dv) in ds_entry {
                        match dk.as_str() {
                            "v" => ds_row.v = dv.as_f64(),
                            "e" => ds_row.errors = parse_incoming_alarm_dict(dv),
                            "w" => ds_row.warnings = parse_incoming_alarm_dict(dv),
                            "i" => {
                                ds_row.infos = dv
                                    .as_array()
                                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                                    .unwrap_or_default();
                            }
                            _ => {}
                        }
                    }
                    row.ds_rows.insert(ds_name.to_string(), ds_row);
                }
            }
        }
        out.insert(ts, row);
    }

    out
}

fn parse_incoming_alarm_dict(value: &serde_json::Value) -> IncomingAlarmDict {
    let Some(obj) = value.as_object() else { return IncomingAlarmDict::new() };
    obj.iter()
        .map(|(name, v)| {
            let st = v.as_object().and_then(|o| o.get("st")).and_then(|s| s.as_str()).map(str::to_string);
            (name.clone(), crate::model::IncomingAlarm { st })
        })
        .collect()
}

/// Decode one MQTT message's raw bytes (§6: generic or Chirpstack shape,
/// selected by whether `"chirpstack"` appears in the topic) into
/// `(dev_ui, DevicePayload)` pairs — a generic message may bundle several
/// devices in one payload, Chirpstack messages carry exactly one.
pub fn decode_mqtt_payload(topic: &str, bytes: &[u8]) -> Vec<(String, DevicePayload)> {
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        error!(topic, "invalid JSON in raw-data payload, dropping");
        return Vec::new();
    };

    if topic.contains("chirpstack") {
        let Some(dev_ui) = json.pointer("/deviceInfo/devEui").and_then(|v| v.as_str()) else {
            error!(topic, "chirpstack payload missing deviceInfo.devEui, dropping");
            return Vec::new();
        };
        let Some(object) = json.get("object") else {
            error!(topic, dev_ui, "chirpstack payload missing object, dropping");
            return Vec::new();
        };
        return vec![(dev_ui.to_string(), decode_generic_device_body(dev_ui, object))];
    }

    let Some(devices) = json.as_object() else {
        error!(topic, "generic payload is not a JSON object, dropping");
        return Vec::new();
    };
    devices
        .iter()
        .map(|(dev_ui, body)| (dev_ui.clone(), decode_generic_device_body(dev_ui, body)))
        .collect()
}

fn add_to_log(level: &str, alarm_name: &str, ts: i64, status: &str, scope: &str) {
    match level {
        "ERROR" => error!(scope, alarm_name, ts, status, "alarm transition"),
        _ => warn!(scope, alarm_name, ts, status, "alarm transition"),
    }
}

/// Recompute `msg_health` from an alarm map pair: ERROR if any error is
/// "in", WARNING else if any warning is "in", UNDEFINED otherwise.
pub fn derive_msg_health(errors: &AlarmMap, warnings: &AlarmMap) -> HealthGrade {
    if at_least_one_alarm_in(errors) {
        HealthGrade::Error
    } else if at_least_one_alarm_in(warnings) {
        HealthGrade::Warning
    } else {
        HealthGrade::Undefined
    }
}

/// Process one device's decoded payload end to end (§4.4). Drops silently
/// (logs and returns `Ok(())`) if the device is unknown. All datastream and
/// device mutations are computed in memory first and persisted only once
/// the whole payload has been classified without error, matching "any
/// exception aborts all writes for this payload".
pub async fn process_device_payload(
    repo: &Repo,
    publish_tx: &mpsc::UnboundedSender<PendingPublish>,
    dev_ui: &str,
    payload: DevicePayload,
    now: i64,
) -> Result<()> {
    let dev_ui = dev_ui.to_lowercase();
    let lock_key = format!("device:{dev_ui}");

    store::with_lock(&[lock_key], || async {
        let Some(mut device) = repo.device_by_dev_ui(&dev_ui).await? else {
            warn!(dev_ui, "raw-data payload for unknown device, dropping");
            return Ok(());
        };

        let mut datastreams = repo.datastreams_for_device(device.id).await?;

        // per-datastream accumulators across the whole payload
        let mut ds_pairs: BTreeMap<u64, BTreeMap<i64, f64>> = BTreeMap::new();
        let mut ds_nodata_tss: BTreeMap<u64, Vec<i64>> = BTreeMap::new();

        for (ts, row) in payload.iter() {
            let ts = *ts;
            let mut at_least_one_ds_has_no_errors_and_has_value = false;

            for ds in datastreams.iter_mut().filter(|d| d.is_enabled) {
                let ds_row = row.ds_rows.get(&ds.name).cloned().unwrap_or_default();
                let has_value = ds_row.v.is_some();

                let scope = format!("datastream:{}", ds.id);
                let (new_errors, nd_needed_e) = update_alarm_map(
                    &ds.errors,
                    Some(&ds_row.errors),
                    ts,
                    AlarmMapKind::Errors,
                    has_value,
                    |lvl, name, t, st| add_to_log(lvl, name, t, st, &scope),
                );
                let (new_warnings, _) = update_alarm_map(
                    &ds.warnings,
                    Some(&ds_row.warnings),
                    ts,
                    AlarmMapKind::Warnings,
                    has_value,
                    |lvl, name, t, st| add_to_log(lvl, name, t, st, &scope),
                );
                if new_errors != ds.errors {
                    ds.update_fields.insert("errors");
                }
                if new_warnings != ds.warnings {
                    ds.update_fields.insert("warnings");
                }
                ds.errors = new_errors;
                ds.warnings = new_warnings;

                if !crate::model::at_least_one_alarm_in(&ds.errors) && has_value {
                    at_least_one_ds_has_no_errors_and_has_value = true;
                }

                if let Some(v) = ds_row.v {
                    ds_pairs.entry(ds.id).or_default().insert(ts, v);
                }
                if nd_needed_e {
                    ds_nodata_tss.entry(ds.id).or_default().push(ts);
                }
            }

            let dev_scope = format!("device:{}", device.id);
            let (new_dev_errors, dev_nd_needed) = update_alarm_map(
                &device.errors,
                Some(&row.errors),
                ts,
                AlarmMapKind::Errors,
                at_least_one_ds_has_no_errors_and_has_value,
                |lvl, name, t, st| add_to_log(lvl, name, t, st, &dev_scope),
            );
            let (new_dev_warnings, _) = update_alarm_map(
                &device.warnings,
                Some(&row.warnings),
                ts,
                AlarmMapKind::Warnings,
                at_least_one_ds_has_no_errors_and_has_value,
                |lvl, name, t, st| add_to_log(lvl, name, t, st, &dev_scope),
            );
            if new_dev_errors != device.errors {
                device.update_fields.insert("errors");
            }
            if new_dev_warnings != device.warnings {
                device.update_fields.insert("warnings");
            }
            device.errors = new_dev_errors;
            device.warnings = new_dev_warnings;

            if dev_nd_needed {
                for ds in datastreams.iter() {
                    ds_nodata_tss.entry(ds.id).or_default().push(ts);
                }
            }
        }

        let mut ds_health_changed_any = false;

        for ds in datastreams.iter_mut() {
            let pairs = ds_pairs.remove(&ds.id).unwrap_or_default();
            let nd_tss = ds_nodata_tss.remove(&ds.id).unwrap_or_default();

            let base_point = repo.last_ds_reading_before(ds.id, *pairs.keys().next().unwrap_or(&now)).await?;
            let classified = create_ds_readings(&pairs, ds, now, base_point.map(|r| (r.time, r.value)));

            let produces_nodata = ds.is_rbe
                && !(ds.var_type == crate::model::VariableType::Continuous && ds.agg_type == crate::model::DataAggType::Avg);
            let (markers, unused_markers) = if produces_nodata {
                crate::classifier::create_nodata_markers(nd_tss, ds, now)
            } else {
                (Vec::new(), Vec::new())
            };

            let max_used_ts = classified
                .accepted
                .iter()
                .map(|r| r.time)
                .chain(markers.iter().map(|m| m.time))
                .max();
            if let Some(max_ts) = max_used_ts {
                ds.ts_to_start_with = ds.ts_to_start_with.max(max_ts);
            }
            if let Some(max_valid) = classified.accepted.iter().map(|r| r.time).max() {
                ds.last_valid_reading_ts = ds.last_valid_reading_ts.max(max_valid);
            }

            let new_msg_health = derive_msg_health(&ds.errors, &ds.warnings);
            if new_msg_health != ds.msg_health {
                ds.msg_health = new_msg_health;
                ds.update_fields.insert("msg_health");
                let new_health = ds.msg_health.max(ds.nd_health);
                if new_health != ds.health {
                    ds.health = new_health;
                    ds.update_fields.insert("health");
                    ds_health_changed_any = true;
                }
            }

            if ds.time_update.is_some() {
                ds.health_next_eval_ts = Some(now + config::get().scheduling.time_ds_health_eval_ms);
            }

            for chunk in classified.accepted.chunks(config::get().batching.bulk_create_batch_size) {
                repo.bulk_put_ds_readings(chunk).await?;
            }
            if !classified.unused.is_empty() {
                repo.bulk_put_unused_ds_readings(&classified.unused).await?;
            }
            if !classified.invalid.is_empty() {
                repo.bulk_put_invalid_ds_readings(&classified.invalid).await?;
            }
            if !classified.non_roc.is_empty() {
                repo.bulk_put_non_roc_ds_readings(&classified.non_roc).await?;
            }
            if !markers.is_empty() {
                repo.bulk_put_nodata_markers(&markers).await?;
            }
            if !unused_markers.is_empty() {
                repo.bulk_put_unused_nodata_markers(&unused_markers).await?;
            }

            scheduling::commit(ds, scheduling::snapshot_via_serde, publish_tx);
            repo.put_datastream(ds).await?;
        }

        let new_dev_msg_health = derive_msg_health(&device.errors, &device.warnings);
        let msg_health_changed = new_dev_msg_health != device.msg_health;
        if msg_health_changed {
            device.msg_health = new_dev_msg_health;
            device.update_fields.insert("msg_health");
        }

        if ds_health_changed_any || msg_health_changed {
            debug!(device_id = device.id, "device/datastream health changed, enqueueing device update");
            if scheduling::enqueue_update_ts(&mut device.next_upd_ts, now, scheduling::DEFAULT_ENQUEUE_COEF) {
                device.update_fields.insert("next_upd_ts");
            }
        }

        scheduling::commit(&mut device, scheduling::snapshot_via_serde, publish_tx);
        repo.put_device(&device).await?;

        Ok(())
    })
    .await
}

/// Periodic nd-health re-evaluation (C4's "schedule next nd-health
/// evaluation"): for every enabled, periodic datastream due (§4.11's
/// DS-health updater task), recompute `nd_health` from how long it's been
/// since a valid reading arrived, fold into `health`, and reschedule.
pub async fn run_ds_health_sweep(repo: &Repo, publish_tx: &mpsc::UnboundedSender<PendingPublish>, now: i64) -> Result<()> {
    let cap = config::get().scheduling.max_ds_to_health_proc;
    let due = repo.datastreams_due_for_health_eval(now, cap).await?;
    if due.is_empty() {
        return Ok(());
    }

    let mut devices_touched: BTreeMap<u64, Device> = BTreeMap::new();

    for ds in due {
        let lock_key = format!("datastream:{}", ds.id);
        store::with_lock(&[lock_key], || async {
            let Some(mut ds) = repo.get_datastream(ds.id).await? else {
                return Ok(());
            };

            let age = if ds.last_valid_reading_ts == 0 {
                now - ds.created_ts
            } else {
                now - ds.last_valid_reading_ts
            };
            let new_nd_health = if age > ds.time_nd_health_error {
                HealthGrade::Error
            } else if ds.last_valid_reading_ts == 0 {
                HealthGrade::Undefined
            } else {
                HealthGrade::Ok
            };

            let mut health_changed = false;
            if new_nd_health != ds.nd_health {
                ds.nd_health = new_nd_health;
                ds.update_fields.insert("nd_health");
                let new_health = ds.msg_health.max(ds.nd_health);
                if new_health != ds.health {
                    ds.health = new_health;
                    ds.update_fields.insert("health");
                    health_changed = true;
                }
            }

            let margin = (ds.time_update.unwrap_or(0) as f64 * config::get().scheduling.next_eval_margin_coef) as i64;
            ds.health_next_eval_ts = Some(now + margin.max(config::get().scheduling.time_ds_health_eval_ms));
            ds.update_fields.insert("health_next_eval_ts");

            scheduling::commit(&mut ds, scheduling::snapshot_via_serde, publish_tx);
            repo.put_datastream(&ds).await?;

            if health_changed {
                if let Some(device) = repo.get_device(ds.device_id).await? {
                    devices_touched.entry(device.id).or_insert(device);
                }
            }

            Ok(())
        })
        .await?;
    }

    for (_, mut device) in devices_touched {
        if scheduling::enqueue_update_ts(&mut device.next_upd_ts, now, scheduling::DEFAULT_ENQUEUE_COEF) {
            device.update_fields.insert("next_upd_ts");
        }
        scheduling::commit(&mut device, scheduling::snapshot_via_serde, publish_tx);
        repo.put_device(&device).await?;
    }

    Ok(())
}

#[cfg(test)]
mod decode_tests {
    use super::*;

    #[test]
    fn decodes_generic_multi_device_payload() {
        let raw = serde_json::json!({
            "dev-1": {
                "1000": {
                    "e": {"Overtemp": {}},
                    "temp": {"v": 42.5}
                }
            },
            "DEV-2": {
                "2000": {"pressure": {"v": 1.0, "w": {"Low": {"st": "in"}}}}
            }
        });
        let decoded = decode_mqtt_payload("rawdata/x", raw.to_string().as_bytes());
        assert_eq!(decoded.len(), 2);
        let (_, payload1) = decoded.iter().find(|(d, _)| d == "dev-1").unwrap();
        let row = &payload1[&1000];
        assert!(row.errors.contains_key("Overtemp"));
        assert_eq!(row.ds_rows["temp"].v, Some(42.5));
    }

    #[test]
    fn decodes_chirpstack_payload() {
        let raw = serde_json::json!({
            "deviceInfo": {"devEui": "AABBCC"},
            "object": {"1000": {"temp": {"v": 10.0}}}
        });
        let decoded = decode_mqtt_payload("application/1/device/chirpstack/event/up", raw.to_string().as_bytes());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0, "AABBCC");
        assert_eq!(decoded[0].1[&1000].ds_rows["temp"].v, Some(10.0));
    }

    #[test]
    fn invalid_json_drops_silently() {
        let decoded = decode_mqtt_payload("rawdata/x", b"not json");
        assert!(decoded.is_empty());
    }
}

#[cfg(test)]
mod ds_health_sweep_tests {
    use super::*;
    use crate::model::{AlarmMap, DataAggType, VariableType};

    fn test_repo() -> Repo {
        static DIR: std::sync::OnceLock<tempfile::TempDir> = std::sync::OnceLock::new();
        let dir = DIR.get_or_init(|| tempfile::tempdir().expect("tempdir"));
        let _ = crate::store::open(dir.path());
        crate::config::init(crate::config::Config::default());
        Repo::open().expect("open repo")
    }

    fn test_ds(id: u64, time_nd_health_error: i64) -> Datastream {
        Datastream {
            id,
            device_id: 1,
            name: "flow".into(),
            is_enabled: true,
            is_value_integer: false,
            is_rbe: true,
            var_type: VariableType::Continuous,
            agg_type: DataAggType::Avg,
            is_totalizer: false,
            min_plausible_value: 0.0,
            max_plausible_value: 1000.0,
            max_rate_of_change: 10.0,
            errors: AlarmMap::new(),
            warnings: AlarmMap::new(),
            msg_health: HealthGrade::Undefined,
            nd_health: HealthGrade::Undefined,
            health: HealthGrade::Undefined,
            ts_to_start_with: 0,
            last_valid_reading_ts: 0,
            time_update: Some(60_000),
            health_next_eval_ts: Some(0),
            time_nd_health_error,
            till_now_margin: 0,
            created_ts: 0,
            update_fields: Default::default(),
        }
    }

    fn test_device(id: u64) -> Device {
        Device {
            id,
            asset_id: None,
            dev_ui: format!("dev-{id}"),
            name: "d".into(),
            errors: AlarmMap::new(),
            warnings: AlarmMap::new(),
            msg_health: HealthGrade::Undefined,
            chld_health: HealthGrade::Undefined,
            health: HealthGrade::Undefined,
            next_upd_ts: i64::MAX,
            update_fields: Default::default(),
        }
    }

    #[tokio::test]
    async fn stale_periodic_ds_flips_to_error_and_reschedules() {
        let repo = test_repo();
        repo.put_device(&test_device(1)).await.unwrap();
        let mut ds = test_ds(1, 300_000);
        ds.created_ts = 0;
        repo.put_datastream(&ds).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        run_ds_health_sweep(&repo, &tx, 400_000).await.unwrap();

        let updated = repo.get_datastream(1).await.unwrap().unwrap();
        assert_eq!(updated.nd_health, HealthGrade::Error);
        assert_eq!(updated.health, HealthGrade::Error);
        assert!(updated.health_next_eval_ts.unwrap() > 400_000);
        drop(tx);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn fresh_periodic_ds_reports_ok_and_is_not_due_again_immediately() {
        let repo = test_repo();
        repo.put_device(&test_device(2)).await.unwrap();
        let mut ds = test_ds(2, 300_000);
        ds.last_valid_reading_ts = 90_000;
        repo.put_datastream(&ds).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        run_ds_health_sweep(&repo, &tx, 100_000).await.unwrap();

        let updated = repo.get_datastream(2).await.unwrap().unwrap();
        assert_eq!(updated.nd_health, HealthGrade::Ok);
        assert!(updated.health_next_eval_ts.unwrap() > 100_000);
    }

    #[tokio::test]
    async fn non_periodic_ds_is_never_picked_up() {
        let repo = test_repo();
        let mut ds = test_ds(3, 300_000);
        ds.time_update = None;
        ds.health_next_eval_ts = None;
        repo.put_datastream(&ds).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        run_ds_health_sweep(&repo, &tx, 10_000_000).await.unwrap();

        let unchanged = repo.get_datastream(3).await.unwrap().unwrap();
        assert_eq!(unchanged.nd_health, HealthGrade::Undefined);
        assert_eq!(unchanged.health_next_eval_ts, None);
    }
}
