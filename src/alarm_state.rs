//! Persistent alarm state machine (C3): folds incoming alarm activity into
//! an entity's `errors`/`warnings` map, logging every "in"/"out"
//! transition and deciding when a no-data marker is warranted.

use crate::model::{AlarmMap, AlarmPayloadRow, AlarmRecord, IncomingAlarmDict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmMapKind {
    Errors,
    Warnings,
}

impl AlarmMapKind {
    fn log_level(self) -> &'static str {
        match self {
            AlarmMapKind::Errors => "ERROR",
            AlarmMapKind::Warnings => "WARNING",
        }
    }
}

/// `key` in the source payload shape: `"e"` (error), `"w"` (warning), `"i"`
/// (info, a plain list rather than a status dict).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmPayloadKey {
    Error,
    Warning,
    Info,
}

/// Equivalent of `add_to_alarm_payload`: used by app functions to shape
/// synthesized alarm activity into the same payload structure raw device
/// messages produce, so it can flow through [`update_alarm_map`] uniformly.
pub fn add_to_alarm_payload(
    payload: &mut crate::model::AlarmPayload,
    alarm_name: &str,
    ts: i64,
    key: AlarmPayloadKey,
) {
    let row = payload.entry(ts).or_insert_with(AlarmPayloadRow::default);
    match key {
        AlarmPayloadKey::Info => row.infos.push(alarm_name.to_string()),
        AlarmPayloadKey::Error => {
            row.errors
                .entry(alarm_name.to_string())
                .or_insert_with(|| crate::model::IncomingAlarm { st: None });
        }
        AlarmPayloadKey::Warning => {
            row.warnings
                .entry(alarm_name.to_string())
                .or_insert_with(|| crate::model::IncomingAlarm { st: None });
        }
    }
}

/// Fold one timestamp's incoming alarm dict into `alarm_map`, returning the
/// updated map and whether a no-data marker should be created for this
/// timestamp (errors only).
///
/// `alarm_dict` entries with an explicit `st: "in"|"out"` are persistent:
/// sent once, remain active until cleared. Entries with no `st` (or any
/// other value) are non-persistent: implicitly "in" every time they appear,
/// and fall back to "out" the moment they stop appearing.
pub fn update_alarm_map(
    alarm_map: &AlarmMap,
    alarm_dict: Option<&IncomingAlarmDict>,
    ts: i64,
    kind: AlarmMapKind,
    has_value: bool,
    mut add_to_log: impl FnMut(&str, &str, i64, &str),
) -> (AlarmMap, bool) {
    let mut updated = alarm_map.clone();
    let mut is_nd_marker_needed = false;
    let log_level = kind.log_level();

    if let Some(dict) = alarm_dict {
        for (alarm_name, incoming) in dict {
            let persistent_status = incoming
                .st
                .as_deref()
                .map(|s| s.to_lowercase())
                .filter(|s| s == "in" || s == "out");

            if let Some(existing) = updated.get_mut(alarm_name) {
                if let Some(new_status) = persistent_status {
                    existing.persist = true;
                    existing.last_in_payload_ts = ts;

                    if kind == AlarmMapKind::Errors && new_status == "in" && has_value {
                        is_nd_marker_needed = true;
                    }

                    if existing.st != new_status {
                        existing.st = new_status.clone();
                        existing.last_trans_ts = ts;
                        add_to_log(log_level, alarm_name, ts, &new_status);
                        if kind == AlarmMapKind::Errors && new_status == "in" {
                            is_nd_marker_needed = true;
                        }
                    }
                } else {
                    existing.persist = false;
                    existing.last_in_payload_ts = ts;

                    if kind == AlarmMapKind::Errors && has_value {
                        is_nd_marker_needed = true;
                    }

                    if existing.st != "in" {
                        existing.st = "in".to_string();
                        existing.last_trans_ts = ts;
                        add_to_log(log_level, alarm_name, ts, "in");
                        if kind == AlarmMapKind::Errors {
                            is_nd_marker_needed = true;
                        }
                    }
                }
            } else if let Some(new_status) = persistent_status {
                updated.insert(
                    alarm_name.clone(),
                    AlarmRecord {
                        st: new_status.clone(),
                        persist: true,
                        last_trans_ts: ts,
                        last_in_payload_ts: ts,
                    },
                );
                if new_status == "in" {
                    add_to_log(log_level, alarm_name, ts, "in");
                    if kind == AlarmMapKind::Errors {
                        is_nd_marker_needed = true;
                    }
                }
            } else {
                updated.insert(
                    alarm_name.clone(),
                    AlarmRecord {
                        st: "in".to_string(),
                        persist: false,
                        last_trans_ts: ts,
                        last_in_payload_ts: ts,
                    },
                );
                add_to_log(log_level, alarm_name, ts, "in");
                if kind == AlarmMapKind::Errors {
                    is_nd_marker_needed = true;
                }
            }
        }
    }

    for (alarm_name, record) in updated.iter_mut() {
        if record.persist {
            if kind == AlarmMapKind::Errors && record.st == "in" && record.last_in_payload_ts < ts && has_value {
                record.st = "out".to_string();
                record.last_trans_ts = ts;
                add_to_log(log_level, alarm_name, ts, "out");
            }
        } else if record.st == "in" {
            let still_present = alarm_dict.and_then(|d| d.get(alarm_name)).is_some();
            if !still_present {
                record.st = "out".to_string();
                record.last_trans_ts = ts;
                add_to_log(log_level, alarm_name, ts, "out");
            }
        }
    }

    (updated, is_nd_marker_needed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn noop_log(_level: &str, _name: &str, _ts: i64, _status: &str) {}

    #[test]
    fn non_persistent_alarm_enters_and_clears() {
        let map = AlarmMap::new();
        let mut dict = Map::new();
        dict.insert("CPU Error".to_string(), crate::model::IncomingAlarm { st: None });

        let (after_in, nd_needed) =
            update_alarm_map(&map, Some(&dict), 1000, AlarmMapKind::Errors, false, noop_log);
        assert!(nd_needed);
        assert_eq!(after_in.get("CPU Error").unwrap().st, "in");
        assert!(!after_in.get("CPU Error").unwrap().persist);

        // next cycle: alarm absent from the incoming dict -> clears to "out"
        let (after_out, _) = update_alarm_map(&after_in, None, 2000, AlarmMapKind::Errors, true, noop_log);
        assert_eq!(after_out.get("CPU Error").unwrap().st, "out");
    }

    #[test]
    fn persistent_alarm_requires_explicit_out() {
        let map = AlarmMap::new();
        let mut dict = Map::new();
        dict.insert(
            "Sensor Fault".to_string(),
            crate::model::IncomingAlarm { st: Some("in".to_string()) },
        );
        let (after_in, _) = update_alarm_map(&map, Some(&dict), 1000, AlarmMapKind::Errors, false, noop_log);
        assert!(after_in.get("Sensor Fault").unwrap().persist);

        // absent from the next payload: a persistent "in" alarm stays "in"...
        let (still_in, _) = update_alarm_map(&after_in, None, 2000, AlarmMapKind::Errors, false, noop_log);
        assert_eq!(still_in.get("Sensor Fault").unwrap().st, "in");

        // ...unless a value arrives in parallel with no error for this timestamp
        let (cleared, _) = update_alarm_map(&still_in, None, 3000, AlarmMapKind::Errors, true, noop_log);
        assert_eq!(cleared.get("Sensor Fault").unwrap().st, "out");
    }

    #[test]
    fn repeat_persistent_in_with_value_needs_nd_marker() {
        let map = AlarmMap::new();
        let mut dict = Map::new();
        dict.insert(
            "Sensor Fault".to_string(),
            crate::model::IncomingAlarm { st: Some("in".to_string()) },
        );
        let (after_in, _) = update_alarm_map(&map, Some(&dict), 1000, AlarmMapKind::Errors, false, noop_log);
        let (_, nd_needed) = update_alarm_map(&after_in, Some(&dict), 2000, AlarmMapKind::Errors, true, noop_log);
        assert!(nd_needed);
    }
}
