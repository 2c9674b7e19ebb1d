//! Alarm record and alarm-payload types shared by C3 (alarm state machine)
//! and C4/C6 (raw data processor, app function executor).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The current state of one named alarm on a datastream/device/application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    /// "in" or "out".
    pub st: String,
    /// Whether the source of this alarm is the persistent kind (sent once,
    /// cleared explicitly with "out") vs. non-persistent (re-sent every
    /// cycle it remains active).
    pub persist: bool,
    pub last_trans_ts: i64,
    pub last_in_payload_ts: i64,
}

impl AlarmRecord {
    pub fn is_in(&self) -> bool {
        self.st == "in"
    }
}

/// `errors`/`warnings` maps keyed by alarm name. `BTreeMap` gives
/// deterministic iteration, which matters for log-transition ordering and
/// for tests.
pub type AlarmMap = BTreeMap<String, AlarmRecord>;

/// One incoming alarm descriptor from a raw payload or an app function:
/// `{}` (non-persistent, implicitly "in") or `{"st": "in"|"out"}`
/// (persistent).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingAlarm {
    pub st: Option<String>,
}

/// Map of alarm name -> incoming descriptor for one timestamp, as extracted
/// from a raw payload's `"e"`/`"w"` keys or synthesized by an app function
/// via `add_to_alarm_payload`.
pub type IncomingAlarmDict = BTreeMap<String, IncomingAlarm>;

/// True if at least one alarm in the map currently has status "in".
pub fn at_least_one_alarm_in(map: &AlarmMap) -> bool {
    map.values().any(|a| a.is_in())
}

/// One timestamp's worth of alarm/info activity, the shape a raw payload's
/// `"e"`/`"w"`/`"i"` keys (or an app function's synthesized equivalent) take
/// once parsed.
#[derive(Debug, Clone, Default)]
pub struct AlarmPayloadRow {
    pub errors: IncomingAlarmDict,
    pub warnings: IncomingAlarmDict,
    pub infos: Vec<String>,
}

/// Alarm/info activity keyed by timestamp, built up by app functions via
/// `add_to_alarm_payload` and consumed by `update_alarm_map`.
pub type AlarmPayload = BTreeMap<i64, AlarmPayloadRow>;
