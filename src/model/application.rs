//! Application: one instance of an app function, the unit of work for C6.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::alarm::AlarmMap;
use super::enums::{AggregationUse, CurrState, HealthGrade, Status};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: u64,
    pub asset_id: Option<u64>,
    pub name: String,
    /// Selects which registered app function (`AppFunction`) drives this
    /// instance's `evaluate()` step.
    pub app_type: String,
    pub is_enabled: bool,

    /// The grid quantum this application and all its datafeeds resample to;
    /// `Datafeed::time_resample` must equal this (data model invariant).
    pub time_resample: i64,

    /// App-specific, schema-validated-externally configuration, passed
    /// verbatim to the app function.
    pub settings: serde_json::Value,
    /// Opaque state the app function reads and overwrites every
    /// invocation; retained across ticks.
    pub state: serde_json::Value,

    /// How far along the native/derived datafeed timeline this application
    /// has evaluated; app functions never look past this point.
    pub cursor_ts: i64,
    pub is_catching_up: bool,
    pub catch_up_interval_ms: i64,
    pub invoc_interval_ms: i64,
    /// Next tick this application is due; advanced by `invoc_interval_ms`
    /// (or `catch_up_interval_ms` while catching up) at the end of every
    /// tick, so a caught-up app is not re-evaluated on every sweep.
    pub next_invoc_ts: i64,

    pub created_ts: i64,

    pub status: Option<Status>,
    pub curr_state: Option<CurrState>,
    pub health: HealthGrade,

    pub status_use: AggregationUse,
    pub curr_state_use: AggregationUse,

    pub last_status_update_ts: Option<i64>,
    pub last_curr_state_update_ts: Option<i64>,
    pub is_status_stale: bool,
    pub is_curr_state_stale: bool,
    pub time_status_stale: i64,
    pub time_curr_state_stale: i64,
    pub time_health_error: i64,

    pub errors: AlarmMap,
    pub warnings: AlarmMap,

    #[serde(skip)]
    pub update_fields: BTreeSet<&'static str>,
}

impl Application {
    pub const PUBLISHED_FIELDS: &'static [&'static str] = &[
        "status",
        "curr_state",
        "health",
        "is_catching_up",
        "is_status_stale",
        "is_curr_state_stale",
        "cursor_ts",
        "errors",
        "warnings",
    ];
}

impl crate::scheduling::ChangeTracker for Application {
    fn update_fields_mut(&mut self) -> &mut BTreeSet<&'static str> {
        &mut self.update_fields
    }
    fn update_fields(&self) -> &BTreeSet<&'static str> {
        &self.update_fields
    }
    fn published_fields() -> &'static [&'static str] {
        Self::PUBLISHED_FIELDS
    }
    fn model_name() -> &'static str {
        "application"
    }
    fn pk_string(&self) -> String {
        self.id.to_string()
    }
    fn parent_id(&self) -> Option<u64> {
        self.asset_id
    }
}
