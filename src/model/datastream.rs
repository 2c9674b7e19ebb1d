//! Datastream: the canonical series of raw values coming off one device
//! channel (C2's unit of work).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::alarm::AlarmMap;
use super::enums::{DataAggType, HealthGrade, VariableType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datastream {
    pub id: u64,
    pub device_id: u64,
    pub name: String,
    pub is_enabled: bool,
    pub is_value_integer: bool,
    pub is_rbe: bool,
    pub var_type: VariableType,
    pub agg_type: DataAggType,

    /// SUM-only: this datastream is a totalizer (monotonically accumulating
    /// counter), which changes how C5 restores gaps (linear projection
    /// instead of spline/augmentation).
    pub is_totalizer: bool,

    pub min_plausible_value: f64,
    pub max_plausible_value: f64,
    pub max_rate_of_change: f64,

    pub errors: AlarmMap,
    pub warnings: AlarmMap,

    pub msg_health: HealthGrade,
    pub nd_health: HealthGrade,
    pub health: HealthGrade,

    pub ts_to_start_with: i64,
    pub last_valid_reading_ts: i64,

    /// `Some` for periodic datastreams only; schedules the next nd-health
    /// re-evaluation.
    pub time_update: Option<i64>,
    pub health_next_eval_ts: Option<i64>,
    /// "No data received" error threshold for `nd_health` (ms).
    pub time_nd_health_error: i64,

    /// For RBE+TILL_NOW datafeeds backed by this datastream: how far behind
    /// wall-clock `end_rts` is allowed to trail.
    pub till_now_margin: i64,
    pub created_ts: i64,

    #[serde(skip)]
    pub update_fields: BTreeSet<&'static str>,
}

impl Datastream {
    pub const PUBLISHED_FIELDS: &'static [&'static str] = &[
        "errors",
        "warnings",
        "health",
        "msg_health",
        "ts_to_start_with",
        "last_valid_reading_ts",
    ];
}

impl crate::scheduling::ChangeTracker for Datastream {
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
        "datastream"
    }
    fn pk_string(&self) -> String {
        self.id.to_string()
    }
    fn parent_id(&self) -> Option<u64> {
        Some(self.device_id)
    }
}
