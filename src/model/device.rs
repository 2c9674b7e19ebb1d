//! Device: the physical/logical source of one or more datastreams —
//! contributes only `health` to its parent asset's aggregation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::alarm::AlarmMap;
use super::enums::HealthGrade;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: u64,
    pub asset_id: Option<u64>,
    pub dev_ui: String,
    pub name: String,

    pub errors: AlarmMap,
    pub warnings: AlarmMap,

    pub msg_health: HealthGrade,
    pub chld_health: HealthGrade,
    pub health: HealthGrade,

    /// Next mandatory re-evaluation time; advanced on every update cycle
    /// regardless of whether anything changed (keep-alive refresh).
    pub next_upd_ts: i64,

    #[serde(skip)]
    pub update_fields: BTreeSet<&'static str>,
}

impl Device {
    pub const PUBLISHED_FIELDS: &'static [&'static str] =
        &["errors", "warnings", "health", "msg_health", "chld_health"];
}

impl crate::scheduling::ChangeTracker for Device {
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
        "device"
    }
    fn pk_string(&self) -> String {
        self.id.to_string()
    }
    fn parent_id(&self) -> Option<u64> {
        self.asset_id
    }
}
