//! Asset: a node in the hierarchical tree that aggregates health/status/
//! current-state from applications, devices and nested assets (C8).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::enums::{AggregationUse, CurrState, HealthGrade, Status};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub name: String,

    pub status: Option<Status>,
    pub curr_state: Option<CurrState>,
    pub health: HealthGrade,

    pub status_use: AggregationUse,
    pub curr_state_use: AggregationUse,

    pub last_status_update_ts: Option<i64>,
    pub last_curr_state_update_ts: Option<i64>,

    /// Fields ("status", "curr_state", "health") a child signalled as
    /// needing re-evaluation on this asset; drained and reset to empty on
    /// every update pass.
    pub reeval_fields: Vec<&'static str>,

    /// Earliest time this asset should be picked up by the asset updater
    /// sweep again; `MAX_TS_MS` parks it until something re-enqueues it.
    pub next_upd_ts: i64,

    #[serde(skip)]
    pub update_fields: BTreeSet<&'static str>,
}

impl Asset {
    pub const PUBLISHED_FIELDS: &'static [&'static str] =
        &["status", "curr_state", "health", "reeval_fields", "next_upd_ts"];
}

impl crate::scheduling::ChangeTracker for Asset {
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
        "asset"
    }
    fn pk_string(&self) -> String {
        self.id.to_string()
    }
    fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }
}

/// A lightweight snapshot of a child's health, used by
/// `derive_health_from_children` (C8) so it stays decoupled from any one
/// concrete entity type. Status/curr_state aggregation uses `GradeChild<G>`
/// instead, since those two also need the child's use-policy and staleness.
#[derive(Debug, Clone, Copy)]
pub struct ChildSummary {
    pub health: Option<HealthGrade>,
}
