//! Datafeed: a resampled/synthesized time series derived from either a
//! datastream (native) or an application function (derived) — C5's unit of
//! work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::enums::{AugmentationPolicy, DataAggType, VariableType};

/// Tags a derived datafeed whose latest reading feeds an application's
/// `status`/`curr_state` (C6 step 6), vs. an ordinary derived series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DfType {
    None,
    Status,
    CurrentState,
    State,
    /// Application-specific loss/savings tag, carried through unchanged.
    Custom(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datafeed {
    pub id: u64,
    /// `Some` for native datafeeds (backed directly by a datastream),
    /// `None` for derived datafeeds produced by an application function.
    pub datastream_id: Option<u64>,
    pub application_id: Option<u64>,
    pub name: String,
    pub df_type: DfType,

    pub time_resample: i64,
    pub time_change: i64,
    pub agg_type: DataAggType,
    pub var_type: VariableType,
    pub is_totalizer: bool,

    pub is_rest_on: bool,
    pub is_aug_on: bool,
    pub aug_policy: AugmentationPolicy,

    pub ts_to_start_with: i64,
    pub last_reading_ts: i64,

    #[serde(skip)]
    pub update_fields: BTreeSet<&'static str>,
}

impl Datafeed {
    pub const PUBLISHED_FIELDS: &'static [&'static str] = &["ts_to_start_with", "last_reading_ts"];

    pub fn is_native(&self) -> bool {
        self.datastream_id.is_some()
    }
}

impl crate::scheduling::ChangeTracker for Datafeed {
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
        "datafeed"
    }
    fn pk_string(&self) -> String {
        self.id.to_string()
    }
    fn parent_id(&self) -> Option<u64> {
        self.application_id
    }
}
