//! Reading and marker row types. Primary keys are composite
//! `(datastream_id, time)` / `(datafeed_id, time)`, mirrored here as plain
//! fields rather than a generated key type since the store indexes on both.

use serde::{Deserialize, Serialize};

use super::enums::NotToUseDfrType;

/// A value accepted into the canonical series for a datastream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DsReading {
    pub datastream_id: u64,
    pub time: i64,
    pub value: f64,
}

/// Outside the datastream's acceptance window (`ts_to_start_with < ts < now`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnusedDsReading {
    pub datastream_id: u64,
    pub time: i64,
    pub value: f64,
}

/// Outside `[min_plausible_value, max_plausible_value]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidDsReading {
    pub datastream_id: u64,
    pub time: i64,
    pub value: f64,
}

/// A value the rate-of-change filter clamped; this row preserves the
/// original, unclamped value for audit purposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonRocDsReading {
    pub datastream_id: u64,
    pub time: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoDataMarker {
    pub datastream_id: u64,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnusedNoDataMarker {
    pub datastream_id: u64,
    pub time: i64,
}

/// A resampled/synthesized value on a datafeed. `not_to_use` is transient:
/// the persistence layer never round-trips it, mirroring the source
/// system's treatment of this as a purely in-memory annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DfReading {
    pub datafeed_id: u64,
    pub time: i64,
    pub value: f64,
    pub restored: bool,
    #[serde(skip)]
    pub not_to_use: Option<NotToUseDfrType>,
}

impl DfReading {
    pub fn new(datafeed_id: u64, time: i64, value: f64, restored: bool) -> Self {
        Self {
            datafeed_id,
            time,
            value,
            restored,
            not_to_use: None,
        }
    }
}

/// Either a `DsReading` or a `NoDataMarker`, merged and sorted by time for
/// the resample+augment pass (C5).
#[derive(Debug, Clone)]
pub enum DsrOrNdm {
    Reading(DsReading),
    NoData(NoDataMarker),
}

impl DsrOrNdm {
    pub fn time(&self) -> i64 {
        match self {
            DsrOrNdm::Reading(r) => r.time,
            DsrOrNdm::NoData(m) => m.time,
        }
    }
}
