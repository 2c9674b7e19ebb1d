//! Domain enums shared across the data model.

use serde::{Deserialize, Serialize};

/// Health/status/current-state all share the same ordinal scale so that
/// `max()` over a collection of children is a meaningful aggregation.
macro_rules! ordinal_grade {
    ($name:ident { $($variant:ident = $val:expr),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $val),+
        }

        impl Default for $name {
            fn default() -> Self {
                Self::Undefined
            }
        }

        impl $name {
            /// Recover a grade from a derived-datafeed reading's numeric
            /// value (app functions emit their Status/Current-state
            /// datafeeds as the grade's ordinal). `None` for out-of-range
            /// values.
            pub fn try_from_ordinal(value: f64) -> Option<Self> {
                match value.round() as i64 {
                    $($val => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

ordinal_grade!(HealthGrade {
    Undefined = 0,
    Ok = 1,
    Warning = 2,
    Error = 3,
});

ordinal_grade!(Status {
    Undefined = 0,
    Ok = 1,
    Warning = 2,
    Error = 3,
});

ordinal_grade!(CurrState {
    Undefined = 0,
    Ok = 1,
    Warning = 2,
    Error = 3,
});

/// How a child's status/curr_state feeds into its parent's aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationUse {
    DontUse,
    AsIs,
    AsWarning,
    AsErrorIfAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Continuous,
    Discrete,
    Nominal,
    Ordinal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataAggType {
    Avg,
    Sum,
    Last,
}

/// Tags a restored/augmented df reading as unusable by downstream app
/// functions until more native data arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotToUseDfrType {
    SplineNotToUse,
    Unclosed,
    SplineUnclosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AugmentationPolicy {
    TillLastDfReading,
    TillNow,
}

pub const STATUS_FIELD_NAME: &str = "Status";
pub const CURR_STATE_FIELD_NAME: &str = "Current state";

/// The three fields whose value may trigger a parent re-evaluation.
pub const REEVAL_FIELDS: [&str; 3] = ["status", "curr_state", "health"];
