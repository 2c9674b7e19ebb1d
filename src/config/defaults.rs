//! System-wide default constants.
//!
//! Centralises magic numbers used throughout the engine. Grouped by subsystem
//! for easy discovery; values mirror the hardcoded constants of the system
//! this engine is modelled after.

// ============================================================================
// Time grid / resampling
// ============================================================================

/// Smallest resample interval accepted by a datastream/datafeed (ms). 1 second.
pub const MIN_RESAMPLE_MS: i64 = 1_000;

/// Default resample interval when a datastream/datafeed does not specify one (ms). 1 minute.
pub const DEFAULT_TIME_RESAMPLE_MS: i64 = 60_000;

/// Default staleness threshold for `status` (ms). 15 days.
pub const DEFAULT_TIME_STATUS_STALE_MS: i64 = 86_400_000 * 15;

/// Default staleness threshold for `curr_state` (ms). 10 minutes.
pub const DEFAULT_TIME_CURR_STATE_STALE_MS: i64 = 600_000;

/// Default threshold past which a stalled cursor flips an application's health to ERROR (ms). 10 minutes.
pub const DEFAULT_TIME_APP_HEALTH_ERROR_MS: i64 = 600_000;

// ============================================================================
// Batch caps
// ============================================================================

/// Max ds readings pulled from the store in one synthesizer sub-cycle.
pub const NUM_MAX_DSREADINGS_TO_PROCESS: usize = 100_000;

/// Max df readings processed in one restoration batch before bailing out.
pub const NUM_MAX_DFREADINGS_TO_PROCESS: usize = 50_000;

/// Max number of datastream readings saved per bulk-create call.
pub const BULK_CREATE_BATCH_SIZE: usize = 100;

// ============================================================================
// Update scheduling
// ============================================================================

/// Max assets pulled into one asset-updater sweep.
pub const MAX_ASSETS_TO_UPD: usize = 100;

/// Max devices pulled into one device-updater sweep.
pub const MAX_DEVICES_TO_UPD: usize = 50;

/// Base time margin (ms) used by `enqueue_update` to pull a re-evaluation forward.
pub const TIME_ASSET_UPD_MS: i64 = 60_000;

/// Mandatory keep-alive re-evaluation delay applied to devices after every update (ms). 2 hours.
pub const TIME_DELAY_ASSET_MANDATORY_UPDATE_MS: i64 = 7_200_000;

/// Sentinel "far future" timestamp used to park a node until something re-enqueues it.
pub const MAX_TS_MS: i64 = i64::MAX;

/// Periodic DS-health re-evaluation interval (ms).
pub const TIME_DS_HEALTH_EVAL_MS: i64 = 5_000;

/// Max datastreams pulled into one nd-health re-evaluation sweep.
pub const MAX_DS_TO_HEALTH_PROC: usize = 100;

/// Multiplier applied to a periodic datastream's `time_update` when
/// rescheduling its next nd-health evaluation, so slow-cadence datastreams
/// aren't re-checked needlessly often.
pub const NEXT_EVAL_MARGIN_COEF: f64 = 1.5;

/// Default "no data received" error threshold for a datastream's nd-health (ms). 5 minutes.
pub const DEFAULT_TIME_ND_HEALTH_ERROR_MS: i64 = 300_000;

/// How many times the restoration batch size may double before
/// [`crate::error::CoreError::RestorationBatchOverflow`] is raised.
pub const SPLINE_BATCH_EXTENSION_CAP: u32 = 512;

// ============================================================================
// MQTT publish-on-save
// ============================================================================

/// Delay before a changed-field publish is dispatched, giving the store write
/// time to settle.
pub const PUBLISH_DELAY_MS: u64 = 50;
