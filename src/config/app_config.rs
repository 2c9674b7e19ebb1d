//! Engine configuration — every tunable named in the constants tables is an
//! operator-overridable TOML field. Each struct implements `Default` with
//! values matching the constants in [`super::defaults`], so a deployment
//! with no config file behaves exactly like the hardcoded baseline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;

/// Root configuration for a monapps-core deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub resampling: ResamplingConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub instance_id: InstanceId,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            resampling: ResamplingConfig::default(),
            batching: BatchingConfig::default(),
            scheduling: SchedulingConfig::default(),
            instance_id: InstanceId::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl Default for InstanceId {
    fn default() -> Self {
        Self("monapps-1".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_url")]
    pub broker_url: String,
    #[serde(default = "default_raw_topic")]
    pub raw_topic_filter: String,
    #[serde(default = "defaults_publish_delay_ms")]
    pub publish_delay_ms: u64,
}

fn default_mqtt_url() -> String {
    "tcp://localhost:1883".to_string()
}
fn default_raw_topic() -> String {
    "rawdata/#".to_string()
}
fn defaults_publish_delay_ms() -> u64 {
    defaults::PUBLISH_DELAY_MS
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: default_mqtt_url(),
            raw_topic_filter: default_raw_topic(),
            publish_delay_ms: defaults_publish_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResamplingConfig {
    pub min_resample_ms: i64,
    pub default_time_resample_ms: i64,
    pub default_time_status_stale_ms: i64,
    pub default_time_curr_state_stale_ms: i64,
    pub default_time_app_health_error_ms: i64,
}

impl Default for ResamplingConfig {
    fn default() -> Self {
        Self {
            min_resample_ms: defaults::MIN_RESAMPLE_MS,
            default_time_resample_ms: defaults::DEFAULT_TIME_RESAMPLE_MS,
            default_time_status_stale_ms: defaults::DEFAULT_TIME_STATUS_STALE_MS,
            default_time_curr_state_stale_ms: defaults::DEFAULT_TIME_CURR_STATE_STALE_MS,
            default_time_app_health_error_ms: defaults::DEFAULT_TIME_APP_HEALTH_ERROR_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    pub num_max_dsreadings_to_process: usize,
    pub num_max_dfreadings_to_process: usize,
    pub bulk_create_batch_size: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            num_max_dsreadings_to_process: defaults::NUM_MAX_DSREADINGS_TO_PROCESS,
            num_max_dfreadings_to_process: defaults::NUM_MAX_DFREADINGS_TO_PROCESS,
            bulk_create_batch_size: defaults::BULK_CREATE_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    pub max_assets_to_upd: usize,
    pub max_devices_to_upd: usize,
    pub time_asset_upd_ms: i64,
    pub time_delay_asset_mandatory_update_ms: i64,
    pub time_ds_health_eval_ms: i64,
    pub max_ts_ms: i64,
    pub max_ds_to_health_proc: usize,
    pub spline_batch_extension_cap: u32,
    pub next_eval_margin_coef: f64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_assets_to_upd: defaults::MAX_ASSETS_TO_UPD,
            max_devices_to_upd: defaults::MAX_DEVICES_TO_UPD,
            time_asset_upd_ms: defaults::TIME_ASSET_UPD_MS,
            time_delay_asset_mandatory_update_ms: defaults::TIME_DELAY_ASSET_MANDATORY_UPDATE_MS,
            time_ds_health_eval_ms: defaults::TIME_DS_HEALTH_EVAL_MS,
            max_ts_ms: defaults::MAX_TS_MS,
            max_ds_to_health_proc: defaults::MAX_DS_TO_HEALTH_PROC,
            spline_batch_extension_cap: defaults::SPLINE_BATCH_EXTENSION_CAP,
            next_eval_margin_coef: defaults::NEXT_EVAL_MARGIN_COEF,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("cannot parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

impl Config {
    /// Load order: `MONAPPS_CONFIG` env var, then `./monapps.toml`, then
    /// built-in defaults.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("MONAPPS_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "loaded config from MONAPPS_CONFIG");
                        return config;
                    }
                    Err(e) => warn!(path = %p.display(), error = %e, "failed to load config from MONAPPS_CONFIG, falling back"),
                }
            } else {
                warn!(path = %path, "MONAPPS_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("monapps.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("loaded config from ./monapps.toml");
                    return config;
                }
                Err(e) => warn!(error = %e, "failed to load ./monapps.toml, using defaults"),
            }
        }

        info!("using built-in default configuration");
        Config::default()
    }

    pub fn load_from_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}
