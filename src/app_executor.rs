//! Application executor (C6): the per-application evaluation loop. Drives
//! the synthesizer for every native datafeed, then — once none of them are
//! still catching up — calls the registered app function and folds its
//! output (derived readings, cursor advance, alarm payload, state, health)
//! back into the `Application` row.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::alarm_state::{update_alarm_map, AlarmMapKind};
use crate::error::{CoreError, Result};
use crate::model::{AlarmPayload, Application, CurrState, DfReading, DfType, HealthGrade, Status};
use crate::repo::Repo;
use crate::scheduling::{self, ChangeTracker, PendingPublish, SetCond};
use crate::store;
use crate::synthesizer;

/// Everything a plugged-in app function is allowed to read: the application
/// row (pre-tick) and the freshly synthesized native datafeed readings,
/// keyed by datafeed id.
pub struct AppFunctionInput<'a> {
    pub app: &'a Application,
    pub native_dfs: &'a BTreeMap<u64, Vec<DfReading>>,
}

/// What an app function hands back for the executor to persist and fold
/// into the application's fields (§4.6 step 4's `(derived_df_reading_map,
/// update_map)` pair, flattened into one struct).
#[derive(Debug, Default)]
pub struct AppFunctionOutput {
    /// Derived datafeed readings produced this tick, keyed by datafeed id.
    pub derived_readings: BTreeMap<u64, Vec<DfReading>>,
    pub cursor_ts: i64,
    pub alarm_payload: AlarmPayload,
    /// New opaque state, or `None` to leave `app.state` untouched.
    pub state: Option<serde_json::Value>,
    /// The function-reported health (`health_from_app` before the
    /// OK-demoted-to-UNDEFINED rule is applied).
    pub health: HealthGrade,
}

/// A pluggable per-`app_type` evaluation function. Concrete instances are
/// application-specific and registered by the embedding binary; this crate
/// ships only the trait and the executor that drives it.
pub trait AppFunction: Send + Sync {
    fn evaluate(&self, input: &AppFunctionInput) -> Result<AppFunctionOutput>;
}

/// `app.app_type` -> registered function, resolved once per tick.
pub type AppFunctionRegistry = BTreeMap<String, Arc<dyn AppFunction>>;

fn add_to_log(level: &str, alarm_name: &str, ts: i64, status: &str, scope: &str) {
    match level {
        "ERROR" => error!(scope, alarm_name, ts, status, "alarm transition"),
        _ => warn!(scope, alarm_name, ts, status, "alarm transition"),
    }
}

/// Run one evaluation tick for `app_id` (§4.6). Locks the application (and,
/// transitively, its datafeeds) for the duration of the tick.
pub async fn run_application_tick(
    repo: &Repo,
    registry: &AppFunctionRegistry,
    publish_tx: &mpsc::UnboundedSender<PendingPublish>,
    app_id: u64,
    now: i64,
) -> Result<()> {
    let lock_key = format!("application:{app_id}");

    store::with_lock(&[lock_key], || async {
        let Some(mut app) = repo.get_application(app_id).await? else {
            warn!(app_id, "application tick for unknown application, dropping");
            return Ok(());
        };

        if !app.is_enabled {
            return Ok(());
        }

        let Some(app_function) = registry.get(&app.app_type) else {
            error!(app_id, app_type = %app.app_type, "no app function registered for this app_type");
            return Ok(());
        };

        let datafeeds = repo.datafeeds_for_application(app.id).await?;
        let mut native_dfs: BTreeMap<u64, Vec<DfReading>> = BTreeMap::new();
        let mut any_catching_up = false;

        for mut df in datafeeds.iter().filter(|d| d.is_native()).cloned().collect::<Vec<_>>() {
            let ds_id = df.datastream_id.expect("is_native() guarantees Some");
            let Some(mut ds) = repo.get_datastream(ds_id).await? else {
                error!(app_id, ds_id, "native datafeed references missing datastream");
                continue;
            };

            let (prev_df_start, prev_df_last) = (df.ts_to_start_with, df.last_reading_ts);
            let prev_ds_start = ds.ts_to_start_with;

            let outcome = synthesizer::synthesize(repo, app.cursor_ts, &mut df, &mut ds, now).await?;
            if !outcome.committed.is_empty() {
                repo.bulk_put_df_readings(&outcome.committed).await?;
            }
            if df.ts_to_start_with != prev_df_start {
                df.update_fields.insert("ts_to_start_with");
            }
            if df.last_reading_ts != prev_df_last {
                df.update_fields.insert("last_reading_ts");
            }
            scheduling::commit(&mut df, scheduling::snapshot_via_serde, publish_tx);
            repo.put_datafeed(&df).await?;

            if ds.ts_to_start_with != prev_ds_start {
                ds.update_fields.insert("ts_to_start_with");
            }
            scheduling::commit(&mut ds, scheduling::snapshot_via_serde, publish_tx);
            repo.put_datastream(&ds).await?;

            any_catching_up |= outcome.is_catching_up;
            native_dfs.insert(df.id, outcome.committed);
        }

        let was_catching_up = app.is_catching_up;
        if any_catching_up != was_catching_up {
            app.is_catching_up = any_catching_up;
            app.update_fields.insert("is_catching_up");
        }

        if any_catching_up {
            // §4.6 step 2: persist the catching-up flag and stop; evaluate()
            // only ever runs once every native DF has fully caught up.
            app.next_invoc_ts = now + app.catch_up_interval_ms;
            scheduling::commit(&mut app, scheduling::snapshot_via_serde, publish_tx);
            repo.put_application(&app).await?;
            return Ok(());
        }

        let input = AppFunctionInput { app: &app, native_dfs: &native_dfs };
        let outcome = app_function.evaluate(&input);

        let mut excep_health = HealthGrade::Undefined;
        let mut status_changed = false;
        let mut curr_state_changed = false;

        match outcome {
            Ok(out) => {
                for (df_id, readings) in &out.derived_readings {
                    if readings.is_empty() {
                        continue;
                    }
                    repo.bulk_put_df_readings(readings).await?;

                    if let Some(df) = datafeeds.iter().find(|d| d.id == *df_id) {
                        let Some(latest) = readings.iter().max_by_key(|r| r.time) else { continue };
                        match df.df_type {
                            DfType::Status => {
                                let ts_advanced = scheduling::set_attr_if_cond_opt_i64(
                                    latest.time,
                                    SetCond::GreaterThan,
                                    &mut app.last_status_update_ts,
                                    "last_status_update_ts",
                                    &mut app.update_fields,
                                );
                                if ts_advanced {
                                    let new_status = crate::model::Status::try_from_ordinal(latest.value);
                                    if let Some(new_status) = new_status {
                                        if Some(new_status) != app.status {
                                            app.status = Some(new_status);
                                            app.update_fields.insert("status");
                                            status_changed = true;
                                        }
                                    }
                                }
                            }
                            DfType::CurrentState => {
                                let ts_advanced = scheduling::set_attr_if_cond_opt_i64(
                                    latest.time,
                                    SetCond::GreaterThan,
                                    &mut app.last_curr_state_update_ts,
                                    "last_curr_state_update_ts",
                                    &mut app.update_fields,
                                );
                                if ts_advanced {
                                    let new_cs = crate::model::CurrState::try_from_ordinal(latest.value);
                                    if let Some(new_cs) = new_cs {
                                        if Some(new_cs) != app.curr_state {
                                            app.curr_state = Some(new_cs);
                                            app.update_fields.insert("curr_state");
                                            curr_state_changed = true;
                                        }
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }

                scheduling::set_attr_if_cond_i64(
                    out.cursor_ts,
                    SetCond::GreaterThan,
                    &mut app.cursor_ts,
                    "cursor_ts",
                    &mut app.update_fields,
                );

                for (ts, row) in out.alarm_payload.iter() {
                    let scope = format!("application:{}", app.id);
                    let has_value = !row.errors.is_empty() || !row.warnings.is_empty();
                    let (new_errors, _) = update_alarm_map(
                        &app.errors,
                        Some(&row.errors),
                        *ts,
                        AlarmMapKind::Errors,
                        has_value,
                        |lvl, name, t, st| add_to_log(lvl, name, t, st, &scope),
                    );
                    let (new_warnings, _) = update_alarm_map(
                        &app.warnings,
                        Some(&row.warnings),
                        *ts,
                        AlarmMapKind::Warnings,
                        has_value,
                        |lvl, name, t, st| add_to_log(lvl, name, t, st, &scope),
                    );
                    if new_errors != app.errors {
                        app.errors = new_errors;
                        app.update_fields.insert("errors");
                    }
                    if new_warnings != app.warnings {
                        app.warnings = new_warnings;
                        app.update_fields.insert("warnings");
                    }
                }

                if let Some(state) = out.state {
                    if state != app.state {
                        app.state = state;
                        app.update_fields.insert("state");
                    }
                }

                excep_health = HealthGrade::Undefined;
                // health_from_app: an explicit OK collapses to UNDEFINED —
                // see DESIGN.md's Open Question resolution.
                let health_from_app = if out.health == HealthGrade::Ok {
                    HealthGrade::Undefined
                } else {
                    out.health
                };
                apply_staleness_and_health(&mut app, now, health_from_app, excep_health, status_changed, curr_state_changed, publish_tx, repo).await?;
            }
            Err(e) => {
                error!(app_id, error = %e, "app function failed, transaction rolled back");
                excep_health = HealthGrade::Error;
                apply_staleness_and_health(&mut app, now, HealthGrade::Undefined, excep_health, false, false, publish_tx, repo).await?;
            }
        }

        Ok(())
    })
    .await
}

/// §4.6 steps 10-12: staleness, app health, and parent fan-out. Runs
/// regardless of whether the app function succeeded (the "post-exec routine
/// still runs" guarantee).
async fn apply_staleness_and_health(
    app: &mut Application,
    now: i64,
    health_from_app: HealthGrade,
    excep_health: HealthGrade,
    status_value_changed: bool,
    curr_state_value_changed: bool,
    publish_tx: &mpsc::UnboundedSender<PendingPublish>,
    repo: &Repo,
) -> Result<()> {
    let status_ref_ts = app.last_status_update_ts.unwrap_or(app.created_ts);
    let new_status_stale = now - status_ref_ts > app.time_status_stale;
    scheduling::set_attr_if_changed(
        new_status_stale,
        &mut app.is_status_stale,
        "is_status_stale",
        &mut app.update_fields,
    );

    let curr_state_ref_ts = app.last_curr_state_update_ts.unwrap_or(app.created_ts);
    let new_curr_state_stale = now - curr_state_ref_ts > app.time_curr_state_stale;
    scheduling::set_attr_if_changed(
        new_curr_state_stale,
        &mut app.is_curr_state_stale,
        "is_curr_state_stale",
        &mut app.update_fields,
    );

    let cursor_health = if app.is_enabled && !app.is_catching_up && now - app.cursor_ts > app.time_health_error {
        HealthGrade::Error
    } else {
        HealthGrade::Ok
    };

    let new_health = cursor_health.max(health_from_app).max(excep_health);
    let health_changed = scheduling::set_attr_if_changed(new_health, &mut app.health, "health", &mut app.update_fields);

    // §4.6 step 5: back on the normal cadence once evaluate() has actually run.
    app.next_invoc_ts = now + app.invoc_interval_ms;

    let mut fields: Vec<&'static str> = Vec::new();
    if status_value_changed || app.is_status_stale {
        fields.push("status");
    }
    if curr_state_value_changed || app.is_curr_state_stale {
        fields.push("curr_state");
    }
    if health_changed {
        fields.push("health");
    }

    scheduling::commit(app, scheduling::snapshot_via_serde, publish_tx);
    repo.put_application(app).await?;

    if !fields.is_empty() {
        if let Some(asset_id) = app.asset_id {
            if let Some(mut asset) = repo.get_asset(asset_id).await? {
                scheduling::update_reeval_fields(&mut asset, &fields);
                scheduling::enqueue_update(&mut asset, now, scheduling::DEFAULT_ENQUEUE_COEF);
                scheduling::commit(&mut asset, scheduling::snapshot_via_serde, publish_tx);
                repo.put_asset(&asset).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AggregationUse, AlarmMap, AugmentationPolicy, DataAggType, Datafeed, VariableType};

    fn test_repo() -> Repo {
        static DIR: std::sync::OnceLock<tempfile::TempDir> = std::sync::OnceLock::new();
        let dir = DIR.get_or_init(|| tempfile::tempdir().expect("tempdir"));
        let _ = crate::store::open(dir.path());
        crate::config::init(crate::config::Config::default());
        Repo::open().expect("open repo")
    }

    fn test_app(id: u64) -> Application {
        Application {
            id,
            asset_id: Some(900),
            name: "app".into(),
            app_type: "stub".into(),
            is_enabled: true,
            time_resample: 60_000,
            settings: serde_json::json!({}),
            state: serde_json::json!({}),
            cursor_ts: 0,
            is_catching_up: false,
            catch_up_interval_ms: 1_000,
            invoc_interval_ms: 60_000,
            next_invoc_ts: 0,
            created_ts: 0,
            status: None,
            curr_state: None,
            health: HealthGrade::Undefined,
            status_use: AggregationUse::AsIs,
            curr_state_use: AggregationUse::AsIs,
            last_status_update_ts: None,
            last_curr_state_update_ts: None,
            is_status_stale: false,
            is_curr_state_stale: false,
            time_status_stale: 1_000_000,
            time_curr_state_stale: 1_000_000,
            time_health_error: 1_000_000,
            errors: AlarmMap::new(),
            warnings: AlarmMap::new(),
            update_fields: Default::default(),
        }
    }

    fn status_df(id: u64, app_id: u64) -> Datafeed {
        Datafeed {
            id,
            datastream_id: None,
            application_id: Some(app_id),
            name: "Status".into(),
            df_type: DfType::Status,
            time_resample: 60_000,
            time_change: 0,
            agg_type: DataAggType::Last,
            var_type: VariableType::Ordinal,
            is_totalizer: false,
            is_rest_on: false,
            is_aug_on: false,
            aug_policy: AugmentationPolicy::TillLastDfReading,
            ts_to_start_with: 0,
            last_reading_ts: 0,
            update_fields: Default::default(),
        }
    }

    struct StubFn {
        status_df_id: u64,
    }

    impl AppFunction for StubFn {
        fn evaluate(&self, input: &AppFunctionInput) -> Result<AppFunctionOutput> {
            let mut derived = BTreeMap::new();
            derived.insert(self.status_df_id, vec![DfReading::new(self.status_df_id, 60_000, Status::Warning as u8 as f64, false)]);
            let mut alarm_payload = AlarmPayload::new();
            alarm_payload.entry(60_000).or_default().warnings.insert(
                "Stall".into(),
                crate::model::IncomingAlarm { st: None },
            );
            Ok(AppFunctionOutput {
                derived_readings: derived,
                cursor_ts: 60_000,
                alarm_payload,
                state: Some(serde_json::json!({"k": "v"})),
                health: HealthGrade::Ok,
            })
        }
    }

    #[tokio::test]
    async fn tick_folds_app_function_output_into_application_row() {
        let repo = test_repo();
        let app = test_app(1);
        repo.put_application(&app).await.unwrap();
        let df = status_df(5, 1);
        repo.put_datafeed(&df).await.unwrap();

        let mut registry: AppFunctionRegistry = BTreeMap::new();
        registry.insert("stub".into(), Arc::new(StubFn { status_df_id: 5 }));

        let (tx, _rx) = mpsc::unbounded_channel();
        run_application_tick(&repo, &registry, &tx, 1, 100_000).await.unwrap();

        let updated = repo.get_application(1).await.unwrap().unwrap();
        assert_eq!(updated.cursor_ts, 60_000);
        assert_eq!(updated.status, Some(Status::Warning));
        assert!(updated.warnings.contains_key("Stall"));
        assert_eq!(updated.state, serde_json::json!({"k": "v"}));
        // cursor-health is OK (cursor is fresh, well within time_health_error)
        // and is the floor of the max() lattice regardless of what the app
        // function itself reported.
        assert_eq!(updated.health, HealthGrade::Ok);
        assert!(!updated.is_catching_up);

        let reading = repo.df_reading_at(5, 60_000).await.unwrap().unwrap();
        assert_eq!(reading.value, Status::Warning as u8 as f64);

        let asset = repo.get_asset(900).await.unwrap();
        assert!(asset.is_none(), "no asset was ever created, fan-out should be a no-op");
    }

    #[tokio::test]
    async fn stale_cursor_raises_health_to_error() {
        let repo = test_repo();
        let mut app = test_app(2);
        app.time_health_error = 1_000;
        app.cursor_ts = 0;
        repo.put_application(&app).await.unwrap();

        struct NoOpFn;
        impl AppFunction for NoOpFn {
            fn evaluate(&self, _input: &AppFunctionInput) -> Result<AppFunctionOutput> {
                Ok(AppFunctionOutput { health: HealthGrade::Undefined, ..Default::default() })
            }
        }
        let mut registry: AppFunctionRegistry = BTreeMap::new();
        registry.insert("stub".into(), Arc::new(NoOpFn));

        let (tx, _rx) = mpsc::unbounded_channel();
        run_application_tick(&repo, &registry, &tx, 2, 50_000).await.unwrap();

        let updated = repo.get_application(2).await.unwrap().unwrap();
        assert_eq!(updated.health, HealthGrade::Error);
    }
}
