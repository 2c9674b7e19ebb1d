//! Asset/Device updaters (C8): the hierarchical aggregation sweep.
//!
//! Two independent periodic passes: the device updater folds datastream
//! health up into each device, and the asset updater recomputes
//! status/curr_state/health up the asset tree from whatever leaves signalled
//! a `reeval_fields` entry, leaves-first, with a chain-reaction rule that
//! forces a parent to re-derive all three fields when a child's own
//! `reeval_fields` held all three.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::aggregation::{derive_curr_state_from_children, derive_health_from_children, derive_status_from_children, GradeChild};
use crate::config;
use crate::error::Result;
use crate::model::{Asset, ChildSummary, REEVAL_FIELDS};
use crate::repo::Repo;
use crate::scheduling::{self, PendingPublish};
use crate::store;

/// Run one device-updater sweep (§4.8): devices with `next_upd_ts <= now`,
/// ascending, capped at `MAX_DEVICES_TO_UPD`.
pub async fn run_device_updater(repo: &Repo, publish_tx: &mpsc::UnboundedSender<PendingPublish>, now: i64) -> Result<()> {
    let cap = config::get().scheduling.max_devices_to_upd;
    let due = repo.devices_due_for_update(now, cap).await?;

    for device in due {
        let lock_key = format!("device:{}", device.id);
        store::with_lock(&[lock_key], || async {
            let Some(mut device) = repo.get_device(device.id).await? else {
                return Ok(());
            };

            let datastreams = repo.datastreams_for_device(device.id).await?;
            let children: Vec<ChildSummary> = datastreams
                .iter()
                .filter(|ds| ds.is_enabled)
                .map(|ds| ChildSummary { health: Some(ds.health) })
                .collect();

            let new_chld_health = derive_health_from_children(&children);
            if new_chld_health != device.chld_health {
                device.chld_health = new_chld_health;
                device.update_fields.insert("chld_health");
            }

            let new_health = device.msg_health.max(device.chld_health);
            let health_changed = new_health != device.health;
            if health_changed {
                device.health = new_health;
                device.update_fields.insert("health");
            }

            device.next_upd_ts = now + config::get().scheduling.time_delay_asset_mandatory_update_ms;
            device.update_fields.insert("next_upd_ts");

            scheduling::commit(&mut device, scheduling::snapshot_via_serde, publish_tx);
            repo.put_device(&device).await?;

            if health_changed {
                if let Some(asset_id) = device.asset_id {
                    if let Some(mut asset) = repo.get_asset(asset_id).await? {
                        scheduling::update_reeval_fields(&mut asset, &["health"]);
                        scheduling::enqueue_update(&mut asset, now, scheduling::DEFAULT_ENQUEUE_COEF);
                        scheduling::commit(&mut asset, scheduling::snapshot_via_serde, publish_tx);
                        repo.put_asset(&asset).await?;
                    }
                }
            }

            Ok(())
        })
        .await?;
    }

    Ok(())
}

/// Climb `asset.parent_id` up to the root (or until `cap` ancestors have
/// been visited), inserting every node it touches into `tree`.
async fn load_ancestors(repo: &Repo, tree: &mut BTreeMap<u64, Asset>, start: &Asset, cap: usize) -> Result<()> {
    let mut current_parent = start.parent_id;
    let mut visited = 0;
    while let Some(parent_id) = current_parent {
        if visited >= cap || tree.contains_key(&parent_id) {
            break;
        }
        let Some(parent) = repo.get_asset(parent_id).await? else {
            break;
        };
        current_parent = parent.parent_id;
        tree.insert(parent_id, parent);
        visited += 1;
    }
    Ok(())
}

/// Depth of `id` within `tree`, counted by climbing `parent_id` links
/// (0 = root). Used to order the leaves-first recursion.
fn depth_of(tree: &BTreeMap<u64, Asset>, id: u64) -> usize {
    let mut depth = 0;
    let mut current = id;
    while let Some(parent_id) = tree.get(&current).and_then(|a| a.parent_id) {
        depth += 1;
        current = parent_id;
        if depth > tree.len() {
            break; // defensive: a cycle should never occur, but never loop forever
        }
    }
    depth
}

/// Fetch an asset child's current aggregable fields — from `tree` if it's
/// being processed this pass (so a just-recomputed child is seen), else
/// straight from the store (its value is unchanged this pass).
async fn asset_child_summary(repo: &Repo, tree: &BTreeMap<u64, Asset>, child_id: u64) -> Result<Option<Asset>> {
    if let Some(a) = tree.get(&child_id) {
        return Ok(Some(a.clone()));
    }
    repo.get_asset(child_id).await
}

/// Run one asset-updater sweep (§4.8): load the ancestor closure of every
/// asset due for update, process leaves-first, propagate reeval triggers
/// upward (with the all-three chain-reaction rule), and park each processed
/// asset at `next_upd_ts = MAX_TS_MS`.
pub async fn run_asset_updater(repo: &Repo, publish_tx: &mpsc::UnboundedSender<PendingPublish>, now: i64) -> Result<()> {
    let cap = config::get().scheduling.max_assets_to_upd;
    let triggered = repo.assets_due_for_update(now, cap).await?;
    if triggered.is_empty() {
        return Ok(());
    }

    let lock_keys: Vec<String> = triggered.iter().map(|a| format!("asset:{}", a.id)).collect();

    store::with_lock(&lock_keys, || async {
        let mut tree: BTreeMap<u64, Asset> = BTreeMap::new();
        for asset in &triggered {
            tree.insert(asset.id, asset.clone());
            load_ancestors(repo, &mut tree, asset, cap).await?;
        }

        let mut order: Vec<u64> = tree.keys().copied().collect();
        order.sort_by_key(|id| std::cmp::Reverse(depth_of(&tree, *id)));

        for id in order {
            let reeval_fields = tree.get(&id).map(|a| a.reeval_fields.clone()).unwrap_or_default();
            if reeval_fields.is_empty() {
                continue;
            }

            let had_all_three = REEVAL_FIELDS.iter().all(|f| reeval_fields.contains(f));

            let devices = repo.devices_for_asset(id).await?;
            let applications = repo.applications_for_asset(id).await?;
            let child_asset_ids: Vec<u64> = {
                let mut ids: Vec<u64> = repo.child_assets(id).await?.into_iter().map(|a| a.id).collect();
                ids.sort_unstable();
                ids
            };
            let mut child_assets = Vec::with_capacity(child_asset_ids.len());
            for cid in &child_asset_ids {
                if let Some(a) = asset_child_summary(repo, &tree, *cid).await? {
                    child_assets.push(a);
                }
            }

            let mut changed_fields: Vec<&'static str> = Vec::new();

            for field in &reeval_fields {
                match *field {
                    "health" => {
                        let mut children: Vec<ChildSummary> = devices
                            .iter()
                            .map(|d| ChildSummary { health: Some(d.health) })
                            .collect();
                        children.extend(applications.iter().map(|a| ChildSummary { health: Some(a.health) }));
                        children.extend(child_assets.iter().map(|a| ChildSummary { health: Some(a.health) }));
                        let new_health = derive_health_from_children(&children);
                        let asset = tree.get_mut(&id).expect("id came from tree.keys()");
                        if new_health != asset.health {
                            asset.health = new_health;
                            asset.update_fields.insert("health");
                            changed_fields.push("health");
                        }
                    }
                    "status" => {
                        let mut children: Vec<GradeChild<crate::model::Status>> = applications
                            .iter()
                            .map(|a| GradeChild {
                                value: a.status,
                                is_stale: a.is_status_stale,
                                use_policy: a.status_use,
                            })
                            .collect();
                        children.extend(child_assets.iter().map(|a| GradeChild {
                            value: a.status,
                            is_stale: false,
                            use_policy: a.status_use,
                        }));
                        let new_status = derive_status_from_children(&children);
                        let asset = tree.get_mut(&id).expect("id came from tree.keys()");
                        if new_status != asset.status {
                            asset.status = new_status;
                            asset.last_status_update_ts = Some(now);
                            asset.update_fields.insert("status");
                            asset.update_fields.insert("last_status_update_ts");
                            changed_fields.push("status");
                        }
                    }
                    "curr_state" => {
                        let mut children: Vec<GradeChild<crate::model::CurrState>> = applications
                            .iter()
                            .map(|a| GradeChild {
                                value: a.curr_state,
                                is_stale: a.is_curr_state_stale,
                                use_policy: a.curr_state_use,
                            })
                            .collect();
                        children.extend(child_assets.iter().map(|a| GradeChild {
                            value: a.curr_state,
                            is_stale: false,
                            use_policy: a.curr_state_use,
                        }));
                        let new_cs = derive_curr_state_from_children(&children);
                        let asset = tree.get_mut(&id).expect("id came from tree.keys()");
                        if new_cs != asset.curr_state {
                            asset.curr_state = new_cs;
                            asset.last_curr_state_update_ts = Some(now);
                            asset.update_fields.insert("curr_state");
                            asset.update_fields.insert("last_curr_state_update_ts");
                            changed_fields.push("curr_state");
                        }
                    }
                    _ => {}
                }
            }

            let parent_id = tree.get(&id).and_then(|a| a.parent_id);
            if let Some(parent_id) = parent_id {
                let propagate: &[&'static str] = if had_all_three { &REEVAL_FIELDS } else { &changed_fields };
                if !propagate.is_empty() {
                    if let Some(parent) = tree.get_mut(&parent_id) {
                        scheduling::update_reeval_fields(parent, propagate);
                        scheduling::enqueue_update(parent, now, scheduling::DEFAULT_ENQUEUE_COEF);
                    } else {
                        debug!(asset_id = id, parent_id, "parent beyond ancestor cap, enqueueing directly");
                        if let Some(mut parent) = repo.get_asset(parent_id).await? {
                            scheduling::update_reeval_fields(&mut parent, propagate);
                            scheduling::enqueue_update(&mut parent, now, scheduling::DEFAULT_ENQUEUE_COEF);
                            scheduling::commit(&mut parent, scheduling::snapshot_via_serde, publish_tx);
                            repo.put_asset(&parent).await?;
                        }
                    }
                }
            }

            let asset = tree.get_mut(&id).expect("id came from tree.keys()");
            asset.reeval_fields.clear();
            asset.update_fields.insert("reeval_fields");
            asset.next_upd_ts = config::get().scheduling.max_ts_ms;
            asset.update_fields.insert("next_upd_ts");
        }

        for (_, mut asset) in tree {
            scheduling::commit(&mut asset, scheduling::snapshot_via_serde, publish_tx);
            repo.put_asset(&asset).await?;
        }

        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AggregationUse, AlarmMap, DataAggType, Datastream, Device, HealthGrade, Status, VariableType};

    fn test_repo() -> Repo {
        static DIR: std::sync::OnceLock<tempfile::TempDir> = std::sync::OnceLock::new();
        let dir = DIR.get_or_init(|| tempfile::tempdir().expect("tempdir"));
        let _ = crate::store::open(dir.path());
        crate::config::init(crate::config::Config::default());
        Repo::open().expect("open repo")
    }

    fn test_asset(id: u64, parent_id: Option<u64>) -> Asset {
        Asset {
            id,
            parent_id,
            name: format!("asset-{id}"),
            status: None,
            curr_state: None,
            health: HealthGrade::Undefined,
            status_use: AggregationUse::AsIs,
            curr_state_use: AggregationUse::AsIs,
            last_status_update_ts: None,
            last_curr_state_update_ts: None,
            reeval_fields: vec![],
            next_upd_ts: 0,
            update_fields: Default::default(),
        }
    }

    fn test_ds(id: u64, device_id: u64, health: HealthGrade) -> Datastream {
        Datastream {
            id,
            device_id,
            name: "ds".into(),
            is_enabled: true,
            is_value_integer: false,
            is_rbe: true,
            var_type: VariableType::Continuous,
            agg_type: DataAggType::Avg,
            is_totalizer: false,
            min_plausible_value: 0.0,
            max_plausible_value: 1.0,
            max_rate_of_change: 1.0,
            errors: AlarmMap::new(),
            warnings: AlarmMap::new(),
            msg_health: health,
            nd_health: HealthGrade::Undefined,
            health,
            ts_to_start_with: 0,
            last_valid_reading_ts: 0,
            time_update: None,
            health_next_eval_ts: None,
            time_nd_health_error: crate::config::defaults::DEFAULT_TIME_ND_HEALTH_ERROR_MS,
            till_now_margin: 0,
            created_ts: 0,
            update_fields: Default::default(),
        }
    }

    fn test_device(id: u64, asset_id: u64) -> Device {
        Device {
            id,
            asset_id: Some(asset_id),
            dev_ui: format!("dev-{id}"),
            name: "d".into(),
            errors: AlarmMap::new(),
            warnings: AlarmMap::new(),
            msg_health: HealthGrade::Undefined,
            chld_health: HealthGrade::Undefined,
            health: HealthGrade::Undefined,
            next_upd_ts: 0,
            update_fields: Default::default(),
        }
    }

    #[tokio::test]
    async fn device_updater_folds_ds_health_and_enqueues_parent_asset() {
        let repo = test_repo();
        let asset = test_asset(100, None);
        repo.put_asset(&asset).await.unwrap();

        let device = test_device(200, 100);
        repo.put_device(&device).await.unwrap();
        repo.put_datastream(&test_ds(1, 200, HealthGrade::Error)).await.unwrap();
        repo.put_datastream(&test_ds(2, 200, HealthGrade::Ok)).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        run_device_updater(&repo, &tx, 1_000).await.unwrap();

        let updated = repo.get_device(200).await.unwrap().unwrap();
        // one error, one ok child -> demoted to warning (aggregation algebra).
        assert_eq!(updated.chld_health, HealthGrade::Warning);
        assert_eq!(updated.health, HealthGrade::Warning);
        assert!(updated.next_upd_ts > 1_000);

        let parent = repo.get_asset(100).await.unwrap().unwrap();
        assert!(parent.reeval_fields.contains(&"health"));
        assert!(parent.next_upd_ts <= 1_000 + 60_000);
    }

    #[tokio::test]
    async fn asset_updater_aggregates_leaves_first_and_chain_reacts_to_parent() {
        let repo = test_repo();

        let root = test_asset(1, None);
        repo.put_asset(&root).await.unwrap();

        let mut child = test_asset(2, Some(1));
        // child is due, with all three reeval fields pending -> chain reaction
        // must force the parent to re-derive all three, not just the changed ones.
        child.reeval_fields = vec!["status", "curr_state", "health"];
        child.next_upd_ts = 0;
        repo.put_asset(&child).await.unwrap();

        let device = test_device(300, 2);
        repo.put_device(&device).await.unwrap();
        let mut err_device = device.clone();
        err_device.id = 301;
        err_device.health = HealthGrade::Error;
        repo.put_device(&err_device).await.unwrap();

        let app = crate::model::Application {
            id: 10,
            asset_id: Some(2),
            name: "a".into(),
            app_type: "t".into(),
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
            status: Some(Status::Ok),
            curr_state: None,
            health: HealthGrade::Ok,
            status_use: AggregationUse::AsIs,
            curr_state_use: AggregationUse::AsIs,
            last_status_update_ts: Some(0),
            last_curr_state_update_ts: None,
            is_status_stale: false,
            is_curr_state_stale: false,
            time_status_stale: 1_000_000,
            time_curr_state_stale: 1_000_000,
            time_health_error: 1_000_000,
            errors: AlarmMap::new(),
            warnings: AlarmMap::new(),
            update_fields: Default::default(),
        };
        repo.put_application(&app).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        run_asset_updater(&repo, &tx, 10_000).await.unwrap();

        let updated_child = repo.get_asset(2).await.unwrap().unwrap();
        // one ERROR device + one UNDEFINED device -> demoted to WARNING.
        assert_eq!(updated_child.health, HealthGrade::Warning);
        assert_eq!(updated_child.status, Some(Status::Ok));
        assert!(updated_child.reeval_fields.is_empty());
        assert_eq!(updated_child.next_upd_ts, config::get().scheduling.max_ts_ms);

        // chain reaction: child's own reeval_fields held all three, so once
        // the child is recomputed, `update_reeval_fields` forces the root
        // (loaded into the same ancestor-closure pass) to pick up all three
        // fields too -- not just the ones that literally changed on the
        // child -- and the root gets folded in leaves-first, within the same
        // sweep, using the child's freshly recomputed values.
        let updated_root = repo.get_asset(1).await.unwrap().unwrap();
        assert_eq!(updated_root.health, HealthGrade::Warning);
        assert_eq!(updated_root.status, Some(Status::Ok));
        assert!(updated_root.reeval_fields.is_empty());
        assert_eq!(updated_root.next_upd_ts, config::get().scheduling.max_ts_ms);
    }
}
