//! Typed repositories over the [`crate::store`] abstraction: one
//! `SledStore<T>` per entity/reading kind, plus the domain-specific query
//! helpers C4/C5/C6/C8 need (range scans, "last before", secondary index on
//! `dev_ui`).

use std::sync::Arc;

use crate::error::Result;
use crate::model::{
    Application, Asset, Datafeed, Datastream, Device, DfReading, DsReading, InvalidDsReading,
    NoDataMarker, NonRocDsReading, UnusedDsReading, UnusedNoDataMarker,
};
use crate::store::{composite_key, Collection, SledStore};

fn id_key(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// All collections the engine persists to, opened once at startup.
pub struct Repo {
    pub devices: SledStore<Device>,
    pub device_by_ui: SledStore<u64>,
    pub datastreams: SledStore<Datastream>,
    pub datafeeds: SledStore<Datafeed>,
    pub applications: SledStore<Application>,
    pub assets: SledStore<Asset>,

    pub ds_readings: SledStore<DsReading>,
    pub unused_ds_readings: SledStore<UnusedDsReading>,
    pub invalid_ds_readings: SledStore<InvalidDsReading>,
    pub non_roc_ds_readings: SledStore<NonRocDsReading>,
    pub nodata_markers: SledStore<NoDataMarker>,
    pub unused_nodata_markers: SledStore<UnusedNoDataMarker>,

    pub df_readings: SledStore<DfReading>,
}

impl Repo {
    pub fn open() -> Result<Self> {
        Ok(Self {
            devices: SledStore::open("devices")?,
            device_by_ui: SledStore::open("device_by_ui")?,
            datastreams: SledStore::open("datastreams")?,
            datafeeds: SledStore::open("datafeeds")?,
            applications: SledStore::open("applications")?,
            assets: SledStore::open("assets")?,
            ds_readings: SledStore::open("ds_readings")?,
            unused_ds_readings: SledStore::open("unused_ds_readings")?,
            invalid_ds_readings: SledStore::open("invalid_ds_readings")?,
            non_roc_ds_readings: SledStore::open("non_roc_ds_readings")?,
            nodata_markers: SledStore::open("nodata_markers")?,
            unused_nodata_markers: SledStore::open("unused_nodata_markers")?,
            df_readings: SledStore::open("df_readings")?,
        })
    }

    pub async fn device_by_dev_ui(&self, dev_ui: &str) -> Result<Option<Device>> {
        match self.device_by_ui.get(dev_ui.as_bytes()).await? {
            Some(id) => self.devices.get(&id_key(id)).await,
            None => Ok(None),
        }
    }

    pub async fn put_device(&self, device: &Device) -> Result<()> {
        self.devices.put(&id_key(device.id), device).await?;
        self.device_by_ui
            .put(device.dev_ui.as_bytes(), &device.id)
            .await
    }

    pub async fn get_device(&self, id: u64) -> Result<Option<Device>> {
        self.devices.get(&id_key(id)).await
    }

    pub async fn put_datastream(&self, ds: &Datastream) -> Result<()> {
        self.datastreams.put(&id_key(ds.id), ds).await
    }

    pub async fn get_datastream(&self, id: u64) -> Result<Option<Datastream>> {
        self.datastreams.get(&id_key(id)).await
    }

    pub async fn datastreams_for_device(&self, device_id: u64) -> Result<Vec<Datastream>> {
        // Small deployments only; a real row store would index on device_id.
        let mut out = Vec::new();
        for (_, ds) in self.datastreams.range(&[0u8; 8], &[0xffu8; 8]).await? {
            if ds.device_id == device_id {
                out.push(ds);
            }
        }
        Ok(out)
    }

    pub async fn put_datafeed(&self, df: &Datafeed) -> Result<()> {
        self.datafeeds.put(&id_key(df.id), df).await
    }

    pub async fn get_datafeed(&self, id: u64) -> Result<Option<Datafeed>> {
        self.datafeeds.get(&id_key(id)).await
    }

    pub async fn datafeeds_for_application(&self, application_id: u64) -> Result<Vec<Datafeed>> {
        let mut out = Vec::new();
        for (_, df) in self.datafeeds.range(&[0u8; 8], &[0xffu8; 8]).await? {
            if df.application_id == Some(application_id) {
                out.push(df);
            }
        }
        Ok(out)
    }

    pub async fn put_application(&self, app: &Application) -> Result<()> {
        self.applications.put(&id_key(app.id), app).await
    }

    pub async fn get_application(&self, id: u64) -> Result<Option<Application>> {
        self.applications.get(&id_key(id)).await
    }

    pub async fn put_asset(&self, asset: &Asset) -> Result<()> {
        self.assets.put(&id_key(asset.id), asset).await
    }

    pub async fn get_asset(&self, id: u64) -> Result<Option<Asset>> {
        self.assets.get(&id_key(id)).await
    }

    /// Readings for `ds_id` strictly after `after_ts`, ascending, capped at
    /// `limit` (the `NUM_MAX_DSREADINGS_TO_PROCESS` / similar caps).
    pub async fn ds_readings_after(&self, ds_id: u64, after_ts: i64, limit: usize) -> Result<Vec<DsReading>> {
        let start = composite_key(ds_id, after_ts.saturating_add(1));
        let end = composite_key(ds_id, i64::MAX);
        let mut rows = self.ds_readings.range(&start, &end).await?;
        rows.truncate(limit);
        Ok(rows.into_iter().map(|(_, v)| v).collect())
    }

    pub async fn last_ds_reading_before(&self, ds_id: u64, ts: i64) -> Result<Option<DsReading>> {
        let key = composite_key(ds_id, ts);
        match self.ds_readings.last_before(&key).await? {
            Some((k, v)) if belongs_to(&k, ds_id) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    pub async fn last_ds_reading_at_or_before(&self, ds_id: u64, ts: i64) -> Result<Option<DsReading>> {
        let key = composite_key(ds_id, ts.saturating_add(1));
        match self.ds_readings.last_before(&key).await? {
            Some((k, v)) if belongs_to(&k, ds_id) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    pub async fn nodata_markers_after(&self, ds_id: u64, after_ts: i64, limit: usize) -> Result<Vec<NoDataMarker>> {
        let start = composite_key(ds_id, after_ts.saturating_add(1));
        let end = composite_key(ds_id, i64::MAX);
        let mut rows = self.nodata_markers.range(&start, &end).await?;
        rows.truncate(limit);
        Ok(rows.into_iter().map(|(_, v)| v).collect())
    }

    pub async fn last_nodata_marker_at_or_before(&self, ds_id: u64, ts: i64) -> Result<Option<NoDataMarker>> {
        let key = composite_key(ds_id, ts.saturating_add(1));
        match self.nodata_markers.last_before(&key).await? {
            Some((k, v)) if belongs_to(&k, ds_id) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    pub async fn bulk_put_ds_readings(&self, rows: &[DsReading]) -> Result<usize> {
        let items: Vec<_> = rows
            .iter()
            .map(|r| (composite_key(r.datastream_id, r.time), r.clone()))
            .collect();
        self.ds_readings.bulk_put_ignore_conflicts(&items).await
    }

    pub async fn bulk_put_nodata_markers(&self, rows: &[NoDataMarker]) -> Result<usize> {
        let items: Vec<_> = rows
            .iter()
            .map(|r| (composite_key(r.datastream_id, r.time), r.clone()))
            .collect();
        self.nodata_markers.bulk_put_ignore_conflicts(&items).await
    }

    pub async fn bulk_put_unused_ds_readings(&self, rows: &[UnusedDsReading]) -> Result<usize> {
        let items: Vec<_> = rows
            .iter()
            .map(|r| (composite_key(r.datastream_id, r.time), r.clone()))
            .collect();
        self.unused_ds_readings.bulk_put_ignore_conflicts(&items).await
    }

    pub async fn bulk_put_invalid_ds_readings(&self, rows: &[InvalidDsReading]) -> Result<usize> {
        let items: Vec<_> = rows
            .iter()
            .map(|r| (composite_key(r.datastream_id, r.time), r.clone()))
            .collect();
        self.invalid_ds_readings.bulk_put_ignore_conflicts(&items).await
    }

    pub async fn bulk_put_non_roc_ds_readings(&self, rows: &[NonRocDsReading]) -> Result<usize> {
        let items: Vec<_> = rows
            .iter()
            .map(|r| (composite_key(r.datastream_id, r.time), r.clone()))
            .collect();
        self.non_roc_ds_readings.bulk_put_ignore_conflicts(&items).await
    }

    pub async fn bulk_put_unused_nodata_markers(&self, rows: &[UnusedNoDataMarker]) -> Result<usize> {
        let items: Vec<_> = rows
            .iter()
            .map(|r| (composite_key(r.datastream_id, r.time), r.clone()))
            .collect();
        self.unused_nodata_markers.bulk_put_ignore_conflicts(&items).await
    }

    pub async fn df_readings_after(&self, df_id: u64, after_ts: i64, limit: usize) -> Result<Vec<DfReading>> {
        let start = composite_key(df_id, after_ts.saturating_add(1));
        let end = composite_key(df_id, i64::MAX);
        let mut rows = self.df_readings.range(&start, &end).await?;
        rows.truncate(limit);
        Ok(rows.into_iter().map(|(_, v)| v).collect())
    }

    /// Up to `n` latest native DF readings strictly before `ts`, newest first.
    pub async fn last_n_df_readings_before(&self, df_id: u64, ts: i64, n: usize) -> Result<Vec<DfReading>> {
        let start = composite_key(df_id, i64::MIN);
        let end = composite_key(df_id, ts.saturating_sub(1));
        let mut rows = self.df_readings.range(&start, &end).await?;
        rows.reverse();
        rows.truncate(n);
        Ok(rows.into_iter().map(|(_, v)| v).collect())
    }

    pub async fn df_reading_at(&self, df_id: u64, ts: i64) -> Result<Option<DfReading>> {
        self.df_readings.get(&composite_key(df_id, ts)).await
    }

    pub async fn bulk_put_df_readings(&self, rows: &[DfReading]) -> Result<usize> {
        let items: Vec<_> = rows
            .iter()
            .filter(|r| r.not_to_use.is_none())
            .map(|r| (composite_key(r.datafeed_id, r.time), r.clone()))
            .collect();
        self.df_readings.bulk_put_ignore_conflicts(&items).await
    }

    pub async fn applications_for_asset(&self, asset_id: u64) -> Result<Vec<Application>> {
        let mut out = Vec::new();
        for (_, app) in self.applications.range(&[0u8; 8], &[0xffu8; 8]).await? {
            if app.asset_id == Some(asset_id) {
                out.push(app);
            }
        }
        Ok(out)
    }

    pub async fn devices_for_asset(&self, asset_id: u64) -> Result<Vec<Device>> {
        let mut out = Vec::new();
        for (_, device) in self.devices.range(&[0u8; 8], &[0xffu8; 8]).await? {
            if device.asset_id == Some(asset_id) {
                out.push(device);
            }
        }
        Ok(out)
    }

    pub async fn child_assets(&self, parent_id: u64) -> Result<Vec<Asset>> {
        let mut out = Vec::new();
        for (_, asset) in self.assets.range(&[0u8; 8], &[0xffu8; 8]).await? {
            if asset.parent_id == Some(parent_id) {
                out.push(asset);
            }
        }
        Ok(out)
    }

    /// Devices with `next_upd_ts <= now`, ascending by `next_upd_ts`, capped
    /// at `limit` (`MAX_DEVICES_TO_UPD`).
    pub async fn devices_due_for_update(&self, now: i64, limit: usize) -> Result<Vec<Device>> {
        let mut due: Vec<Device> = self
            .devices
            .range(&[0u8; 8], &[0xffu8; 8])
            .await?
            .into_iter()
            .map(|(_, d)| d)
            .filter(|d| d.next_upd_ts <= now)
            .collect();
        due.sort_by_key(|d| d.next_upd_ts);
        due.truncate(limit);
        Ok(due)
    }

    /// Assets with `next_upd_ts <= now`, ascending by `next_upd_ts`, capped
    /// at `limit` (`MAX_ASSETS_TO_UPD`).
    pub async fn assets_due_for_update(&self, now: i64, limit: usize) -> Result<Vec<Asset>> {
        let mut due: Vec<Asset> = self
            .assets
            .range(&[0u8; 8], &[0xffu8; 8])
            .await?
            .into_iter()
            .map(|(_, a)| a)
            .filter(|a| a.next_upd_ts <= now)
            .collect();
        due.sort_by_key(|a| a.next_upd_ts);
        due.truncate(limit);
        Ok(due)
    }

    /// Enabled, periodic (`time_update.is_some()`) datastreams with
    /// `health_next_eval_ts <= now`, ascending, capped at `limit`
    /// (`MAX_DS_TO_HEALTH_PROC`).
    pub async fn datastreams_due_for_health_eval(&self, now: i64, limit: usize) -> Result<Vec<Datastream>> {
        let mut due: Vec<Datastream> = self
            .datastreams
            .range(&[0u8; 8], &[0xffu8; 8])
            .await?
            .into_iter()
            .map(|(_, ds)| ds)
            .filter(|ds| ds.is_enabled && ds.time_update.is_some())
            .filter(|ds| ds.health_next_eval_ts.is_some_and(|t| t <= now))
            .collect();
        due.sort_by_key(|ds| ds.health_next_eval_ts);
        due.truncate(limit);
        Ok(due)
    }

    /// Every enabled application's id, for metrics reporting.
    pub async fn enabled_application_ids(&self) -> Result<Vec<u64>> {
        let mut out: Vec<u64> = self
            .applications
            .range(&[0u8; 8], &[0xffu8; 8])
            .await?
            .into_iter()
            .filter(|(_, app)| app.is_enabled)
            .map(|(_, app)| app.id)
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    /// Enabled applications with `next_invoc_ts <= now`, ascending, for the
    /// periodic executor sweep. Ticks alternate cadence between
    /// `invoc_interval_ms` and `catch_up_interval_ms` (§4.6 step 5).
    pub async fn applications_due_for_invocation(&self, now: i64) -> Result<Vec<u64>> {
        let mut due: Vec<(i64, u64)> = self
            .applications
            .range(&[0u8; 8], &[0xffu8; 8])
            .await?
            .into_iter()
            .map(|(_, app)| app)
            .filter(|app| app.is_enabled && app.next_invoc_ts <= now)
            .map(|app| (app.next_invoc_ts, app.id))
            .collect();
        due.sort_unstable();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }
}

fn belongs_to(key: &[u8], id: u64) -> bool {
    key.len() >= 8 && key[..8] == id.to_be_bytes()
}

pub type SharedRepo = Arc<Repo>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::enums::{AggregationUse, HealthGrade};
    use crate::model::{AlarmMap, NotToUseDfrType};

    fn test_repo() -> Repo {
        static DIR: std::sync::OnceLock<tempfile::TempDir> = std::sync::OnceLock::new();
        let dir = DIR.get_or_init(|| tempfile::tempdir().expect("tempdir"));
        let _ = crate::store::open(dir.path());
        crate::config::init(crate::config::Config::default());
        Repo::open().expect("open repo")
    }

    fn test_application(id: u64, next_invoc_ts: i64) -> Application {
        Application {
            id,
            asset_id: None,
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
            next_invoc_ts,
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

    fn test_asset(id: u64, next_upd_ts: i64) -> Asset {
        Asset {
            id,
            parent_id: None,
            name: "asset".into(),
            status: None,
            curr_state: None,
            health: HealthGrade::Undefined,
            status_use: AggregationUse::AsIs,
            curr_state_use: AggregationUse::AsIs,
            last_status_update_ts: None,
            last_curr_state_update_ts: None,
            reeval_fields: Vec::new(),
            next_upd_ts,
            update_fields: Default::default(),
        }
    }

    #[tokio::test]
    async fn ds_readings_after_is_ascending_and_excludes_boundary() {
        let repo = test_repo();
        let rows = vec![
            DsReading { datastream_id: 1, time: 100, value: 1.0 },
            DsReading { datastream_id: 1, time: 200, value: 2.0 },
            DsReading { datastream_id: 1, time: 300, value: 3.0 },
            DsReading { datastream_id: 2, time: 150, value: 99.0 },
        ];
        repo.bulk_put_ds_readings(&rows).await.unwrap();

        let got = repo.ds_readings_after(1, 100, 10).await.unwrap();
        let times: Vec<i64> = got.iter().map(|r| r.time).collect();
        assert_eq!(times, vec![200, 300]);
    }

    #[tokio::test]
    async fn ds_readings_after_respects_limit() {
        let repo = test_repo();
        let rows = vec![
            DsReading { datastream_id: 5, time: 10, value: 1.0 },
            DsReading { datastream_id: 5, time: 20, value: 2.0 },
            DsReading { datastream_id: 5, time: 30, value: 3.0 },
        ];
        repo.bulk_put_ds_readings(&rows).await.unwrap();

        let got = repo.ds_readings_after(5, 0, 2).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].time, 10);
        assert_eq!(got[1].time, 20);
    }

    #[tokio::test]
    async fn last_ds_reading_at_or_before_picks_exact_match_over_neighbor() {
        let repo = test_repo();
        let rows = vec![
            DsReading { datastream_id: 7, time: 100, value: 1.0 },
            DsReading { datastream_id: 7, time: 200, value: 2.0 },
        ];
        repo.bulk_put_ds_readings(&rows).await.unwrap();

        let at = repo.last_ds_reading_at_or_before(7, 200).await.unwrap().unwrap();
        assert_eq!(at.time, 200);

        let between = repo.last_ds_reading_at_or_before(7, 150).await.unwrap().unwrap();
        assert_eq!(between.time, 100);
    }

    #[tokio::test]
    async fn last_ds_reading_at_or_before_ignores_other_datastreams() {
        let repo = test_repo();
        repo.bulk_put_ds_readings(&[DsReading { datastream_id: 9, time: 50, value: 1.0 }])
            .await
            .unwrap();

        let none = repo.last_ds_reading_at_or_before(8, 1_000).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn bulk_put_df_readings_filters_not_to_use_rows() {
        let repo = test_repo();
        let mut tagged = DfReading::new(1, 100, 1.0, true);
        tagged.not_to_use = Some(NotToUseDfrType::Unclosed);
        let clean = DfReading::new(1, 200, 2.0, true);

        let inserted = repo.bulk_put_df_readings(&[tagged, clean]).await.unwrap();
        assert_eq!(inserted, 1);
        assert!(repo.df_reading_at(1, 100).await.unwrap().is_none());
        assert!(repo.df_reading_at(1, 200).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn devices_due_for_update_filters_and_sorts_ascending() {
        let repo = test_repo();
        let mut due_later = test_device_for_repo(1);
        due_later.next_upd_ts = 5_000;
        let mut due_first = test_device_for_repo(2);
        due_first.next_upd_ts = 1_000;
        let mut not_due = test_device_for_repo(3);
        not_due.next_upd_ts = 9_000;
        repo.put_device(&due_later).await.unwrap();
        repo.put_device(&due_first).await.unwrap();
        repo.put_device(&not_due).await.unwrap();

        let due = repo.devices_due_for_update(5_000, 10).await.unwrap();
        let ids: Vec<u64> = due.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    fn test_device_for_repo(id: u64) -> Device {
        Device {
            id,
            asset_id: None,
            dev_ui: format!("dev-{id}"),
            name: "d".into(),
            errors: AlarmMap::new(),
            warnings: AlarmMap::new(),
            msg_health: HealthGrade::Undefined,
            chld_health: HealthGrade::Undefined,
            health: HealthGrade::Undefined,
            next_upd_ts: i64::MAX,
            update_fields: Default::default(),
        }
    }

    #[tokio::test]
    async fn assets_due_for_update_filters_and_sorts_ascending() {
        let repo = test_repo();
        repo.put_asset(&test_asset(1, 3_000)).await.unwrap();
        repo.put_asset(&test_asset(2, 500)).await.unwrap();
        repo.put_asset(&test_asset(3, 10_000)).await.unwrap();

        let due = repo.assets_due_for_update(3_000, 10).await.unwrap();
        let ids: Vec<u64> = due.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn applications_due_for_invocation_orders_by_next_invoc_ts_then_id() {
        let repo = test_repo();
        repo.put_application(&test_application(1, 2_000)).await.unwrap();
        repo.put_application(&test_application(2, 1_000)).await.unwrap();
        let mut disabled = test_application(3, 500);
        disabled.is_enabled = false;
        repo.put_application(&disabled).await.unwrap();

        let due = repo.applications_due_for_invocation(2_000).await.unwrap();
        assert_eq!(due, vec![2, 1]);
    }

    #[tokio::test]
    async fn child_assets_and_applications_for_asset_filter_by_parent() {
        let repo = test_repo();
        let mut child = test_asset(20, i64::MAX);
        child.parent_id = Some(10);
        let mut other = test_asset(21, i64::MAX);
        other.parent_id = Some(99);
        repo.put_asset(&child).await.unwrap();
        repo.put_asset(&other).await.unwrap();

        let children = repo.child_assets(10).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, 20);

        let mut app = test_application(30, 0);
        app.asset_id = Some(10);
        repo.put_application(&app).await.unwrap();
        let apps = repo.applications_for_asset(10).await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].id, 30);
    }
}
