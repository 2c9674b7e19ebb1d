//! Update scheduling and publish-on-save (C9).
//!
//! The source system models this as an ORM `save()` override that inspects
//! an `update_fields` set collected on the instance. Here that becomes an
//! explicit trait (every persisted entity owns its own changed-field set)
//! plus a free `commit()` function callers invoke after mutating an entity,
//! which mirrors `PublishingOnSaveModel.save()`.

use std::collections::BTreeSet;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config;
use crate::model::{Asset, REEVAL_FIELDS};

/// `snake_case` -> `camelCase`, matching the field naming the MQTT egress
/// payload uses (§9 design note: "camelCase-keyed record").
pub fn to_camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper_next = false;
    for c in field.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Serialize `entity` and pick out just `fields`, camelCasing the keys —
/// the default `snapshot_fields` callers pass to [`commit`] unless an
/// entity needs bespoke formatting.
pub fn snapshot_via_serde<T: Serialize>(entity: &T, fields: &[&str]) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    let Ok(serde_json::Value::Object(obj)) = serde_json::to_value(entity) else {
        return out;
    };
    for field in fields {
        if let Some(v) = obj.get(*field) {
            out.insert(to_camel_case(field), v.clone());
        }
    }
    out
}

/// Full-snapshot variant for [`commit_full`]'s "bulk/admin save" branch.
pub fn full_snapshot_via_serde<T: Serialize>(entity: &T) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    let Ok(serde_json::Value::Object(obj)) = serde_json::to_value(entity) else {
        return out;
    };
    for (k, v) in obj {
        out.insert(to_camel_case(&k), v);
    }
    out
}

/// Implemented by every entity that participates in publish-on-save and
/// parent re-evaluation scheduling.
pub trait ChangeTracker {
    fn update_fields_mut(&mut self) -> &mut BTreeSet<&'static str>;
    fn update_fields(&self) -> &BTreeSet<&'static str>;
    /// Whitelist of fields a changed-field-only save is allowed to publish.
    fn published_fields() -> &'static [&'static str];
    fn model_name() -> &'static str;
    fn pk_string(&self) -> String;
    fn parent_id(&self) -> Option<u64>;
}

/// One queued MQTT publish, built by [`commit`] and drained by the
/// publisher dispatcher (§4.10).
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Persist `entity`'s row and, if its change set intersects
/// `T::published_fields()`, enqueue a changed-fields publish. Mirrors
/// `PublishingOnSaveModel.save()`'s `update_fields` branch — the "bulk save,
/// publish everything" branch is [`commit_full`].
///
/// `store_row` performs the actual write (left to the caller, since the
/// store trait is keyed per entity type); this function only handles the
/// scheduling/publish side effects and resets the change set afterward.
pub fn commit<T: ChangeTracker>(
    entity: &mut T,
    snapshot_fields: impl Fn(&T, &[&str]) -> serde_json::Map<String, serde_json::Value>,
    publish_tx: &mpsc::UnboundedSender<PendingPublish>,
) {
    if entity.update_fields().is_empty() {
        return;
    }

    let to_publish: Vec<&str> = T::published_fields()
        .iter()
        .copied()
        .filter(|f| entity.update_fields().contains(f))
        .collect();

    if !to_publish.is_empty() {
        let mut fields = snapshot_fields(entity, &to_publish);
        fields.insert("id".to_string(), serde_json::Value::String(entity.pk_string()));
        fields.insert(
            "messageType".to_string(),
            serde_json::Value::String("u".to_string()),
        );
        let topic = format!(
            "procdata/{}/{}/{}",
            config::get().instance_id.0,
            T::model_name(),
            entity.pk_string()
        );
        let _ = publish_tx.send(PendingPublish {
            topic,
            payload: serde_json::Value::Object(fields),
        });
    }

    entity.update_fields_mut().clear();
}

/// The "bulk/admin save" branch: publish the full snapshot and trigger a
/// total parent re-evaluation.
pub fn commit_full<T: ChangeTracker>(
    entity: &mut T,
    full_snapshot: impl Fn(&T) -> serde_json::Map<String, serde_json::Value>,
    publish_tx: &mpsc::UnboundedSender<PendingPublish>,
) -> Option<u64> {
    let mut fields = full_snapshot(entity);
    fields.insert("id".to_string(), serde_json::Value::String(entity.pk_string()));
    fields.insert(
        "messageType".to_string(),
        serde_json::Value::String("u".to_string()),
    );
    let topic = format!(
        "procdata/{}/{}/{}",
        config::get().instance_id.0,
        T::model_name(),
        entity.pk_string()
    );
    let _ = publish_tx.send(PendingPublish {
        topic,
        payload: serde_json::Value::Object(fields),
    });
    entity.update_fields_mut().clear();
    entity.parent_id()
}

/// Pull a `next_upd_ts` slot forward if it is currently further out than
/// `now + time_margin`. Only ever moves the time earlier, never later —
/// repeated enqueues from multiple children never push a pending update
/// back out. Returns whether the slot changed.
pub fn enqueue_update_ts(next_upd_ts: &mut i64, now_ts: i64, coef: f64) -> bool {
    let time_margin = (config::get().scheduling.time_asset_upd_ms as f64 * coef) as i64;
    if *next_upd_ts > now_ts + time_margin {
        *next_upd_ts = now_ts + time_margin;
        true
    } else {
        false
    }
}

/// Pull an asset's next scheduled update forward; see [`enqueue_update_ts`].
pub fn enqueue_update(asset: &mut Asset, now_ts: i64, coef: f64) {
    if enqueue_update_ts(&mut asset.next_upd_ts, now_ts, coef) {
        asset.update_fields.insert("next_upd_ts");
    }
}

/// Default time-margin coefficient used throughout the engine.
pub const DEFAULT_ENQUEUE_COEF: f64 = 0.8;

/// Mark that `asset` needs to re-derive `fields` on its next update pass.
pub fn update_reeval_fields(asset: &mut Asset, fields: &[&'static str]) {
    let mut changed = false;
    for field in fields {
        if !asset.reeval_fields.contains(field) {
            asset.reeval_fields.push(field);
            changed = true;
        }
    }
    if changed {
        asset.update_fields.insert("reeval_fields");
    }
}

/// Convenience: force all three reeval fields, used after a bulk parent
/// update or when a child propagated all three at once.
pub fn update_all_reeval_fields(asset: &mut Asset) {
    update_reeval_fields(asset, &REEVAL_FIELDS);
}

/// Comparator used by [`set_attr_if_cond`]. `None` is treated as `0` for
/// `>`/`<` so a first-ever write always satisfies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCond {
    GreaterThan,
    LessThan,
    NotEqual,
}

/// Sets `*slot = new_value` and records the change in `update_fields` only
/// if `cond` holds between `new_value` and the current value; returns
/// whether the assignment happened. This is the Rust shape of
/// `set_attr_if_cond`: callers pass the mutable field directly instead of
/// going through attribute reflection.
pub fn set_attr_if_cond_i64(
    new_value: i64,
    cond: SetCond,
    slot: &mut i64,
    field_name: &'static str,
    update_fields: &mut BTreeSet<&'static str>,
) -> bool {
    let old = *slot;
    let holds = match cond {
        SetCond::GreaterThan => new_value > old,
        SetCond::LessThan => new_value < old,
        SetCond::NotEqual => new_value != old,
    };
    if !holds {
        return false;
    }
    *slot = new_value;
    update_fields.insert(field_name);
    true
}

/// `Option<i64>` variant: `None` reads as `0` for `>`/`<`, matching the
/// source system's null-coalescing in `set_attr_if_cond`.
pub fn set_attr_if_cond_opt_i64(
    new_value: i64,
    cond: SetCond,
    slot: &mut Option<i64>,
    field_name: &'static str,
    update_fields: &mut BTreeSet<&'static str>,
) -> bool {
    let old = slot.unwrap_or(0);
    let holds = match cond {
        SetCond::GreaterThan => new_value > old,
        SetCond::LessThan => new_value < old,
        SetCond::NotEqual => Some(new_value) != *slot,
    };
    if !holds {
        return false;
    }
    *slot = Some(new_value);
    update_fields.insert(field_name);
    true
}

/// Generic `!=`-only variant for non-numeric fields (alarm maps, enums...).
pub fn set_attr_if_changed<T: PartialEq>(
    new_value: T,
    slot: &mut T,
    field_name: &'static str,
    update_fields: &mut BTreeSet<&'static str>,
) -> bool {
    if new_value == *slot {
        return false;
    }
    *slot = new_value;
    update_fields.insert(field_name);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AggregationUse;

    fn test_asset() -> Asset {
        Asset {
            id: 1,
            parent_id: None,
            name: "a".into(),
            status: None,
            curr_state: None,
            health: Default::default(),
            status_use: AggregationUse::AsIs,
            curr_state_use: AggregationUse::AsIs,
            last_status_update_ts: None,
            last_curr_state_update_ts: None,
            reeval_fields: vec![],
            next_upd_ts: i64::MAX,
            update_fields: BTreeSet::new(),
        }
    }

    #[test]
    fn enqueue_only_moves_earlier() {
        let mut a = test_asset();
        enqueue_update(&mut a, 1_000_000, DEFAULT_ENQUEUE_COEF);
        let first = a.next_upd_ts;
        assert!(first < i64::MAX);
        enqueue_update(&mut a, 2_000_000, DEFAULT_ENQUEUE_COEF);
        assert_eq!(a.next_upd_ts, (2_000_000.0 + DEFAULT_ENQUEUE_COEF * 60_000.0) as i64);
        // a later, larger now_ts should not move it further out if it'd be later than current
        let before = a.next_upd_ts;
        enqueue_update(&mut a, before + 10_000_000, DEFAULT_ENQUEUE_COEF);
        assert!(a.next_upd_ts <= before + 10_000_000);
    }

    #[test]
    fn reeval_fields_dedup() {
        let mut a = test_asset();
        update_reeval_fields(&mut a, &["status"]);
        update_reeval_fields(&mut a, &["status"]);
        assert_eq!(a.reeval_fields, vec!["status"]);
        assert!(a.update_fields.contains("reeval_fields"));
    }

    #[test]
    fn set_attr_if_cond_not_equal() {
        let mut fields = BTreeSet::new();
        let mut slot = 1i64;
        assert!(!set_attr_if_cond_i64(1, SetCond::NotEqual, &mut slot, "x", &mut fields));
        assert!(set_attr_if_cond_i64(2, SetCond::NotEqual, &mut slot, "x", &mut fields));
        assert_eq!(slot, 2);
        assert!(fields.contains("x"));
    }
}
