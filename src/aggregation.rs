//! Hierarchical aggregation algebra (part of C8): `derive_health_from_children`
//! and the parameterized `derive_status_from_children` /
//! `derive_curr_state_from_children`, decoupled from any one entity type via
//! [`ChildSummary`].

use crate::model::{AggregationUse, ChildSummary, CurrState, HealthGrade, Status};

/// UNDEFINED and missing children are skipped. If at least one remaining
/// child is ERROR and none is OK/WARNING, the result is ERROR; otherwise the
/// highest remaining child health, with ERROR demoted to WARNING whenever a
/// non-ERROR child is present.
pub fn derive_health_from_children(children: &[ChildSummary]) -> HealthGrade {
    let considered: Vec<HealthGrade> = children
        .iter()
        .filter_map(|c| c.health)
        .filter(|h| *h != HealthGrade::Undefined)
        .collect();

    if considered.is_empty() {
        return HealthGrade::Undefined;
    }

    let all_error = considered.iter().all(|h| *h == HealthGrade::Error);
    if all_error {
        return HealthGrade::Error;
    }

    let highest = considered.into_iter().max().unwrap();
    if highest == HealthGrade::Error {
        HealthGrade::Warning
    } else {
        highest
    }
}

/// One child's contribution to a `derive_status_from_children` /
/// `derive_curr_state_from_children` pass, generic over the grade type
/// (`Status` or `CurrState`).
pub struct GradeChild<G> {
    pub value: Option<G>,
    pub is_stale: bool,
    pub use_policy: AggregationUse,
}

/// Shared algorithm behind `derive_status_from_children` and
/// `derive_curr_state_from_children`: children with `use=DONT_USE` or a null
/// value or `is_*_stale=true` are skipped for the value computation, but
/// stale children still count toward "not everyone is null". Result is null
/// iff every child is null/DONT_USE and none is stale.
fn derive_grade_from_children<G: Copy + Ord>(
    children: &[GradeChild<G>],
    error: G,
    warning: G,
) -> Option<G> {
    let any_non_null_or_stale = children
        .iter()
        .any(|c| c.use_policy != AggregationUse::DontUse && (c.value.is_some() || c.is_stale));
    if !any_non_null_or_stale {
        return None;
    }

    let considered: Vec<(G, AggregationUse)> = children
        .iter()
        .filter(|c| c.use_policy != AggregationUse::DontUse && !c.is_stale)
        .filter_map(|c| c.value.map(|v| (v, c.use_policy)))
        .collect();

    if considered.is_empty() {
        return None;
    }

    let all_error = considered.iter().all(|(v, _)| *v == error);
    if all_error {
        let all_as_error_if_all = considered
            .iter()
            .all(|(_, use_policy)| *use_policy == AggregationUse::AsErrorIfAll);
        return Some(if all_as_error_if_all { error } else { warning });
    }

    let any_error = considered.iter().any(|(v, _)| *v == error);
    if any_error {
        return Some(warning);
    }

    considered.iter().map(|(v, _)| *v).max()
}

pub fn derive_status_from_children(children: &[GradeChild<Status>]) -> Option<Status> {
    derive_grade_from_children(children, Status::Error, Status::Warning)
}

pub fn derive_curr_state_from_children(children: &[GradeChild<CurrState>]) -> Option<CurrState> {
    derive_grade_from_children(children, CurrState::Error, CurrState::Warning)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(h: HealthGrade) -> ChildSummary {
        ChildSummary { health: Some(h) }
    }

    #[test]
    fn health_skips_undefined_and_missing() {
        let children = [health(HealthGrade::Undefined), health(HealthGrade::Ok)];
        assert_eq!(derive_health_from_children(&children), HealthGrade::Ok);
    }

    #[test]
    fn health_all_error_stays_error() {
        let children = [health(HealthGrade::Error), health(HealthGrade::Error)];
        assert_eq!(derive_health_from_children(&children), HealthGrade::Error);
    }

    #[test]
    fn health_error_demoted_when_mixed() {
        let children = [health(HealthGrade::Error), health(HealthGrade::Ok)];
        assert_eq!(derive_health_from_children(&children), HealthGrade::Warning);
    }

    #[test]
    fn health_empty_is_undefined() {
        assert_eq!(derive_health_from_children(&[]), HealthGrade::Undefined);
    }

    #[test]
    fn status_null_iff_everyone_null_and_none_stale() {
        let children = vec![
            GradeChild { value: None, is_stale: false, use_policy: AggregationUse::AsIs },
            GradeChild { value: None, is_stale: false, use_policy: AggregationUse::DontUse },
        ];
        assert_eq!(derive_status_from_children(&children), None);
    }

    #[test]
    fn status_stale_child_forces_non_null_even_without_value() {
        let children = vec![GradeChild { value: None, is_stale: true, use_policy: AggregationUse::AsIs }];
        // no considered (non-stale, non-null) child remains, so the value is still None,
        // but this exercises the "stale forces away from everyone-null" short-circuit path.
        assert_eq!(derive_status_from_children(&children), None);
    }

    #[test]
    fn status_all_error_as_error_if_all_stays_error() {
        let children = vec![
            GradeChild { value: Some(Status::Error), is_stale: false, use_policy: AggregationUse::AsErrorIfAll },
            GradeChild { value: Some(Status::Error), is_stale: false, use_policy: AggregationUse::AsErrorIfAll },
        ];
        assert_eq!(derive_status_from_children(&children), Some(Status::Error));
    }

    #[test]
    fn status_all_error_as_warning_policy_demotes() {
        let children = vec![
            GradeChild { value: Some(Status::Error), is_stale: false, use_policy: AggregationUse::AsWarning },
            GradeChild { value: Some(Status::Error), is_stale: false, use_policy: AggregationUse::AsWarning },
        ];
        assert_eq!(derive_status_from_children(&children), Some(Status::Warning));
    }

    #[test]
    fn status_mixed_error_and_ok_demotes_to_warning() {
        let children = vec![
            GradeChild { value: Some(Status::Error), is_stale: false, use_policy: AggregationUse::AsErrorIfAll },
            GradeChild { value: Some(Status::Ok), is_stale: false, use_policy: AggregationUse::AsIs },
        ];
        assert_eq!(derive_status_from_children(&children), Some(Status::Warning));
    }
}
