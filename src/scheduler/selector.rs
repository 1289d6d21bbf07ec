//! Candidate selection for a polling executor.
//!
//! The store narrows candidates to claimable processes of the executor's
//! colony and type. Selection then applies targeting and age ordering:
//! a process explicitly targeted at the executor always wins over an open
//! one, and within each group the oldest (by priority time, then submission
//! time, then id) goes first.

use crate::scheduler::process::Process;

/// Pick the process `executor_name` should run next, if any.
pub fn select<'a>(executor_name: &str, candidates: &'a [Process]) -> Option<&'a Process> {
    let targeted = candidates
        .iter()
        .filter(|p| p.is_targeted_at(executor_name))
        .min_by_key(|p| p.order_key());

    targeted.or_else(|| {
        candidates
            .iter()
            .filter(|p| p.targets().is_empty())
            .min_by_key(|p| p.order_key())
    })
}

/// Up to `count` assignable candidates, in the order `select` would hand them out.
pub fn prioritize<'a>(executor_name: &str, candidates: &'a [Process], count: usize) -> Vec<&'a Process> {
    let mut assignable: Vec<&Process> = candidates
        .iter()
        .filter(|p| p.targets().is_empty() || p.is_targeted_at(executor_name))
        .collect();

    assignable.sort_by_key(|p| (!p.is_targeted_at(executor_name), p.order_key()));
    assignable.truncate(count);
    assignable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::spec::FunctionSpec;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn at(offset_secs: i64, spec: FunctionSpec) -> Process {
        Process::with_id(
            Uuid::new_v4(),
            spec,
            "tester",
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    fn open(offset_secs: i64) -> Process {
        at(offset_secs, FunctionSpec::new("f", "dev", "cli"))
    }

    #[test]
    fn empty_candidates_select_nothing() {
        assert!(select("worker", &[]).is_none());
        assert!(prioritize("worker", &[], 5).is_empty());
    }

    #[test]
    fn oldest_open_candidate_wins() {
        let candidates = vec![open(2), open(0), open(1)];
        let picked = select("worker", &candidates).unwrap();
        assert_eq!(picked.id, candidates[1].id);
    }

    #[test]
    fn targeted_candidate_beats_older_open_one() {
        let candidates = vec![
            open(0),
            at(10, FunctionSpec::new("f", "dev", "cli").with_target("worker")),
        ];
        let picked = select("worker", &candidates).unwrap();
        assert_eq!(picked.id, candidates[1].id);
    }

    #[test]
    fn foreign_targets_are_never_selected() {
        let candidates = vec![at(0, FunctionSpec::new("f", "dev", "cli").with_target("other"))];
        assert!(select("worker", &candidates).is_none());
        assert!(prioritize("worker", &candidates, 3).is_empty());
    }

    #[test]
    fn identical_times_break_ties_by_id() {
        let now = Utc::now();
        let mut ids = [Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        let candidates = vec![
            Process::with_id(ids[1], FunctionSpec::new("f", "dev", "cli"), "t", now),
            Process::with_id(ids[0], FunctionSpec::new("f", "dev", "cli"), "t", now),
        ];
        assert_eq!(select("worker", &candidates).unwrap().id, ids[0]);
    }

    #[test]
    fn prioritize_head_matches_select_and_respects_count() {
        let candidates = vec![
            open(3),
            open(1),
            at(5, FunctionSpec::new("f", "dev", "cli").with_target("worker")),
            open(2),
        ];
        let ranked = prioritize("worker", &candidates, 3);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].id, select("worker", &candidates).unwrap().id);
        assert_eq!(ranked[1].id, candidates[1].id);
        assert_eq!(ranked[2].id, candidates[3].id);
    }
}
