//! Phase ledger: one authoritative state per workflow phase.
//!
//! The ledger enforces the phase transition rules, propagates "needs rerun"
//! markings along the dependency graph, and persists the full set of phases on
//! every mutation. Mutations are serialized by an in-process mutex plus an
//! exclusive file lock, and each one reloads the on-disk document before
//! applying its change, so several processes can drive the same ledger.
//!
//! Usage mistakes (unknown phase, invalid transition) are logged and reported
//! as "not applied"; only persistence failures surface as errors.

pub mod graph;
pub mod metadata;
pub mod state;
pub mod store;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

pub use graph::DependencyGraph;
pub use metadata::{MetaValue, Metadata};
pub use state::{LedgerSummary, PhaseRecord, PhaseState};
pub use store::{LedgerDocument, LedgerStore};

use crate::errors::LedgerError;

type Phases = BTreeMap<String, PhaseRecord>;

pub struct PhaseLedger {
    graph: DependencyGraph,
    store: LedgerStore,
    phases: Mutex<Phases>,
}

impl PhaseLedger {
    /// Open (or create) the ledger persisted at `path`.
    ///
    /// Every phase of `graph` missing from the file is added as `Pending`.
    pub fn open(path: impl AsRef<Path>, graph: DependencyGraph) -> Result<Self, LedgerError> {
        let store = LedgerStore::new(path.as_ref());
        let ledger = Self {
            graph,
            store,
            phases: Mutex::new(Phases::new()),
        };
        ledger.mutate(|_, _| ())?;
        Ok(ledger)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Run a load-check-mutate-persist sequence under both locks.
    ///
    /// The closure works on a copy; the in-memory view is only replaced once
    /// the new document is on disk.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Phases, DateTime<Utc>) -> T,
    ) -> Result<T, LedgerError> {
        let mut cached = self.phases.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let _file_lock = self.store.lock()?;

        let mut working = match self.store.load()? {
            Some(doc) => doc.phases,
            None => cached.clone(),
        };
        for id in self.graph.phase_ids() {
            working
                .entry(id.clone())
                .or_insert_with(|| PhaseRecord::new(id));
        }

        let now = Utc::now();
        let out = f(&mut working, now);

        self.store.save(&LedgerDocument {
            last_updated: now,
            phases: working.clone(),
        })?;
        *cached = working;
        Ok(out)
    }

    fn dependencies_met(&self, phases: &Phases, id: &str) -> bool {
        self.graph.dependencies(id).iter().all(|dep| {
            phases
                .get(dep)
                .is_some_and(|p| p.state == PhaseState::Complete)
        })
    }

    /// Mark a phase as started.
    ///
    /// Unknown phases are created first. Unmet dependencies do not block the
    /// start; they are recorded in `dependencies_met` and logged.
    pub fn start(&self, id: &str, metadata: Option<&Metadata>) -> Result<PhaseRecord, LedgerError> {
        self.mutate(|phases, now| {
            let deps_met = self.dependencies_met(phases, id);
            let record = phases.entry(id.to_string()).or_insert_with(|| {
                warn!(phase = %id, "Starting unknown phase; creating it");
                PhaseRecord::new(id)
            });

            if !deps_met {
                let missing: Vec<&str> = self
                    .graph
                    .dependencies(id)
                    .iter()
                    .map(String::as_str)
                    .collect();
                warn!(phase = %id, dependencies = ?missing, "Starting phase with unmet dependencies");
            }

            record.state = PhaseState::InProgress;
            record.started_at = Some(now);
            record.completed_at = None;
            record.duration_secs = None;
            record.error_message = None;
            record.skip_reason = None;
            record.metadata.remove("skipped");
            record.dependencies_met = deps_met;
            if let Some(meta) = metadata {
                record.metadata.merge(meta);
            }
            info!(phase = %id, dependencies_met = deps_met, "Phase started");
            record.clone()
        })
    }

    /// Mark a phase complete. Returns `None` (and logs) if the phase is unknown.
    pub fn complete(
        &self,
        id: &str,
        metadata: Option<&Metadata>,
    ) -> Result<Option<PhaseRecord>, LedgerError> {
        let record = self.mutate(|phases, now| {
            let Some(record) = phases.get_mut(id) else {
                warn!(phase = %id, "Cannot complete unknown phase");
                return None;
            };
            record.finish(PhaseState::Complete, now);
            record.error_message = None;
            if let Some(meta) = metadata {
                record.metadata.merge(meta);
            }
            info!(phase = %id, duration_secs = ?record.duration_secs, "Phase completed");
            Some(record.clone())
        })?;

        if record.is_some() {
            let stale = self.stale_dependents(id);
            if !stale.is_empty() {
                info!(phase = %id, dependents = ?stale, "Completed dependents predate this completion and may need a rerun");
            }
        }
        Ok(record)
    }

    /// Mark a phase failed. Returns `None` (and logs) if the phase is unknown.
    pub fn fail(
        &self,
        id: &str,
        error_message: &str,
        metadata: Option<&Metadata>,
    ) -> Result<Option<PhaseRecord>, LedgerError> {
        self.mutate(|phases, now| {
            let Some(record) = phases.get_mut(id) else {
                warn!(phase = %id, "Cannot fail unknown phase");
                return None;
            };
            record.finish(PhaseState::Failed, now);
            record.error_message = Some(error_message.to_string());
            if let Some(meta) = metadata {
                record.metadata.merge(meta);
            }
            warn!(phase = %id, error = %error_message, "Phase failed");
            Some(record.clone())
        })
    }

    /// Record that a phase does not apply to this run. The state stays `Pending`.
    pub fn skip(
        &self,
        id: &str,
        reason: &str,
        metadata: Option<&Metadata>,
    ) -> Result<PhaseRecord, LedgerError> {
        self.mutate(|phases, _| {
            let record = phases
                .entry(id.to_string())
                .or_insert_with(|| PhaseRecord::new(id));
            record.state = PhaseState::Pending;
            record.skip_reason = Some(reason.to_string());
            if let Some(meta) = metadata {
                record.metadata.merge(meta);
            }
            record.metadata.insert("skipped", true);
            info!(phase = %id, reason = %reason, "Phase skipped");
            record.clone()
        })
    }

    /// Mark a completed phase, and every completed phase downstream of it, as
    /// needing a rerun.
    ///
    /// Only valid when `id` is `Complete`; otherwise nothing changes. Downstream
    /// phases that are pending, in progress or failed are left untouched.
    /// Returns the ids that were marked, starting with `id`.
    pub fn mark_needs_rerun(&self, id: &str, reason: &str) -> Result<Vec<String>, LedgerError> {
        self.mutate(|phases, _| {
            match phases.get(id).map(|p| p.state) {
                None => {
                    warn!(phase = %id, "Cannot mark unknown phase for rerun");
                    return Vec::new();
                }
                Some(PhaseState::Complete) => {}
                Some(state) => {
                    warn!(phase = %id, state = %state, "Only COMPLETE phases can be marked for rerun");
                    return Vec::new();
                }
            }

            let mut marked = vec![id.to_string()];
            if let Some(record) = phases.get_mut(id) {
                record.state = PhaseState::NeedsRerun;
                record.rerun_reason = Some(reason.to_string());
            }

            let mut visited: HashSet<String> = HashSet::from([id.to_string()]);
            let mut queue: VecDeque<String> = VecDeque::from([id.to_string()]);
            while let Some(parent) = queue.pop_front() {
                for child in self.graph.dependents(&parent) {
                    if !visited.insert(child.to_string()) {
                        continue;
                    }
                    // Unfinished phases end the walk on their branch.
                    let Some(record) = phases.get_mut(child) else {
                        continue;
                    };
                    if record.state != PhaseState::Complete {
                        continue;
                    }
                    record.state = PhaseState::NeedsRerun;
                    record.rerun_reason = Some(format!(
                        "Dependency '{}' needs rerun (cascade from '{}': {})",
                        parent, id, reason
                    ));
                    marked.push(child.to_string());
                    queue.push_back(child.to_string());
                }
            }

            info!(phase = %id, marked = ?marked, "Rerun cascade applied");
            marked
        })
    }

    /// Force a phase back to a fresh `Pending` record.
    pub fn reset(&self, id: &str) -> Result<bool, LedgerError> {
        self.mutate(|phases, _| match phases.get_mut(id) {
            Some(record) => {
                record.reset();
                info!(phase = %id, "Phase reset");
                true
            }
            None => {
                warn!(phase = %id, "Cannot reset unknown phase");
                false
            }
        })
    }

    /// Reset every phase to `Pending`.
    pub fn reset_all(&self) -> Result<(), LedgerError> {
        self.mutate(|phases, _| {
            for record in phases.values_mut() {
                record.reset();
            }
            info!(count = phases.len(), "All phases reset");
        })
    }

    /// Re-read the persisted document into the in-memory view.
    pub fn refresh(&self) -> Result<(), LedgerError> {
        self.mutate(|_, _| ())
    }

    pub fn status(&self, id: &str) -> Option<PhaseRecord> {
        self.phases.lock().ok()?.get(id).cloned()
    }

    /// All phases: graph phases in declaration order, then ad-hoc phases by id.
    pub fn all(&self) -> Vec<PhaseRecord> {
        let Ok(phases) = self.phases.lock() else {
            return Vec::new();
        };
        let mut out: Vec<PhaseRecord> = self
            .graph
            .phase_ids()
            .iter()
            .filter_map(|id| phases.get(id).cloned())
            .collect();
        out.extend(
            phases
                .values()
                .filter(|p| !self.graph.contains(&p.id))
                .cloned(),
        );
        out
    }

    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary::from_records(self.all().iter())
    }

    pub fn by_state(&self, state: PhaseState) -> Vec<PhaseRecord> {
        self.all().into_iter().filter(|p| p.state == state).collect()
    }

    /// Completed dependents of `id` whose completion predates `id`'s.
    pub fn stale_dependents(&self, id: &str) -> Vec<String> {
        let Ok(phases) = self.phases.lock() else {
            return Vec::new();
        };
        let Some(completed_at) = phases.get(id).and_then(|p| p.completed_at) else {
            return Vec::new();
        };
        self.graph
            .dependents(id)
            .into_iter()
            .filter(|child| {
                phases.get(*child).is_some_and(|p| {
                    p.state == PhaseState::Complete
                        && p.completed_at.is_some_and(|t| t < completed_at)
                })
            })
            .map(String::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn chain_graph() -> DependencyGraph {
        DependencyGraph::build(vec![
            ("base", vec![]),
            ("mid", vec!["base"]),
            ("top", vec!["mid"]),
        ])
        .unwrap()
    }

    fn open_chain() -> (PhaseLedger, TempDir) {
        let dir = tempdir().unwrap();
        let ledger = PhaseLedger::open(dir.path().join("phase_status.json"), chain_graph()).unwrap();
        (ledger, dir)
    }

    fn complete_all(ledger: &PhaseLedger, ids: &[&str]) {
        for id in ids {
            ledger.start(id, None).unwrap();
            ledger.complete(id, None).unwrap();
        }
    }

    #[test]
    fn test_open_seeds_graph_phases_as_pending() {
        let (ledger, dir) = open_chain();
        let all = ledger.all();
        assert_eq!(
            all.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["base", "mid", "top"]
        );
        assert!(all.iter().all(|p| p.state == PhaseState::Pending));
        assert!(dir.path().join("phase_status.json").exists());
    }

    #[test]
    fn test_start_records_dependency_status_without_blocking() {
        let (ledger, _dir) = open_chain();
        let record = ledger.start("mid", None).unwrap();
        assert_eq!(record.state, PhaseState::InProgress);
        assert!(!record.dependencies_met);

        ledger.start("base", None).unwrap();
        ledger.complete("base", None).unwrap();
        let record = ledger.start("mid", None).unwrap();
        assert!(record.dependencies_met);
    }

    #[test]
    fn test_start_unknown_phase_creates_it() {
        let (ledger, _dir) = open_chain();
        let record = ledger.start("adhoc", None).unwrap();
        assert_eq!(record.state, PhaseState::InProgress);
        assert!(record.dependencies_met);
        assert_eq!(ledger.all().last().unwrap().id, "adhoc");
    }

    #[test]
    fn test_complete_sets_timestamps_and_merges_metadata() {
        let (ledger, _dir) = open_chain();
        ledger
            .start("base", Some(&Metadata::new().with("rows", 10i64).with("src", "csv")))
            .unwrap();
        let record = ledger
            .complete("base", Some(&Metadata::new().with("rows", 12i64)))
            .unwrap()
            .unwrap();

        assert_eq!(record.state, PhaseState::Complete);
        let started = record.started_at.unwrap();
        let completed = record.completed_at.unwrap();
        assert!(completed >= started);
        assert!(record.duration_secs.unwrap() >= 0.0);
        assert_eq!(record.metadata.get("rows"), Some(&MetaValue::Number(12.0)));
        assert_eq!(record.metadata.get("src"), Some(&MetaValue::Text("csv".into())));
    }

    #[test]
    fn test_complete_unknown_phase_is_noop() {
        let (ledger, _dir) = open_chain();
        assert!(ledger.complete("ghost", None).unwrap().is_none());
        assert!(ledger.status("ghost").is_none());
    }

    #[test]
    fn test_fail_records_error_and_start_clears_it() {
        let (ledger, _dir) = open_chain();
        ledger.start("base", None).unwrap();
        let record = ledger.fail("base", "boom", None).unwrap().unwrap();
        assert_eq!(record.state, PhaseState::Failed);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
        assert!(record.completed_at.is_some());

        let record = ledger.start("base", None).unwrap();
        assert!(record.error_message.is_none());
        assert!(record.completed_at.is_none());
        assert!(record.duration_secs.is_none());
    }

    #[test]
    fn test_skip_keeps_pending_and_flags_metadata() {
        let (ledger, _dir) = open_chain();
        let record = ledger.skip("top", "not applicable", None).unwrap();
        assert_eq!(record.state, PhaseState::Pending);
        assert_eq!(record.skip_reason.as_deref(), Some("not applicable"));
        assert_eq!(record.metadata.get("skipped"), Some(&MetaValue::Bool(true)));
    }

    #[test]
    fn test_rerun_cascade_scenario() {
        let (ledger, _dir) = open_chain();
        complete_all(&ledger, &["base", "mid", "top"]);

        let marked = ledger.mark_needs_rerun("base", "x").unwrap();
        assert_eq!(marked, vec!["base", "mid", "top"]);

        for id in ["base", "mid", "top"] {
            assert_eq!(ledger.status(id).unwrap().state, PhaseState::NeedsRerun);
        }
        assert_eq!(ledger.status("base").unwrap().rerun_reason.as_deref(), Some("x"));
        assert!(ledger.status("mid").unwrap().rerun_reason.unwrap().contains("base"));
        assert!(ledger.status("top").unwrap().rerun_reason.unwrap().contains("mid"));
    }

    #[test]
    fn test_rerun_cascade_leaves_non_complete_dependents_alone() {
        let dir = tempdir().unwrap();
        let graph = DependencyGraph::build(vec![
            ("root", vec![]),
            ("running", vec!["root"]),
            ("broken", vec!["root"]),
            ("waiting", vec!["root"]),
            ("done", vec!["root"]),
        ])
        .unwrap();
        let ledger = PhaseLedger::open(dir.path().join("l.json"), graph).unwrap();
        complete_all(&ledger, &["root", "done"]);
        ledger.start("running", None).unwrap();
        ledger.start("broken", None).unwrap();
        ledger.fail("broken", "bad", None).unwrap();

        let marked = ledger.mark_needs_rerun("root", "new data").unwrap();
        assert_eq!(marked, vec!["root", "done"]);
        assert_eq!(ledger.status("running").unwrap().state, PhaseState::InProgress);
        assert_eq!(ledger.status("broken").unwrap().state, PhaseState::Failed);
        assert_eq!(ledger.status("waiting").unwrap().state, PhaseState::Pending);
        assert_eq!(ledger.status("done").unwrap().state, PhaseState::NeedsRerun);
    }

    #[test]
    fn test_rerun_cascade_stops_at_unfinished_phase() {
        let (ledger, _dir) = open_chain();
        complete_all(&ledger, &["base", "top"]);
        ledger.start("mid", None).unwrap();

        let marked = ledger.mark_needs_rerun("base", "x").unwrap();
        assert_eq!(marked, vec!["base"]);
        assert_eq!(ledger.status("mid").unwrap().state, PhaseState::InProgress);
        let top = ledger.status("top").unwrap();
        assert_eq!(top.state, PhaseState::Complete);
        assert!(top.rerun_reason.is_none());
    }

    #[test]
    fn test_rerun_on_non_complete_phase_is_noop() {
        let (ledger, _dir) = open_chain();
        ledger.start("base", None).unwrap();
        let before = ledger.status("base").unwrap();
        assert!(ledger.mark_needs_rerun("base", "x").unwrap().is_empty());
        assert_eq!(ledger.status("base").unwrap(), before);

        assert!(ledger.mark_needs_rerun("ghost", "x").unwrap().is_empty());
    }

    #[test]
    fn test_needs_rerun_restarts_to_in_progress() {
        let (ledger, _dir) = open_chain();
        complete_all(&ledger, &["base"]);
        ledger.mark_needs_rerun("base", "x").unwrap();
        let record = ledger.start("base", None).unwrap();
        assert_eq!(record.state, PhaseState::InProgress);
        assert_eq!(record.rerun_reason.as_deref(), Some("x"));
    }

    #[test]
    fn test_reset_all_is_idempotent() {
        let (ledger, _dir) = open_chain();
        complete_all(&ledger, &["base", "mid"]);
        ledger.fail("top", "err", None).unwrap();

        ledger.reset_all().unwrap();
        let first = ledger.all();
        ledger.reset_all().unwrap();
        let second = ledger.all();

        assert_eq!(first, second);
        for record in &second {
            assert_eq!(record.state, PhaseState::Pending);
            assert!(record.started_at.is_none());
            assert!(record.completed_at.is_none());
        }
    }

    #[test]
    fn test_reset_unknown_phase_returns_false() {
        let (ledger, _dir) = open_chain();
        assert!(!ledger.reset("ghost").unwrap());
        ledger.start("base", None).unwrap();
        assert!(ledger.reset("base").unwrap());
        assert_eq!(ledger.status("base").unwrap(), PhaseRecord::new("base"));
    }

    #[test]
    fn test_persist_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("phase_status.json");
        let before = {
            let ledger = PhaseLedger::open(&path, chain_graph()).unwrap();
            complete_all(&ledger, &["base"]);
            ledger
                .start("mid", Some(&Metadata::new().with("attempt", 2i64).with("note", "rerun")))
                .unwrap();
            ledger.skip("top", "n/a", None).unwrap();
            ledger.all()
        };

        let reopened = PhaseLedger::open(&path, chain_graph()).unwrap();
        assert_eq!(reopened.all(), before);
    }

    #[test]
    fn test_mutation_sees_changes_from_another_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("phase_status.json");
        let a = PhaseLedger::open(&path, chain_graph()).unwrap();
        let b = PhaseLedger::open(&path, chain_graph()).unwrap();

        a.start("base", None).unwrap();
        b.complete("base", None).unwrap();
        a.refresh().unwrap();
        assert_eq!(a.status("base").unwrap().state, PhaseState::Complete);
    }

    #[test]
    fn test_summary_and_by_state() {
        let (ledger, _dir) = open_chain();
        complete_all(&ledger, &["base"]);
        ledger.start("mid", None).unwrap();

        let summary = ledger.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.count(PhaseState::Complete), 1);
        assert_eq!(summary.count(PhaseState::InProgress), 1);
        assert_eq!(summary.count(PhaseState::Pending), 1);

        let pending = ledger.by_state(PhaseState::Pending);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "top");
    }

    #[test]
    fn test_complete_invariant_holds_for_all_phases() {
        let (ledger, _dir) = open_chain();
        complete_all(&ledger, &["base", "mid"]);
        ledger.complete("top", None).unwrap();

        for record in ledger.by_state(PhaseState::Complete) {
            let started = record.started_at.expect("started_at");
            let completed = record.completed_at.expect("completed_at");
            assert!(completed >= started);
        }
    }

    #[test]
    fn test_stale_dependents() {
        let (ledger, _dir) = open_chain();
        complete_all(&ledger, &["base", "mid"]);
        ledger.start("base", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        ledger.complete("base", None).unwrap();
        assert_eq!(ledger.stale_dependents("base"), vec!["mid"]);
    }
}
