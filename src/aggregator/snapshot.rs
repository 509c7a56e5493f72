//! Last-known status of each probed target.

use crate::db::{ProbeKind, Target};
use crate::probe::{JobsSnapshot, PingResult};
use crate::status::{aggregate_status, AggregateStatus, Observation};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Uniform per-target result of a probe cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSnapshot {
    pub target_id: i64,
    pub target_name: String,
    pub probe_kind: ProbeKind,
    pub status: AggregateStatus,
    pub in_progress: bool,
    pub jobs: Vec<Observation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingResult>,
    /// Remote clock for job targets, local clock for ping targets.
    pub reference_clock: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl TargetSnapshot {
    /// A target that has never produced an observation.
    pub fn unchecked(target: &Target) -> Self {
        Self::blank(target.id, target.name.clone(), target.probe_kind)
    }

    fn blank(target_id: i64, target_name: String, probe_kind: ProbeKind) -> Self {
        Self {
            target_id,
            target_name,
            probe_kind,
            status: AggregateStatus::Warning,
            in_progress: false,
            jobs: Vec::new(),
            ping: None,
            reference_clock: None,
            error: None,
            checked_at: None,
        }
    }

    pub fn from_jobs(target: &Target, snapshot: JobsSnapshot) -> Self {
        Self {
            status: aggregate_status(&snapshot.jobs),
            jobs: snapshot.jobs,
            reference_clock: Some(snapshot.reference_clock),
            checked_at: Some(Utc::now()),
            ..Self::unchecked(target)
        }
    }

    pub fn from_ping(target: &Target, result: PingResult, reference_clock: NaiveDateTime) -> Self {
        Self {
            status: if result.alive {
                AggregateStatus::Success
            } else {
                AggregateStatus::Error
            },
            ping: Some(result),
            reference_clock: Some(reference_clock),
            checked_at: Some(Utc::now()),
            ..Self::unchecked(target)
        }
    }

    pub fn failed(target: &Target, error: impl Into<String>) -> Self {
        Self {
            status: AggregateStatus::Error,
            error: Some(error.into()),
            checked_at: Some(Utc::now()),
            ..Self::unchecked(target)
        }
    }
}

/// Last settled snapshot of a target plus the probes still running on it.
struct Slot {
    unchecked: TargetSnapshot,
    settled: Option<TargetSnapshot>,
    pending: usize,
}

impl Slot {
    fn new(unchecked: TargetSnapshot) -> Self {
        Self {
            unchecked,
            settled: None,
            pending: 0,
        }
    }

    fn view(&self) -> TargetSnapshot {
        let mut snapshot = self.settled.clone().unwrap_or_else(|| self.unchecked.clone());
        snapshot.in_progress = self.pending > 0;
        snapshot
    }
}

/// Shared map of last-known snapshots keyed by target ID.
///
/// Only finished probes are ever stored as settled; the in-progress flag is
/// derived from the number of probes running on a target, so overlapping
/// refreshes never see each other's pending state as a previous result.
#[derive(Clone, Default)]
pub struct SnapshotBoard {
    inner: Arc<RwLock<HashMap<i64, Slot>>>,
}

impl SnapshotBoard {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<i64, Slot>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<i64, Slot>> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, target_id: i64) -> Option<TargetSnapshot> {
        self.read().get(&target_id).map(Slot::view)
    }

    /// Store a finished snapshot, keeping any running probes flagged.
    pub fn put(&self, mut snapshot: TargetSnapshot) {
        snapshot.in_progress = false;
        let unchecked = TargetSnapshot::blank(
            snapshot.target_id,
            snapshot.target_name.clone(),
            snapshot.probe_kind,
        );
        let target_id = snapshot.target_id;
        self.write()
            .entry(target_id)
            .or_insert_with(|| Slot::new(unchecked))
            .settled = Some(snapshot);
    }

    pub fn remove(&self, target_id: i64) {
        self.write().remove(&target_id);
    }

    /// Every snapshot, ordered by target name.
    pub fn all(&self) -> Vec<TargetSnapshot> {
        let mut all: Vec<_> = self.read().values().map(Slot::view).collect();
        all.sort_by(|a, b| a.target_name.cmp(&b.target_name).then(a.target_id.cmp(&b.target_id)));
        all
    }

    /// Flag `target` as being probed, keeping what was known before.
    ///
    /// The returned guard withdraws the flag unless [`InProgress::complete`]
    /// is called first, so an aborted probe never leaves a target stuck in
    /// progress.
    pub fn begin(&self, target: &Target) -> InProgress {
        self.write()
            .entry(target.id)
            .or_insert_with(|| Slot::new(TargetSnapshot::unchecked(target)))
            .pending += 1;

        InProgress {
            board: self.clone(),
            target_id: target.id,
            armed: true,
        }
    }

    /// Withdraw one running probe and return the settled snapshot, if any.
    fn finish(&self, target_id: i64, snapshot: Option<TargetSnapshot>) -> Option<TargetSnapshot> {
        let mut map = self.write();
        let slot = map.get_mut(&target_id)?;
        slot.pending = slot.pending.saturating_sub(1);
        if let Some(mut snapshot) = snapshot {
            snapshot.in_progress = false;
            slot.settled = Some(snapshot);
        }

        let settled = slot.settled.clone();
        if settled.is_none() && slot.pending == 0 {
            map.remove(&target_id);
        }
        settled
    }
}

/// Marks a running probe; withdraws the mark when dropped while armed.
pub struct InProgress {
    board: SnapshotBoard,
    target_id: i64,
    armed: bool,
}

impl InProgress {
    /// Publish the finished snapshot.
    pub fn complete(mut self, snapshot: TargetSnapshot) {
        self.armed = false;
        self.board.finish(self.target_id, Some(snapshot));
    }

    /// Give up on the probe and return the target's last settled snapshot.
    ///
    /// This is the newest finished result, which may come from an
    /// overlapping probe that completed meanwhile.
    pub fn revert(mut self) -> Option<TargetSnapshot> {
        self.armed = false;
        self.board.finish(self.target_id, None)
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        if self.armed {
            self.board.finish(self.target_id, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: i64) -> Target {
        Target {
            id,
            name: format!("till-{:02}", id),
            ..Default::default()
        }
    }

    #[test]
    fn test_dropped_guard_restores_previous() {
        let board = SnapshotBoard::default();
        let t = target(1);
        board.put(TargetSnapshot::failed(&t, "down"));

        let guard = board.begin(&t);
        assert!(board.get(1).unwrap().in_progress);
        drop(guard);

        let restored = board.get(1).unwrap();
        assert!(!restored.in_progress);
        assert_eq!(restored.error.as_deref(), Some("down"));
    }

    #[test]
    fn test_dropped_guard_forgets_unchecked_target() {
        let board = SnapshotBoard::default();
        let guard = board.begin(&target(2));
        assert_eq!(board.get(2).unwrap().status, AggregateStatus::Warning);
        drop(guard);
        assert!(board.get(2).is_none());
    }

    #[test]
    fn test_completed_guard_keeps_result() {
        let board = SnapshotBoard::default();
        let t = target(3);
        board.begin(&t).complete(TargetSnapshot::failed(&t, "timeout"));

        let snap = board.get(3).unwrap();
        assert_eq!(snap.status, AggregateStatus::Error);
        assert!(!snap.in_progress);
    }

    #[test]
    fn test_stale_guard_does_not_clobber_newer_result() {
        let board = SnapshotBoard::default();
        let t = target(4);

        let first = board.begin(&t);
        board.begin(&t).complete(TargetSnapshot::failed(&t, "newer"));
        drop(first);

        assert_eq!(board.get(4).unwrap().error.as_deref(), Some("newer"));
    }

    #[test]
    fn test_all_is_sorted_by_name() {
        let board = SnapshotBoard::default();
        board.put(TargetSnapshot::unchecked(&target(9)));
        board.put(TargetSnapshot::unchecked(&target(2)));
        let names: Vec<_> = board.all().into_iter().map(|s| s.target_name).collect();
        assert_eq!(names, vec!["till-02", "till-09"]);
    }

    #[test]
    fn test_overlapping_guard_reverts_to_settled_result() {
        let board = SnapshotBoard::default();
        let t = target(5);
        board.put(TargetSnapshot::failed(&t, "old"));

        let first = board.begin(&t);
        let second = board.begin(&t);
        assert!(board.get(5).unwrap().in_progress);

        let reverted = second.revert().unwrap();
        assert!(!reverted.in_progress);
        assert_eq!(reverted.error.as_deref(), Some("old"));
        assert!(board.get(5).unwrap().in_progress);

        first.complete(TargetSnapshot::failed(&t, "fresh"));
        let settled = board.get(5).unwrap();
        assert!(!settled.in_progress);
        assert_eq!(settled.error.as_deref(), Some("fresh"));
    }

    #[test]
    fn test_revert_after_overlapping_completion_returns_newest() {
        let board = SnapshotBoard::default();
        let t = target(6);

        let first = board.begin(&t);
        let second = board.begin(&t);
        first.complete(TargetSnapshot::failed(&t, "fresh"));

        let reverted = second.revert().unwrap();
        assert!(!reverted.in_progress);
        assert_eq!(reverted.error.as_deref(), Some("fresh"));
        assert!(!board.get(6).unwrap().in_progress);
    }
}
