//! Fan-out aggregator: probes many targets concurrently and keeps the
//! last-known status of each.

mod batch;
mod snapshot;

pub use batch::*;
pub use snapshot::*;

use crate::db::{DbError, HistoryRecord, ProbeKind, Store, Target, TargetFilter};
use crate::probe::{JobsDriver, PingResult, Pinger};

use chrono::{Local, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs probes and publishes their snapshots.
#[derive(Clone)]
pub struct Aggregator {
    jobs: Arc<JobsDriver>,
    pinger: Arc<dyn Pinger>,
    store: Store,
    board: SnapshotBoard,
    max_concurrent: usize,
}

impl Aggregator {
    /// `max_concurrent` caps probes per refresh; 0 means unlimited.
    pub fn new(
        jobs: Arc<JobsDriver>,
        pinger: Arc<dyn Pinger>,
        store: Store,
        max_concurrent: usize,
    ) -> Self {
        Self {
            jobs,
            pinger,
            store,
            board: SnapshotBoard::default(),
            max_concurrent,
        }
    }

    /// Probe every target concurrently.
    ///
    /// Returns one snapshot per target, in input order. A failing target
    /// yields an error snapshot and never affects its siblings. Targets
    /// still running when `cancel` fires keep their previous snapshot.
    pub async fn refresh_all(&self, targets: &[Target], cancel: &CancellationToken) -> Vec<TargetSnapshot> {
        tracing::info!("Refreshing {} targets", targets.len());

        let limit = (self.max_concurrent > 0).then(|| Arc::new(Semaphore::new(self.max_concurrent)));
        let mut tasks = JoinSet::new();

        for (slot, target) in targets.iter().cloned().enumerate() {
            let this = self.clone();
            let cancel = cancel.clone();
            let limit = limit.clone();

            tasks.spawn(async move {
                let _permit = match limit {
                    Some(sem) => tokio::select! {
                        _ = cancel.cancelled() => None,
                        permit = sem.acquire_owned() => permit.ok(),
                    },
                    None => None,
                };
                (slot, this.refresh_one(&target, &cancel).await)
            });
        }

        let mut results: Vec<Option<TargetSnapshot>> = vec![None; targets.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, snapshot)) => results[slot] = Some(snapshot),
                Err(e) => tracing::error!("Probe task failed: {}", e),
            }
        }

        // Only a panicking probe leaves a slot empty
        results
            .into_iter()
            .zip(targets)
            .map(|(snapshot, target)| {
                snapshot.unwrap_or_else(|| {
                    let failed = TargetSnapshot::failed(target, "probe task failed");
                    self.board.put(failed.clone());
                    failed
                })
            })
            .collect()
    }

    /// Probe a single target.
    ///
    /// On cancellation the target's last settled snapshot is returned; a
    /// target that was never checked comes back as unchecked.
    pub async fn refresh_one(&self, target: &Target, cancel: &CancellationToken) -> TargetSnapshot {
        if cancel.is_cancelled() {
            return self.previous_or_unchecked(target);
        }

        let guard = self.board.begin(target);
        let probed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            snapshot = self.probe(target) => Some(snapshot),
        };

        match probed {
            Some(snapshot) => {
                guard.complete(snapshot.clone());
                snapshot
            }
            None => {
                tracing::info!("Refresh of {} cancelled, keeping previous status", target.name);
                guard
                    .revert()
                    .unwrap_or_else(|| TargetSnapshot::unchecked(target))
            }
        }
    }

    fn previous_or_unchecked(&self, target: &Target) -> TargetSnapshot {
        let mut snapshot = self
            .board
            .get(target.id)
            .unwrap_or_else(|| TargetSnapshot::unchecked(target));
        snapshot.in_progress = false;
        snapshot
    }

    async fn probe(&self, target: &Target) -> TargetSnapshot {
        match target.probe_kind {
            ProbeKind::Jobs => match self.jobs.fetch_jobs(target).await {
                Ok(jobs) => TargetSnapshot::from_jobs(target, jobs),
                Err(e) => {
                    tracing::error!("Job probe failed for {}: {}", target.name, e);
                    TargetSnapshot::failed(target, e.to_string())
                }
            },
            ProbeKind::Ping => {
                let result = self.ping_target(target).await;
                TargetSnapshot::from_ping(target, result, Local::now().naive_local())
            }
        }
    }

    /// Ping a target and append the result to its history.
    ///
    /// A history write failure is logged, the ping result still returned.
    pub async fn ping_target(&self, target: &Target) -> PingResult {
        let result = self.pinger.ping(&target.address).await;

        let record = history_record(target.id, &result);
        if let Err(e) = self.store.append_history(&record) {
            tracing::error!("Failed to record ping history for {}: {}", target.name, e);
        }
        result
    }

    /// Ping several targets in parallel, results in input order.
    pub async fn ping_all(&self, targets: &[Target]) -> Vec<PingResult> {
        let mut tasks = JoinSet::new();
        for (slot, target) in targets.iter().cloned().enumerate() {
            let this = self.clone();
            tasks.spawn(async move { (slot, this.ping_target(&target).await) });
        }

        let mut results: Vec<Option<PingResult>> = vec![None; targets.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, result)) => results[slot] = Some(result),
                Err(e) => tracing::error!("Ping task failed: {}", e),
            }
        }

        results
            .into_iter()
            .zip(targets)
            .map(|(result, target)| result.unwrap_or_else(|| PingResult::unreachable(&target.address)))
            .collect()
    }

    /// Last-known snapshot of every probed target.
    pub fn snapshots(&self) -> Vec<TargetSnapshot> {
        self.board.all()
    }

    pub fn snapshot(&self, target_id: i64) -> Option<TargetSnapshot> {
        self.board.get(target_id)
    }

    /// Seed reachability snapshots from the last persisted check of every
    /// active ping target, so status survives a restart.
    pub fn restore_from_history(&self) -> Result<usize, DbError> {
        let filter = TargetFilter {
            kind: Some(ProbeKind::Ping),
            ..Default::default()
        };
        let targets = self.store.list_targets(&filter)?;
        let ids: Vec<i64> = targets.iter().map(|t| t.id).collect();
        let latest = self.store.latest_history(&ids)?;

        let mut restored = 0;
        for target in &targets {
            let Some(record) = latest.get(&target.id) else {
                continue;
            };
            if self.board.get(target.id).is_some() {
                continue;
            }
            let snapshot = TargetSnapshot {
                checked_at: Some(record.checked_at),
                ..TargetSnapshot::from_ping(
                    target,
                    replayed_ping(target, record),
                    record.checked_at.with_timezone(&Local).naive_local(),
                )
            };
            self.board.put(snapshot);
            restored += 1;
        }

        tracing::info!("Restored {} reachability snapshots from history", restored);
        Ok(restored)
    }

    /// Drop what is known about a deleted target.
    pub fn forget(&self, target_id: i64) {
        self.board.remove(target_id);
    }
}

fn history_record(target_id: i64, result: &PingResult) -> HistoryRecord {
    HistoryRecord {
        id: 0,
        target_id,
        is_alive: result.alive,
        response_time: result.avg,
        packet_loss: Some(result.packet_loss.clone()),
        min_time: result.min,
        max_time: result.max,
        avg_time: result.avg,
        error_message: (!result.alive).then(|| "Host unreachable".to_string()),
        checked_at: Utc::now(),
    }
}

/// Rebuild a ping result from its history row.
fn replayed_ping(target: &Target, record: &HistoryRecord) -> PingResult {
    PingResult {
        alive: record.is_alive,
        time: None,
        packet_loss: record
            .packet_loss
            .clone()
            .unwrap_or_else(|| if record.is_alive { "0%" } else { "100%" }.to_string()),
        min: record.min_time,
        max: record.max_time,
        avg: record.avg_time,
        host: target.address.clone(),
        numeric_host: None,
    }
}
