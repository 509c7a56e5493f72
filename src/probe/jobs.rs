//! Job-scheduler driver.
//!
//! Talks to SQL Server Agent through a [`SchedulerSession`]. Every call opens
//! a fresh session and closes it afterwards; no connection outlives a call.

use super::ProbeError;
use crate::db::Target;
use crate::status::{
    decode_agent_datetime, decode_agent_duration, finalize, ExecutionState, Observation, Outcome,
};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Maintenance job present on every instance; never interesting.
pub const NOISE_JOB: &str = "syspolicy_purge_history";

/// Message shown when job history cannot be read with the target's login.
pub const PRIVILEGE_NOTICE: &str = "Requires read permission on msdb.dbo.sysjobhistory";

/// Currency codes shown on the dashboard, in display order.
pub const CURRENCY_CODES: [&str; 4] = ["0000000003", "0000000002", "TFSM", "CXC"];

/// Rows of recent history returned for a single job.
pub const JOB_HISTORY_LIMIT: u32 = 15;

/// A job as listed by `sp_help_job`.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentJob {
    pub name: String,
    pub enabled: bool,
    pub current_execution_status: i32,
    pub last_run_date: i32,
    pub last_run_time: i32,
    pub last_run_outcome: i32,
}

/// One row of agent job history.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRun {
    pub run_status: i32,
    pub run_date: i32,
    pub run_time: i32,
    pub run_duration: i32,
    pub message: String,
}

/// A job joined with its live activity and, when readable, its latest run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActivityRow {
    pub job_name: String,
    pub started_at: Option<NaiveDateTime>,
    pub stopped_at: Option<NaiveDateTime>,
    pub last_run: Option<RawRun>,
}

/// Database holding exchange rates on a remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatesSource {
    /// Point-of-sale terminal database
    Terminal,
    /// Branch server database
    Server,
}

impl RatesSource {
    pub fn database(&self) -> &'static str {
        match self {
            RatesSource::Terminal => "ADM_LOCAL",
            RatesSource::Server => "VAD10",
        }
    }
}

/// One active exchange rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyRate {
    pub code: String,
    pub description: String,
    pub factor: f64,
    pub symbol: String,
    pub active: bool,
}

/// One past run of a job, normalized.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub outcome: Outcome,
    pub run_at: Option<NaiveDateTime>,
    pub duration: String,
    pub message: String,
}

/// Observations of one target plus the remote clock they were taken against.
#[derive(Debug, Clone, PartialEq)]
pub struct JobsSnapshot {
    pub jobs: Vec<Observation>,
    pub reference_clock: NaiveDateTime,
}

/// An open connection to one remote scheduler.
///
/// Dropping a session must release its connection, so a cancelled probe
/// never leaks a socket.
#[async_trait]
pub trait SchedulerSession: Send {
    /// Current wall-clock time of the remote host.
    async fn server_time(&mut self) -> Result<NaiveDateTime, ProbeError>;
    /// `sp_help_job` for all jobs.
    async fn agent_jobs(&mut self) -> Result<Vec<AgentJob>, ProbeError>;
    /// Latest `sp_help_jobhistory` row for a job.
    async fn latest_run(&mut self, job_name: &str) -> Result<Option<RawRun>, ProbeError>;
    /// Consolidated job + activity + latest history query.
    async fn job_activity(&mut self) -> Result<Vec<ActivityRow>, ProbeError>;
    /// Job + activity only; needs no access to job history.
    async fn job_activity_without_history(&mut self) -> Result<Vec<ActivityRow>, ProbeError>;
    /// Most recent job-level outcomes of one job, newest first.
    async fn recent_runs(&mut self, job_name: &str, limit: u32) -> Result<Vec<RawRun>, ProbeError>;
    async fn start_job(&mut self, job_name: &str) -> Result<(), ProbeError>;
    async fn stop_job(&mut self, job_name: &str) -> Result<(), ProbeError>;
    async fn currency_rates(&mut self, source: RatesSource) -> Result<Vec<CurrencyRate>, ProbeError>;
    /// Graceful close. Errors are not interesting at this point.
    async fn close(self: Box<Self>);
}

/// Opens sessions to remote schedulers.
#[async_trait]
pub trait SchedulerConnector: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Box<dyn SchedulerSession>, ProbeError>;
}

/// Scheduler driver: connection lifecycle plus normalization.
pub struct JobsDriver {
    connector: Arc<dyn SchedulerConnector>,
    query_timeout: Duration,
}

impl JobsDriver {
    pub fn new(connector: Arc<dyn SchedulerConnector>, query_timeout: Duration) -> Self {
        Self {
            connector,
            query_timeout,
        }
    }

    /// Fetch normalized observations for every enabled job on `target`.
    pub async fn fetch_jobs(&self, target: &Target) -> Result<JobsSnapshot, ProbeError> {
        self.bounded(async {
            let mut session = self.connector.connect(target).await?;
            let result = collect_jobs(session.as_mut(), target).await;
            session.close().await;
            result
        })
        .await
    }

    /// Submit a start command. Success means the scheduler accepted it.
    pub async fn start_job(&self, target: &Target, job_name: &str) -> Result<(), ProbeError> {
        tracing::info!("Starting job {:?} on {}", job_name, target.name);
        self.bounded(async {
            let mut session = self.connector.connect(target).await?;
            let result = session.start_job(job_name).await;
            session.close().await;
            result
        })
        .await
        .map_err(as_command_error)
    }

    /// Submit a stop command. Success means the scheduler accepted it.
    pub async fn stop_job(&self, target: &Target, job_name: &str) -> Result<(), ProbeError> {
        tracing::info!("Stopping job {:?} on {}", job_name, target.name);
        self.bounded(async {
            let mut session = self.connector.connect(target).await?;
            let result = session.stop_job(job_name).await;
            session.close().await;
            result
        })
        .await
        .map_err(as_command_error)
    }

    /// Last [`JOB_HISTORY_LIMIT`] job-level outcomes of one job.
    pub async fn job_history(&self, target: &Target, job_name: &str) -> Result<Vec<JobRun>, ProbeError> {
        let runs = self
            .bounded(async {
                let mut session = self.connector.connect(target).await?;
                let result = session.recent_runs(job_name, JOB_HISTORY_LIMIT).await;
                session.close().await;
                result
            })
            .await?;

        Ok(runs
            .into_iter()
            .map(|r| JobRun {
                outcome: Outcome::from_run_status(r.run_status),
                run_at: decode_agent_datetime(r.run_date, r.run_time),
                duration: decode_agent_duration(r.run_duration),
                message: r.message,
            })
            .collect())
    }

    /// Active exchange rates of a terminal or branch server.
    pub async fn currency_rates(&self, target: &Target) -> Result<Vec<CurrencyRate>, ProbeError> {
        let source = if target.is_server {
            RatesSource::Server
        } else {
            RatesSource::Terminal
        };

        let mut rates = self
            .bounded(async {
                let mut session = self.connector.connect(target).await?;
                let result = session.currency_rates(source).await;
                session.close().await;
                result
            })
            .await?;
        sort_rates(&mut rates);
        Ok(rates)
    }

    /// Apply the per-call deadline.
    ///
    /// On expiry the inner future is dropped together with its session,
    /// which releases the connection.
    async fn bounded<T>(
        &self,
        work: impl Future<Output = Result<T, ProbeError>>,
    ) -> Result<T, ProbeError> {
        match tokio::time::timeout(self.query_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.query_timeout)),
        }
    }
}

async fn collect_jobs(
    session: &mut dyn SchedulerSession,
    target: &Target,
) -> Result<JobsSnapshot, ProbeError> {
    let reference_clock = session.server_time().await?;

    let primary = if target.is_server {
        server_jobs(session).await
    } else {
        session
            .job_activity()
            .await
            .map(|rows| rows.into_iter().map(observation_from_activity).collect())
    };

    let jobs = match primary {
        Ok(jobs) => jobs,
        Err(ProbeError::PermissionDenied(msg)) => {
            tracing::warn!(
                "Restricted login on {} ({}), falling back to activity-only query",
                target.name,
                msg
            );
            session
                .job_activity_without_history()
                .await?
                .into_iter()
                .map(observation_without_history)
                .collect()
        }
        Err(e) => return Err(e),
    };

    let jobs = jobs
        .into_iter()
        .filter(|j| !is_noise_job(&j.job_name))
        .map(|j| finalize(j, reference_clock))
        .collect();

    Ok(JobsSnapshot {
        jobs,
        reference_clock,
    })
}

/// Scheduler-class hosts: job list, then one history lookup per job.
async fn server_jobs(session: &mut dyn SchedulerSession) -> Result<Vec<Observation>, ProbeError> {
    let jobs = session.agent_jobs().await?;
    let mut observations = Vec::with_capacity(jobs.len());

    for job in jobs.into_iter().filter(|j| j.enabled && !is_noise_job(&j.name)) {
        let (message, duration) = match session.latest_run(&job.name).await {
            Ok(Some(run)) => (run.message, decode_agent_duration(run.run_duration)),
            Ok(None) => (String::new(), decode_agent_duration(0)),
            Err(ProbeError::PermissionDenied(_)) => {
                (PRIVILEGE_NOTICE.to_string(), decode_agent_duration(0))
            }
            Err(e) => {
                tracing::warn!("History lookup failed for job {:?}: {}", job.name, e);
                (String::new(), decode_agent_duration(0))
            }
        };

        observations.push(Observation {
            execution_state: ExecutionState::from_execution_status(job.current_execution_status),
            last_outcome: Outcome::from_job_outcome(job.last_run_outcome),
            last_run: decode_agent_datetime(job.last_run_date, job.last_run_time),
            last_duration: Some(duration),
            last_message: message,
            stale: false,
            job_name: job.name,
        });
    }

    Ok(observations)
}

fn is_running(row: &ActivityRow) -> bool {
    row.started_at.is_some() && row.stopped_at.is_none()
}

fn observation_from_activity(row: ActivityRow) -> Observation {
    let running = is_running(&row);
    let last_run = if running {
        row.started_at
    } else {
        row.last_run
            .as_ref()
            .and_then(|r| decode_agent_datetime(r.run_date, r.run_time))
    };

    Observation {
        execution_state: if running {
            ExecutionState::Running
        } else {
            ExecutionState::Idle
        },
        last_outcome: row
            .last_run
            .as_ref()
            .map(|r| Outcome::from_run_status(r.run_status))
            .unwrap_or(Outcome::Unknown),
        last_run,
        last_duration: row.last_run.as_ref().map(|r| decode_agent_duration(r.run_duration)),
        last_message: row.last_run.map(|r| r.message).unwrap_or_default(),
        stale: false,
        job_name: row.job_name,
    }
}

fn observation_without_history(row: ActivityRow) -> Observation {
    Observation {
        execution_state: if is_running(&row) {
            ExecutionState::Running
        } else {
            ExecutionState::Idle
        },
        last_outcome: Outcome::Unknown,
        last_run: row.started_at,
        last_duration: None,
        last_message: PRIVILEGE_NOTICE.to_string(),
        stale: false,
        job_name: row.job_name,
    }
}

pub fn is_noise_job(name: &str) -> bool {
    name == NOISE_JOB
}

/// Order rates as [`CURRENCY_CODES`] lists them; unknown codes go last.
pub fn sort_rates(rates: &mut [CurrencyRate]) {
    rates.sort_by_key(|r| {
        CURRENCY_CODES
            .iter()
            .position(|c| *c == r.code.trim())
            .unwrap_or(CURRENCY_CODES.len())
    });
}

fn as_command_error(err: ProbeError) -> ProbeError {
    match err {
        ProbeError::PermissionDenied(msg) | ProbeError::QueryFailed(msg) => {
            ProbeError::CommandRejected(msg)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::{ts, FakeConnector, FakeScheduler};
    use crate::status::{aggregate_status, AggregateStatus};

    fn target(address: &str, is_server: bool) -> Target {
        Target {
            id: 1,
            name: format!("host {}", address),
            address: address.to_string(),
            principal: "monitor".to_string(),
            is_server,
            ..Default::default()
        }
    }

    fn run(status: i32, date: i32, time: i32, duration: i32, message: &str) -> RawRun {
        RawRun {
            run_status: status,
            run_date: date,
            run_time: time,
            run_duration: duration,
            message: message.to_string(),
        }
    }

    fn agent_job(name: &str, status: i32, outcome: i32) -> AgentJob {
        AgentJob {
            name: name.to_string(),
            enabled: true,
            current_execution_status: status,
            last_run_date: 20240315,
            last_run_time: 10000,
            last_run_outcome: outcome,
        }
    }

    fn driver(connector: FakeConnector) -> JobsDriver {
        JobsDriver::new(Arc::new(connector), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_server_jobs_use_help_job_and_history() {
        let mut host = FakeScheduler::at(ts("2024-03-15 12:00:00"));
        host.agent_jobs = vec![
            agent_job("Backup", 4, 1),
            agent_job("Sync", 1, 0),
            agent_job(NOISE_JOB, 4, 1),
            AgentJob {
                enabled: false,
                ..agent_job("Disabled", 4, 0)
            },
        ];
        host.latest_runs
            .insert("Backup".to_string(), run(1, 20240315, 10000, 10230, "ok"));
        let connector = FakeConnector::default().with_host("srv", host);
        let open = connector.open.clone();

        let snapshot = driver(connector).fetch_jobs(&target("srv", true)).await.unwrap();

        assert_eq!(snapshot.reference_clock, ts("2024-03-15 12:00:00"));
        assert_eq!(snapshot.jobs.len(), 2);

        let backup = &snapshot.jobs[0];
        assert_eq!(backup.job_name, "Backup");
        assert_eq!(backup.execution_state, ExecutionState::Idle);
        assert_eq!(backup.last_outcome, Outcome::Success);
        assert_eq!(backup.last_run, Some(ts("2024-03-15 01:00:00")));
        assert_eq!(backup.last_duration.as_deref(), Some("01:02:30"));
        assert_eq!(backup.last_message, "ok");
        assert!(!backup.stale);

        let sync = &snapshot.jobs[1];
        assert_eq!(sync.execution_state, ExecutionState::Running);
        assert_eq!(sync.last_outcome, Outcome::Failure);
        // Running duration is measured live against the server clock
        assert_eq!(sync.last_duration.as_deref(), Some("11:00:00"));

        assert_eq!(aggregate_status(&snapshot.jobs), AggregateStatus::Warning);
        assert_eq!(open.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_terminal_jobs_use_consolidated_query() {
        let mut host = FakeScheduler::at(ts("2024-03-15 12:00:00"));
        host.activity = vec![
            ActivityRow {
                job_name: "Upload sales".to_string(),
                started_at: Some(ts("2024-03-14 08:00:00")),
                stopped_at: Some(ts("2024-03-14 08:05:00")),
                last_run: Some(run(0, 20240314, 80000, 500, "Login failed")),
            },
            ActivityRow {
                job_name: "Prices".to_string(),
                started_at: Some(ts("2024-03-15 11:59:00")),
                stopped_at: None,
                last_run: Some(run(1, 20240314, 70000, 30, "done")),
            },
            ActivityRow {
                job_name: "Never run".to_string(),
                ..Default::default()
            },
        ];
        let connector = FakeConnector::default().with_host("till", host);

        let snapshot = driver(connector).fetch_jobs(&target("till", false)).await.unwrap();
        let jobs = &snapshot.jobs;

        assert_eq!(jobs[0].last_outcome, Outcome::Failure);
        assert_eq!(jobs[0].last_duration.as_deref(), Some("00:05:00"));
        assert!(jobs[0].stale);

        assert_eq!(jobs[1].execution_state, ExecutionState::Running);
        assert_eq!(jobs[1].last_run, Some(ts("2024-03-15 11:59:00")));
        assert_eq!(jobs[1].last_duration.as_deref(), Some("00:01:00"));
        assert!(!jobs[1].stale);

        assert_eq!(jobs[2].last_outcome, Outcome::Unknown);
        assert_eq!(jobs[2].last_run, None);
        assert_eq!(jobs[2].last_duration, None);
        assert!(!jobs[2].stale);
    }

    #[tokio::test]
    async fn test_privilege_fallback_degrades_instead_of_failing() {
        for is_server in [false, true] {
            let mut host = FakeScheduler::at(ts("2024-03-15 12:00:00"));
            host.restricted = true;
            host.activity = vec![
                ActivityRow {
                    job_name: "Upload sales".to_string(),
                    started_at: Some(ts("2024-03-15 11:00:00")),
                    stopped_at: None,
                    last_run: Some(run(0, 20240314, 80000, 500, "hidden")),
                },
                ActivityRow {
                    job_name: "Prices".to_string(),
                    ..Default::default()
                },
            ];
            let connector = FakeConnector::default().with_host("restricted", host);

            let snapshot = driver(connector)
                .fetch_jobs(&target("restricted", is_server))
                .await
                .unwrap();

            assert_eq!(snapshot.jobs.len(), 2);
            for job in &snapshot.jobs {
                assert_eq!(job.last_outcome, Outcome::Unknown);
                assert_eq!(job.last_message, PRIVILEGE_NOTICE);
            }
            assert_eq!(snapshot.jobs[0].execution_state, ExecutionState::Running);
            assert_eq!(snapshot.jobs[0].last_duration.as_deref(), Some("01:00:00"));
            assert_eq!(snapshot.jobs[1].execution_state, ExecutionState::Idle);
            assert_eq!(snapshot.jobs[1].last_duration, None);
        }
    }

    #[tokio::test]
    async fn test_server_history_denial_only_affects_message() {
        let mut host = FakeScheduler::at(ts("2024-03-15 12:00:00"));
        host.agent_jobs = vec![agent_job("Backup", 4, 0)];
        host.deny_latest_run = true;
        let connector = FakeConnector::default().with_host("srv", host);

        let snapshot = driver(connector).fetch_jobs(&target("srv", true)).await.unwrap();

        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].last_outcome, Outcome::Failure);
        assert_eq!(snapshot.jobs[0].last_message, PRIVILEGE_NOTICE);
        assert_eq!(aggregate_status(&snapshot.jobs), AggregateStatus::Error);
    }

    #[tokio::test]
    async fn test_unknown_host_is_unreachable() {
        let result = driver(FakeConnector::default())
            .fetch_jobs(&target("10.9.9.9", false))
            .await;
        assert!(matches!(result, Err(ProbeError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_other_query_errors_propagate() {
        let mut host = FakeScheduler::at(ts("2024-03-15 12:00:00"));
        host.fail_queries = true;
        let connector = FakeConnector::default().with_host("broken", host);
        let open = connector.open.clone();

        let result = driver(connector).fetch_jobs(&target("broken", false)).await;
        assert!(matches!(result, Err(ProbeError::QueryFailed(_))));
        assert_eq!(open.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_target_times_out_and_releases_connection() {
        let mut host = FakeScheduler::at(ts("2024-03-15 12:00:00"));
        host.query_delay = Some(Duration::from_secs(60));
        let connector = FakeConnector::default().with_host("slow", host);
        let open = connector.open.clone();

        let result = driver(connector).fetch_jobs(&target("slow", false)).await;
        assert_eq!(result, Err(ProbeError::Timeout(Duration::from_secs(5))));
        assert_eq!(open.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_report_submission_only() {
        let mut host = FakeScheduler::at(ts("2024-03-15 12:00:00"));
        host.reject_commands = vec!["Missing".to_string()];
        let connector = FakeConnector::default().with_host("till", host);
        let commands = connector.commands.clone();
        let driver = driver(connector);
        let till = target("till", false);

        driver.start_job(&till, "Prices").await.unwrap();
        driver.stop_job(&till, "Prices").await.unwrap();
        assert_eq!(
            *commands.lock().unwrap(),
            vec!["start Prices".to_string(), "stop Prices".to_string()]
        );

        let err = driver.start_job(&till, "Missing").await.unwrap_err();
        assert!(matches!(err, ProbeError::CommandRejected(_)));
    }

    #[tokio::test]
    async fn test_job_history_is_normalized() {
        let mut host = FakeScheduler::at(ts("2024-03-15 12:00:00"));
        host.runs = vec![
            run(1, 20240315, 93000, 45, "succeeded"),
            run(2, 20240314, 93000, 0, "retry"),
            run(7, 20240313, 93000, 12, "odd"),
        ];
        let connector = FakeConnector::default().with_host("till", host);

        let runs = driver(connector)
            .job_history(&target("till", false), "Prices")
            .await
            .unwrap();

        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].outcome, Outcome::Success);
        assert_eq!(runs[0].run_at, Some(ts("2024-03-15 09:30:00")));
        assert_eq!(runs[0].duration, "00:00:45");
        assert_eq!(runs[1].outcome, Outcome::Retrying);
        assert_eq!(runs[2].outcome, Outcome::Unknown);
    }

    #[tokio::test]
    async fn test_currency_rates_source_and_order() {
        let mut host = FakeScheduler::at(ts("2024-03-15 12:00:00"));
        host.rates = vec![
            rate("CXC", 1.0),
            rate("0000000002", 36.5),
            rate("0000000003", 40.1),
        ];
        let connector = FakeConnector::default().with_host("srv", host);
        let sources = connector.rate_sources.clone();
        let driver = driver(connector);

        let rates = driver.currency_rates(&target("srv", true)).await.unwrap();
        let codes: Vec<_> = rates.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["0000000003", "0000000002", "CXC"]);

        driver.currency_rates(&target("srv", false)).await.unwrap();
        assert_eq!(
            *sources.lock().unwrap(),
            vec![RatesSource::Server, RatesSource::Terminal]
        );
    }

    fn rate(code: &str, factor: f64) -> CurrencyRate {
        CurrencyRate {
            code: code.to_string(),
            description: code.to_string(),
            factor,
            symbol: "$".to_string(),
            active: true,
        }
    }
}
