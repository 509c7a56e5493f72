//! Scripted stand-ins for remote hosts, used by unit tests.

use super::*;
use crate::db::Target;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

/// Canned state of one remote scheduler.
#[derive(Debug, Clone, Default)]
pub struct FakeScheduler {
    pub server_time: NaiveDateTime,
    pub agent_jobs: Vec<AgentJob>,
    pub latest_runs: HashMap<String, RawRun>,
    pub activity: Vec<ActivityRow>,
    pub runs: Vec<RawRun>,
    pub rates: Vec<CurrencyRate>,
    /// Login lacks agent reader rights: job listing and history are denied.
    pub restricted: bool,
    /// Only the per-job history lookup is denied.
    pub deny_latest_run: bool,
    pub fail_queries: bool,
    pub reject_commands: Vec<String>,
    /// Every query sleeps this long first.
    pub query_delay: Option<Duration>,
}

impl FakeScheduler {
    pub fn at(server_time: NaiveDateTime) -> Self {
        Self {
            server_time,
            ..Default::default()
        }
    }
}

/// Connector resolving target addresses to scripted hosts.
#[derive(Default)]
pub struct FakeConnector {
    hosts: Mutex<HashMap<String, FakeScheduler>>,
    /// Sessions opened so far.
    pub connects: Arc<AtomicUsize>,
    /// Sessions currently open.
    pub open: Arc<AtomicUsize>,
    pub commands: Arc<Mutex<Vec<String>>>,
    pub rate_sources: Arc<Mutex<Vec<RatesSource>>>,
}

impl FakeConnector {
    pub fn with_host(self, address: &str, host: FakeScheduler) -> Self {
        self.set_host(address, host);
        self
    }

    pub fn set_host(&self, address: &str, host: FakeScheduler) {
        self.hosts.lock().unwrap().insert(address.to_string(), host);
    }
}

#[async_trait]
impl SchedulerConnector for FakeConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn SchedulerSession>, ProbeError> {
        let host = self
            .hosts
            .lock()
            .unwrap()
            .get(&target.address)
            .cloned()
            .ok_or_else(|| ProbeError::Unreachable(format!("no route to {}", target.address)))?;

        self.connects.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            host,
            open: self.open.clone(),
            commands: self.commands.clone(),
            rate_sources: self.rate_sources.clone(),
        }))
    }
}

struct FakeSession {
    host: FakeScheduler,
    open: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
    rate_sources: Arc<Mutex<Vec<RatesSource>>>,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeSession {
    async fn query(&self) -> Result<(), ProbeError> {
        if let Some(delay) = self.host.query_delay {
            tokio::time::sleep(delay).await;
        }
        if self.host.fail_queries {
            return Err(ProbeError::QueryFailed("Invalid object name".to_string()));
        }
        Ok(())
    }

    fn denied(&self) -> Result<(), ProbeError> {
        if self.host.restricted {
            return Err(ProbeError::PermissionDenied(
                "The SELECT permission was denied on the object 'sysjobhistory'".to_string(),
            ));
        }
        Ok(())
    }

    fn command(&self, verb: &str, job_name: &str) -> Result<(), ProbeError> {
        if self.host.reject_commands.iter().any(|j| j == job_name) {
            return Err(ProbeError::QueryFailed(format!(
                "The specified @job_name ('{}') does not exist.",
                job_name
            )));
        }
        self.commands
            .lock()
            .unwrap()
            .push(format!("{} {}", verb, job_name));
        Ok(())
    }
}

#[async_trait]
impl SchedulerSession for FakeSession {
    async fn server_time(&mut self) -> Result<NaiveDateTime, ProbeError> {
        self.query().await?;
        Ok(self.host.server_time)
    }

    async fn agent_jobs(&mut self) -> Result<Vec<AgentJob>, ProbeError> {
        self.query().await?;
        self.denied()?;
        Ok(self.host.agent_jobs.clone())
    }

    async fn latest_run(&mut self, job_name: &str) -> Result<Option<RawRun>, ProbeError> {
        self.query().await?;
        self.denied()?;
        if self.host.deny_latest_run {
            return Err(ProbeError::PermissionDenied(
                "EXECUTE permission denied on sp_help_jobhistory".to_string(),
            ));
        }
        Ok(self.host.latest_runs.get(job_name).cloned())
    }

    async fn job_activity(&mut self) -> Result<Vec<ActivityRow>, ProbeError> {
        self.query().await?;
        self.denied()?;
        Ok(self.host.activity.clone())
    }

    async fn job_activity_without_history(&mut self) -> Result<Vec<ActivityRow>, ProbeError> {
        self.query().await?;
        Ok(self
            .host
            .activity
            .iter()
            .map(|row| ActivityRow {
                last_run: None,
                ..row.clone()
            })
            .collect())
    }

    async fn recent_runs(&mut self, _job_name: &str, limit: u32) -> Result<Vec<RawRun>, ProbeError> {
        self.query().await?;
        self.denied()?;
        Ok(self.host.runs.iter().take(limit as usize).cloned().collect())
    }

    async fn start_job(&mut self, job_name: &str) -> Result<(), ProbeError> {
        self.query().await?;
        self.command("start", job_name)
    }

    async fn stop_job(&mut self, job_name: &str) -> Result<(), ProbeError> {
        self.query().await?;
        self.command("stop", job_name)
    }

    async fn currency_rates(&mut self, source: RatesSource) -> Result<Vec<CurrencyRate>, ProbeError> {
        self.query().await?;
        self.rate_sources.lock().unwrap().push(source);
        Ok(self.host.rates.clone())
    }

    async fn close(self: Box<Self>) {}
}

/// Pinger answering from a fixed set of live hosts.
#[derive(Default)]
pub struct FakePinger {
    alive: Mutex<HashSet<String>>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl FakePinger {
    pub fn with_alive(hosts: &[&str]) -> Self {
        Self {
            alive: Mutex::new(hosts.iter().map(|h| h.to_string()).collect()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Pinger for FakePinger {
    async fn ping(&self, host: &str) -> PingResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.alive.lock().unwrap().contains(host) {
            PingResult::from_samples(host, host, 4, &[12.0, 10.0, 14.0, 12.0])
        } else {
            PingResult::unreachable(host)
        }
    }
}
