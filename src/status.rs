//! Status normalization and staleness model.
//!
//! Remote schedulers report job state as vendor codes and packed integers.
//! Everything is decoded here into a small closed vocabulary so the rest of
//! the crate never branches on raw values.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Whether a job is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Idle,
    Running,
}

impl ExecutionState {
    /// Map `current_execution_status` from `sp_help_job`; only 1 is executing.
    pub fn from_execution_status(code: i32) -> Self {
        if code == 1 {
            ExecutionState::Running
        } else {
            ExecutionState::Idle
        }
    }
}

/// Outcome of the most recent completed run of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
    Cancelled,
    Retrying,
    Unknown,
}

impl Outcome {
    /// Map a `last_run_outcome` code as reported by `sp_help_job`.
    pub fn from_job_outcome(code: i32) -> Self {
        match code {
            1 => Outcome::Success,
            0 => Outcome::Failure,
            3 => Outcome::Cancelled,
            _ => Outcome::Unknown,
        }
    }

    /// Map a `run_status` code from `sysjobhistory`.
    pub fn from_run_status(code: i32) -> Self {
        match code {
            1 => Outcome::Success,
            0 => Outcome::Failure,
            2 => Outcome::Retrying,
            3 => Outcome::Cancelled,
            _ => Outcome::Unknown,
        }
    }
}

/// Single health indicator derived for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    Success,
    Warning,
    Error,
}

/// One normalized job observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub job_name: String,
    pub execution_state: ExecutionState,
    pub last_outcome: Outcome,
    /// Wall-clock time on the remote host. Never carries a timezone marker.
    pub last_run: Option<NaiveDateTime>,
    pub last_duration: Option<String>,
    pub last_message: String,
    pub stale: bool,
}

/// Derive the aggregate status of a job target.
///
/// Running dominates Failure: operators must see in-flight work first.
/// A target without jobs has never produced a usable observation.
pub fn aggregate_status(jobs: &[Observation]) -> AggregateStatus {
    if jobs.is_empty() {
        return AggregateStatus::Warning;
    }
    if jobs
        .iter()
        .any(|j| j.execution_state == ExecutionState::Running)
    {
        return AggregateStatus::Warning;
    }
    if jobs.iter().any(|j| j.last_outcome == Outcome::Failure) {
        return AggregateStatus::Error;
    }
    AggregateStatus::Success
}

/// Decode an agent `YYYYMMDD` date and `HHMMSS` time pair.
///
/// Zero or out-of-range dates mean "never run".
pub fn decode_agent_datetime(date: i32, time: i32) -> Option<NaiveDateTime> {
    if date <= 0 {
        return None;
    }
    let day = NaiveDate::from_ymd_opt(date / 10_000, (date / 100 % 100) as u32, (date % 100) as u32)?;
    let (h, m, s) = split_hhmmss(time.max(0));
    let clock = NaiveTime::from_hms_opt(h, m, s).unwrap_or(NaiveTime::MIN);
    Some(day.and_time(clock))
}

/// Decode an agent `HHMMSS` duration into `HH:MM:SS`.
///
/// Hours are not capped at 24, a job may run for days.
pub fn decode_agent_duration(packed: i32) -> String {
    let (h, m, s) = split_hhmmss(packed.max(0));
    format!("{:02}:{:02}:{:02}", h, m, s)
}

fn split_hhmmss(packed: i32) -> (u32, u32, u32) {
    let packed = packed as u32;
    (packed / 10_000, packed / 100 % 100, packed % 100)
}

/// Format the elapsed time between `start` and `reference` as `HH:MM:SS`.
///
/// Clock skew that puts `start` after `reference` yields zero.
pub fn format_elapsed(start: NaiveDateTime, reference: NaiveDateTime) -> String {
    let secs = (reference - start).num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

/// Whether `last_run` falls on a different calendar day than `reference`.
///
/// Both values are naive readings of the same remote clock, so the
/// comparison is a plain date comparison with no timezone conversion.
pub fn is_stale(last_run: Option<NaiveDateTime>, reference: NaiveDateTime) -> bool {
    match last_run {
        Some(ts) => ts.date() != reference.date(),
        None => false,
    }
}

/// Fill in the derived fields of an observation against a reference clock.
///
/// Running jobs get a live duration and are never flagged stale.
pub fn finalize(mut obs: Observation, reference: NaiveDateTime) -> Observation {
    if obs.execution_state == ExecutionState::Running {
        obs.last_duration = obs.last_run.map(|start| format_elapsed(start, reference));
        obs.stale = false;
    } else {
        obs.stale = is_stale(obs.last_run, reference);
    }
    obs
}
