//! Database model types.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which driver probes a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// SQL Server Agent job scheduler
    Jobs,
    /// ICMP reachability only
    Ping,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Jobs => "jobs",
            ProbeKind::Ping => "ping",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jobs" => Ok(ProbeKind::Jobs),
            "ping" => Ok(ProbeKind::Ping),
            other => Err(format!("unknown probe kind: {}", other)),
        }
    }
}

impl ToSql for ProbeKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ProbeKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// A monitored remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub probe_kind: ProbeKind,
    /// Login name on the remote scheduler.
    pub principal: String,
    /// Encrypted secret as stored; never leaves the process.
    #[serde(skip_serializing, default)]
    pub secret: String,
    /// Scheduler-class hosts answer the richer per-job query.
    pub is_server: bool,
    pub branch_id: Option<i64>,
    pub is_active: bool,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            probe_kind: ProbeKind::Jobs,
            principal: String::new(),
            secret: String::new(),
            is_server: false,
            branch_id: None,
            is_active: true,
        }
    }
}

/// Selection applied when listing targets.
#[derive(Debug, Clone, Default)]
pub struct TargetFilter {
    pub branch_id: Option<i64>,
    pub kind: Option<ProbeKind>,
    pub include_inactive: bool,
}

/// One completed reachability check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: i64,
    pub target_id: i64,
    pub is_alive: bool,
    /// Milliseconds
    pub response_time: Option<f64>,
    pub packet_loss: Option<String>,
    pub min_time: Option<f64>,
    pub max_time: Option<f64>,
    pub avg_time: Option<f64>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}
