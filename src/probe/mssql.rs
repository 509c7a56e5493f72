//! SQL Server Agent sessions over TDS.

use super::jobs::{
    ActivityRow, AgentJob, CurrencyRate, RatesSource, RawRun, SchedulerConnector, SchedulerSession,
    CURRENCY_CODES, NOISE_JOB,
};
use super::ProbeError;
use crate::crypto::SecretCipher;
use crate::db::Target;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

/// Server error numbers meaning "not allowed", not "broken".
///
/// 229/230: object or column permission denied. 297: user lacks permission
/// for the action. 300: permission denied on a server-level object.
pub fn is_permission_denied(code: u32) -> bool {
    matches!(code, 229 | 230 | 297 | 300)
}

/// Login failed for the supplied credentials.
const LOGIN_FAILED: u32 = 18456;

fn classify(err: tiberius::error::Error) -> ProbeError {
    match err {
        tiberius::error::Error::Server(token) if is_permission_denied(token.code()) => {
            ProbeError::PermissionDenied(token.message().to_string())
        }
        tiberius::error::Error::Server(token) if token.code() == LOGIN_FAILED => {
            ProbeError::Unreachable(token.message().to_string())
        }
        tiberius::error::Error::Server(token) => ProbeError::QueryFailed(format!(
            "error {}: {}",
            token.code(),
            token.message()
        )),
        other => ProbeError::Unreachable(other.to_string()),
    }
}

/// Split `host[:port]`, defaulting the port.
fn split_address(address: &str, default_port: u16) -> Result<(String, u16), ProbeError> {
    let address = address.trim();
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| ProbeError::Config(format!("invalid port in address {:?}", address)))?;
            Ok((host.to_string(), port))
        }
        _ if address.is_empty() => Err(ProbeError::Config("empty address".to_string())),
        _ => Ok((address.to_string(), default_port)),
    }
}

/// Opens authenticated TDS sessions against the `msdb` database.
pub struct MssqlConnector {
    cipher: Arc<SecretCipher>,
    port: u16,
    connect_timeout: Duration,
}

impl MssqlConnector {
    pub fn new(cipher: Arc<SecretCipher>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            cipher,
            port,
            connect_timeout,
        }
    }

    fn config(&self, target: &Target) -> Result<Config, ProbeError> {
        let (host, port) = split_address(&target.address, self.port)?;

        let mut config = Config::new();
        config.host(host);
        config.port(port);
        config.database("msdb");
        config.application_name("statusboard");
        config.authentication(AuthMethod::sql_server(
            &target.principal,
            self.cipher.decrypt(&target.secret),
        ));
        // Point-of-sale hosts run self-signed or no TLS at all
        config.trust_cert();
        config.encryption(EncryptionLevel::NotSupported);
        Ok(config)
    }

    async fn open(&self, config: Config) -> Result<Client<Compat<TcpStream>>, ProbeError> {
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        Client::connect(config, tcp.compat_write())
            .await
            .map_err(classify)
    }
}

#[async_trait]
impl SchedulerConnector for MssqlConnector {
    async fn connect(&self, target: &Target) -> Result<Box<dyn SchedulerSession>, ProbeError> {
        let config = self.config(target)?;
        tracing::debug!("Connecting to {} at {}", target.name, config.get_addr());

        match tokio::time::timeout(self.connect_timeout, self.open(config)).await {
            Ok(Ok(client)) => Ok(Box::new(MssqlSession { client })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProbeError::Timeout(self.connect_timeout)),
        }
    }
}

/// One open TDS connection. Dropping it closes the socket.
pub struct MssqlSession {
    client: Client<Compat<TcpStream>>,
}

impl MssqlSession {
    async fn rows(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, ProbeError> {
        self.client
            .query(sql, params)
            .await
            .map_err(classify)?
            .into_first_result()
            .await
            .map_err(classify)
    }

    async fn exec(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<(), ProbeError> {
        self.client.execute(sql, params).await.map_err(classify)?;
        Ok(())
    }
}

fn text(row: &Row, col: &str) -> Result<String, ProbeError> {
    row.try_get::<&str, _>(col)
        .map(|v| v.unwrap_or_default().to_string())
        .map_err(classify)
}

fn int(row: &Row, col: &str) -> Result<Option<i32>, ProbeError> {
    row.try_get::<i32, _>(col).map_err(classify)
}

fn datetime(row: &Row, col: &str) -> Result<Option<NaiveDateTime>, ProbeError> {
    row.try_get::<NaiveDateTime, _>(col).map_err(classify)
}

fn raw_run(row: &Row) -> Result<Option<RawRun>, ProbeError> {
    let Some(run_status) = int(row, "run_status")? else {
        return Ok(None);
    };
    Ok(Some(RawRun {
        run_status,
        run_date: int(row, "run_date")?.unwrap_or(0),
        run_time: int(row, "run_time")?.unwrap_or(0),
        run_duration: int(row, "run_duration")?.unwrap_or(0),
        message: text(row, "message")?,
    }))
}

const ACTIVITY_JOIN: &str = "
    FROM msdb.dbo.sysjobs j
    LEFT JOIN msdb.dbo.sysjobactivity ja
        ON ja.job_id = j.job_id
        AND ja.session_id = (SELECT TOP 1 session_id FROM msdb.dbo.syssessions ORDER BY session_id DESC)";

fn activity_query(with_history: bool) -> String {
    if with_history {
        format!(
            "SELECT j.name AS job_name, ja.start_execution_date, ja.stop_execution_date,
                    h.run_status, h.run_date, h.run_time, h.run_duration, h.message
             {ACTIVITY_JOIN}
             OUTER APPLY (
                SELECT TOP 1 run_status, run_date, run_time, run_duration, message
                FROM msdb.dbo.sysjobhistory jh
                WHERE jh.job_id = j.job_id AND jh.step_id = 0
                ORDER BY run_date DESC, run_time DESC
             ) h
             WHERE j.enabled = 1 AND j.name <> @P1
             ORDER BY j.name"
        )
    } else {
        format!(
            "SELECT j.name AS job_name, ja.start_execution_date, ja.stop_execution_date
             {ACTIVITY_JOIN}
             WHERE j.enabled = 1 AND j.name <> @P1
             ORDER BY j.name"
        )
    }
}

fn currency_query(source: RatesSource) -> String {
    let codes = CURRENCY_CODES
        .iter()
        .map(|c| format!("'{}'", c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT RTRIM(c_codmoneda) AS code, c_descripcion AS description,
                CAST(n_factor AS FLOAT) AS factor, c_simbolo AS symbol,
                CAST(b_activa AS BIT) AS active
         FROM {}.dbo.MA_MONEDAS
         WHERE b_activa = 1 AND c_codmoneda IN ({})",
        source.database(),
        codes
    )
}

#[async_trait]
impl SchedulerSession for MssqlSession {
    async fn server_time(&mut self) -> Result<NaiveDateTime, ProbeError> {
        let rows = self.rows("SELECT GETDATE() AS now", &[]).await?;
        rows.first()
            .map(|r| datetime(r, "now"))
            .transpose()?
            .flatten()
            .ok_or_else(|| ProbeError::QueryFailed("GETDATE() returned no row".to_string()))
    }

    async fn agent_jobs(&mut self) -> Result<Vec<AgentJob>, ProbeError> {
        let rows = self.rows("EXEC msdb.dbo.sp_help_job", &[]).await?;
        rows.iter()
            .map(|r| {
                Ok(AgentJob {
                    name: text(r, "name")?,
                    enabled: r.try_get::<u8, _>("enabled").map_err(classify)? == Some(1),
                    current_execution_status: int(r, "current_execution_status")?.unwrap_or(0),
                    last_run_date: int(r, "last_run_date")?.unwrap_or(0),
                    last_run_time: int(r, "last_run_time")?.unwrap_or(0),
                    last_run_outcome: int(r, "last_run_outcome")?.unwrap_or(5),
                })
            })
            .collect()
    }

    async fn latest_run(&mut self, job_name: &str) -> Result<Option<RawRun>, ProbeError> {
        let rows = self
            .rows(
                "SELECT TOP 1 h.run_status, h.run_date, h.run_time, h.run_duration, h.message
                 FROM msdb.dbo.sysjobhistory h
                 JOIN msdb.dbo.sysjobs j ON j.job_id = h.job_id
                 WHERE j.name = @P1 AND h.step_id = 0
                 ORDER BY h.run_date DESC, h.run_time DESC",
                &[&job_name],
            )
            .await?;
        match rows.first() {
            Some(row) => raw_run(row),
            None => Ok(None),
        }
    }

    async fn job_activity(&mut self) -> Result<Vec<ActivityRow>, ProbeError> {
        let rows = self.rows(&activity_query(true), &[&NOISE_JOB]).await?;
        rows.iter()
            .map(|r| {
                Ok(ActivityRow {
                    job_name: text(r, "job_name")?,
                    started_at: datetime(r, "start_execution_date")?,
                    stopped_at: datetime(r, "stop_execution_date")?,
                    last_run: raw_run(r)?,
                })
            })
            .collect()
    }

    async fn job_activity_without_history(&mut self) -> Result<Vec<ActivityRow>, ProbeError> {
        let rows = self.rows(&activity_query(false), &[&NOISE_JOB]).await?;
        rows.iter()
            .map(|r| {
                Ok(ActivityRow {
                    job_name: text(r, "job_name")?,
                    started_at: datetime(r, "start_execution_date")?,
                    stopped_at: datetime(r, "stop_execution_date")?,
                    last_run: None,
                })
            })
            .collect()
    }

    async fn recent_runs(&mut self, job_name: &str, limit: u32) -> Result<Vec<RawRun>, ProbeError> {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let rows = self
            .rows(
                "SELECT TOP (@P2) h.run_status, h.run_date, h.run_time, h.run_duration, h.message
                 FROM msdb.dbo.sysjobhistory h
                 JOIN msdb.dbo.sysjobs j ON j.job_id = h.job_id
                 WHERE j.name = @P1 AND h.step_id = 0
                 ORDER BY h.run_date DESC, h.run_time DESC",
                &[&job_name, &limit],
            )
            .await?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(run) = raw_run(row)? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn start_job(&mut self, job_name: &str) -> Result<(), ProbeError> {
        self.exec("EXEC msdb.dbo.sp_start_job @job_name = @P1", &[&job_name])
            .await
    }

    async fn stop_job(&mut self, job_name: &str) -> Result<(), ProbeError> {
        self.exec("EXEC msdb.dbo.sp_stop_job @job_name = @P1", &[&job_name])
            .await
    }

    async fn currency_rates(&mut self, source: RatesSource) -> Result<Vec<CurrencyRate>, ProbeError> {
        let rows = self.rows(&currency_query(source), &[]).await?;
        rows.iter()
            .map(|r| {
                Ok(CurrencyRate {
                    code: text(r, "code")?,
                    description: text(r, "description")?,
                    factor: r.try_get::<f64, _>("factor").map_err(classify)?.unwrap_or(0.0),
                    symbol: text(r, "symbol")?,
                    active: r.try_get::<bool, _>("active").map_err(classify)?.unwrap_or(false),
                })
            })
            .collect()
    }

    async fn close(self: Box<Self>) {
        let session = *self;
        if let Err(e) = session.client.close().await {
            tracing::debug!("Error closing scheduler session: {}", e);
        }
    }
}
