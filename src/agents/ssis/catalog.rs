//! Read access to the SSIS catalog database over TDS.
//!
//! The tasks talk to the trait so they can run against an in-memory catalog
//! in tests; the real implementation opens a connection per query, which
//! keeps the polling tasks from sharing a session across interleaved ticks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tiberius::{AuthMethod, Client, Config, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::core::{ExecutableStatistic, Execution};
use super::SsisConfig;

#[derive(Debug, thiserror::Error)]
#[error("catalog query failed: {0}")]
pub struct CatalogError(pub String);

impl From<tiberius::error::Error> for CatalogError {
    fn from(err: tiberius::error::Error) -> Self {
        Self(err.to_string())
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        Self(err.to_string())
    }
}

#[async_trait]
pub trait SsisCatalog: Send + Sync {
    /// Highest execution id present, if any executions exist.
    async fn max_execution_id(&self) -> Result<Option<i64>, CatalogError>;

    /// Ids of executions newer than `last_known`.
    async fn execution_ids_after(&self, last_known: i64) -> Result<Vec<i64>, CatalogError>;

    /// Executions among `ids` whose current status differs from `status`.
    async fn executions_changed_from(
        &self,
        ids: &[i64],
        status: i32,
    ) -> Result<Vec<Execution>, CatalogError>;

    /// Statistics newer than each `(execution_id, last_seen_statistic_id)`
    /// pair, ordered by statistic id.
    async fn statistics_after(
        &self,
        criteria: &[(i64, i64)],
    ) -> Result<Vec<ExecutableStatistic>, CatalogError>;
}

pub struct SqlServerCatalog {
    config: Arc<SsisConfig>,
}

impl SqlServerCatalog {
    pub fn new(config: Arc<SsisConfig>) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<Client<Compat<TcpStream>>, CatalogError> {
        let mut config = Config::new();
        config.host(&self.config.db_host);
        config.port(self.config.db_port.get());
        config.database(&self.config.db_name);
        config.authentication(AuthMethod::sql_server(
            &self.config.db_user,
            self.config.db_password.expose_secret(),
        ));
        config.trust_cert();

        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        Ok(Client::connect(config, tcp.compat_write()).await?)
    }

    async fn fetch_rows(&self, query: &str, params: &[i32]) -> Result<Vec<Row>, CatalogError> {
        let mut client = self.connect().await?;
        let params: Vec<&dyn tiberius::ToSql> =
            params.iter().map(|p| p as &dyn tiberius::ToSql).collect();
        let rows = client.query(query, &params).await?.into_first_result().await?;
        Ok(rows)
    }
}

fn column<'a, T: tiberius::FromSql<'a>>(row: &'a Row, name: &str) -> Result<T, CatalogError> {
    row.try_get::<T, _>(name)?
        .ok_or_else(|| CatalogError(format!("column '{name}' is NULL")))
}

fn execution_from(row: &Row) -> Result<Execution, CatalogError> {
    Ok(Execution {
        execution_id: column::<i64>(row, "execution_id")?,
        folder_name: column::<&str>(row, "folder_name")?.to_string(),
        project_name: column::<&str>(row, "project_name")?.to_string(),
        package_name: column::<&str>(row, "package_name")?.to_string(),
        status: column::<i32>(row, "status")?,
        start_time: column::<DateTime<Utc>>(row, "start_time")?,
        end_time: row.try_get::<DateTime<Utc>, _>("end_time")?,
    })
}

fn statistic_from(row: &Row) -> Result<ExecutableStatistic, CatalogError> {
    Ok(ExecutableStatistic {
        execution_id: column::<i64>(row, "execution_id")?,
        folder_name: column::<&str>(row, "folder_name")?.to_string(),
        project_name: column::<&str>(row, "project_name")?.to_string(),
        package_name: column::<&str>(row, "package_name")?.to_string(),
        statistics_id: column::<i64>(row, "statistics_id")?,
        execution_path: column::<&str>(row, "execution_path")?.to_string(),
        start_time: column::<DateTime<Utc>>(row, "start_time")?,
        end_time: column::<DateTime<Utc>>(row, "end_time")?,
        execution_result: column::<i32>(row, "execution_result")?,
    })
}

#[async_trait]
impl SsisCatalog for SqlServerCatalog {
    async fn max_execution_id(&self) -> Result<Option<i64>, CatalogError> {
        let rows = self
            .fetch_rows("SELECT MAX([execution_id]) FROM [catalog].[executions]", &[])
            .await?;
        Ok(rows.first().and_then(|row| row.get::<i64, _>(0)))
    }

    async fn execution_ids_after(&self, last_known: i64) -> Result<Vec<i64>, CatalogError> {
        let query = format!(
            "SELECT [execution_id] FROM [catalog].[executions] WHERE [execution_id] > {last_known}"
        );
        let rows = self.fetch_rows(&query, &[]).await?;
        rows.iter().map(|row| column::<i64>(row, "execution_id")).collect()
    }

    async fn executions_changed_from(
        &self,
        ids: &[i64],
        status: i32,
    ) -> Result<Vec<Execution>, CatalogError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_list = ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "SELECT [execution_id], [status], [start_time], [end_time], \
             [folder_name], [project_name], [package_name] \
             FROM [catalog].[executions] \
             WHERE [execution_id] IN ({id_list}) AND [status] != @P1"
        );
        let rows = self.fetch_rows(&query, &[status]).await?;
        rows.iter().map(execution_from).collect()
    }

    async fn statistics_after(
        &self,
        criteria: &[(i64, i64)],
    ) -> Result<Vec<ExecutableStatistic>, CatalogError> {
        if criteria.is_empty() {
            return Ok(Vec::new());
        }
        let clauses = criteria
            .iter()
            .map(|(execution_id, last_stat_id)| {
                format!(
                    "([es].[execution_id] = {execution_id} AND [es].[statistics_id] > {last_stat_id})"
                )
            })
            .collect::<Vec<_>>()
            .join(" OR ");
        let query = format!(
            "SELECT [statistics_id], [execution_path], [es].[start_time], [es].[end_time], \
             [execution_result], [e].[execution_id], [folder_name], [project_name], [package_name] \
             FROM [catalog].[executable_statistics] AS [es] \
             JOIN [catalog].[executions] AS [e] ON [es].[execution_id] = [e].[execution_id] \
             WHERE ({clauses}) \
             ORDER BY [statistics_id] ASC"
        );
        let rows = self.fetch_rows(&query, &[]).await?;
        rows.iter().map(statistic_from).collect()
    }
}
