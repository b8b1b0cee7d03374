use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable, Aborted};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{CubeflowConfig, ResolvedDatasourceConfig};
use crate::dialect::Dialect;
use crate::error::{DriverError, DriverErrorKind};

pub type DriverResult<T> = std::result::Result<T, DriverError>;

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let columns = rows
            .first()
            .map(|r| r.keys().map(|k| ColumnMeta { name: k.clone() }).collect())
            .unwrap_or_default();
        Self { columns, rows }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub data_type: String,
}

/// Rows plus column types, the unit handed to [`Driver::upload_table`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub columns: Vec<TableColumn>,
    pub rows: Vec<Row>,
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn dialect(&self) -> &dyn Dialect;

    async fn query(&self, sql: &str, params: &[Value]) -> DriverResult<QueryResult>;

    /// Row stream for large results. The default buffers [`Driver::query`].
    async fn stream(
        &self,
        sql: &str,
        params: &[Value],
    ) -> DriverResult<BoxStream<'static, DriverResult<Row>>> {
        let result = self.query(sql, params).await?;
        Ok(stream::iter(result.rows.into_iter().map(Ok)).boxed())
    }

    async fn test_connection(&self) -> DriverResult<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    /// Release pooled resources. Called once at shutdown.
    async fn release(&self) -> DriverResult<()> {
        Ok(())
    }

    fn param(&self, idx: usize) -> String {
        self.dialect().placeholder(idx)
    }

    fn quote_identifier(&self, ident: &str) -> String {
        self.dialect().quote_ident(ident)
    }

    async fn create_schema_if_not_exists(&self, schema: &str) -> DriverResult<()> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote_identifier(schema));
        self.query(&sql, &[]).await.map(|_| ())
    }

    /// Load rows into a new table. Only external rollup stores support this.
    async fn upload_table(&self, table: &str, _data: TableData) -> DriverResult<()> {
        Err(DriverError::unsupported(format!(
            "driver for {} cannot upload table {table}",
            self.dialect().name()
        )))
    }

    async fn table_column_types(&self, table: &str) -> DriverResult<Vec<TableColumn>>;

    fn information_schema_query(&self) -> String {
        "SELECT table_schema, table_name, column_name, data_type \
         FROM information_schema.columns \
         WHERE table_schema NOT IN ('information_schema', 'pg_catalog')"
            .to_string()
    }

    async fn drop_table(&self, table: &str) -> DriverResult<()> {
        self.query(&format!("DROP TABLE IF EXISTS {table}"), &[])
            .await
            .map(|_| ())
    }

    /// Concurrent builds this source accepts.
    fn concurrency(&self) -> usize {
        2
    }
}

/// Cancels a query started with [`cancellable_query`].
#[derive(Debug, Clone)]
pub struct CancelHandle(AbortHandle);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_aborted()
    }
}

/// Wrap a driver call so the caller can abandon it. A cancelled query
/// resolves to a [`DriverErrorKind::Other`] error.
pub fn cancellable_query<F>(
    fut: F,
) -> (impl Future<Output = DriverResult<QueryResult>>, CancelHandle)
where
    F: Future<Output = DriverResult<QueryResult>>,
{
    let (handle, registration) = AbortHandle::new_pair();
    let fut = Abortable::new(fut, registration);
    let wrapped = async move {
        match fut.await {
            Ok(result) => result,
            Err(Aborted) => Err(DriverError::new(DriverErrorKind::Other, "query cancelled")),
        }
    };
    (wrapped, CancelHandle(handle))
}

/// Drivers keyed by data source name.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: HashMap<String, Arc<dyn Driver>>,
    config: Option<CubeflowConfig>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CubeflowConfig) -> Self {
        Self {
            connections: HashMap::new(),
            config: Some(config),
        }
    }

    pub fn config(&self) -> Option<&CubeflowConfig> {
        self.config.as_ref()
    }

    pub fn config_for(&self, name: &str) -> ResolvedDatasourceConfig {
        match &self.config {
            Some(cfg) => cfg.for_datasource(name),
            None => CubeflowConfig::default().for_datasource(name),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.connections.insert(name.into(), driver);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Driver>> {
        self.connections.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_query_reports_error() {
        let (fut, handle) = cancellable_query(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(QueryResult::default())
        });
        handle.cancel();
        let err = fut.await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Other);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn uncancelled_query_passes_through() {
        let (fut, _handle) = cancellable_query(async { Ok(QueryResult::default()) });
        assert!(fut.await.unwrap().rows.is_empty());
    }
}
