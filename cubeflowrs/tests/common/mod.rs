//! Shared fixtures for integration tests: cube schemas and a scripted
//! in-memory driver.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use cubeflow::config::CubeflowConfig;
use cubeflow::dialect::{Dialect, PostgresDialect};
use cubeflow::driver::{DriverResult, QueryResult, Row, TableColumn, TableData};
use cubeflow::error::DriverError;
use cubeflow::models::{CubeDefinition, QueryRequest};
use cubeflow::orchestrator::{BuildOrchestrator, Clock, MemoryStateStore, OrchestratorContext, StateStore};
use cubeflow::registry::CubeRegistry;
use cubeflow::{ConnectionManager, Driver, Schema};

// ============================================================================
// Cube fixtures
// ============================================================================

pub const ORDERS_YAML: &str = r#"
cubes:
  - name: Orders
    sql_table: public.orders
    measures:
      count: { type: count }
      total: { type: sum, sql: "${CUBE}.amount" }
      average: { type: number, sql: "${total} / NULLIF(${count}, 0)" }
      customers: { type: countDistinct, sql: "${CUBE}.user_id" }
      completed_count:
        type: count
        filters:
          - sql: "${CUBE}.status = 'completed'"
    dimensions:
      id: { type: number, sql: "${CUBE}.id", primary_key: true }
      status: { type: string, sql: "${CUBE}.status" }
      amount: { type: number, sql: "${CUBE}.amount" }
      created_at: { type: time, sql: "${CUBE}.created_at" }
    segments:
      large: { sql: "${CUBE}.amount > 100" }
    joins:
      Users: { relationship: belongsTo, sql: "${CUBE}.user_id = ${Users}.id" }
    pre_aggregations:
      by_status:
        measures: [count, total]
        dimensions: [status]
        time_dimension: created_at
        granularity: day
  - name: Users
    sql_table: public.users
    dimensions:
      id: { type: number, sql: "${CUBE}.id", primary_key: true }
      country: { type: string, sql: "${CUBE}.country" }
"#;

pub const PARTITIONED_YAML: &str = r#"
cubes:
  - name: Orders
    sql_table: public.orders
    measures:
      count: { type: count }
      total: { type: sum, sql: "${CUBE}.amount" }
    dimensions:
      status: { type: string, sql: "${CUBE}.status" }
      created_at: { type: time, sql: "${CUBE}.created_at" }
    pre_aggregations:
      daily:
        measures: [count, total]
        dimensions: [status]
        time_dimension: created_at
        granularity: day
        partition_granularity: day
        build_range: ["2024-01-01", "2024-01-06"]
      shipped:
        measures: [count]
        time_dimension: created_at
        granularity: day
        external: true
"#;

/// Three cubes in a chain: A joins B, B joins C.
pub const CHAIN_YAML: &str = r#"
cubes:
  - name: A
    sql_table: a
    measures:
      count: { type: count }
    dimensions:
      name: { type: string, sql: "${CUBE}.name" }
    joins:
      B: { relationship: belongsTo, sql: "${CUBE}.b_id = ${B}.id" }
  - name: B
    sql_table: b
    dimensions:
      id: { type: number, sql: "${CUBE}.id", primary_key: true }
    joins:
      C: { relationship: belongsTo, sql: "${CUBE}.c_id = ${C}.id" }
  - name: C
    sql_table: c
    dimensions:
      id: { type: number, sql: "${CUBE}.id", primary_key: true }
      label: { type: string, sql: "${CUBE}.label" }
"#;

pub fn schema_from_yaml(yaml: &str) -> Schema {
    #[derive(serde::Deserialize)]
    struct File {
        cubes: Vec<CubeDefinition>,
    }
    let file: File = serde_yaml::from_str(yaml).expect("fixture yaml");
    let registry = CubeRegistry::from_cubes(file.cubes).expect("fixture registry");
    Schema::build(&registry).expect("fixture schema")
}

pub fn orders_schema() -> Schema {
    schema_from_yaml(ORDERS_YAML)
}

pub fn partitioned_schema() -> Schema {
    schema_from_yaml(PARTITIONED_YAML)
}

pub fn request(value: Value) -> QueryRequest {
    serde_json::from_value(value).expect("fixture request")
}

/// The Orders scenario: count by status and month over Q1 2024.
pub fn orders_q1_request() -> QueryRequest {
    request(json!({
        "measures": ["Orders.count"],
        "dimensions": ["Orders.status"],
        "timeDimensions": [{
            "dimension": "Orders.created_at",
            "granularity": "month",
            "dateRange": ["2024-01-01", "2024-03-31"]
        }]
    }))
}

// ============================================================================
// Mock driver
// ============================================================================

struct ScriptedFailure {
    pattern: String,
    error: DriverError,
    remaining: usize,
}

/// In-memory driver. `CREATE TABLE` statements count as builds and can be
/// scripted to fail; other statements return the configured rows.
pub struct MockDriver {
    dialect: PostgresDialect,
    delay: Duration,
    concurrency: usize,
    rows: Mutex<Vec<Row>>,
    failures: Mutex<Vec<ScriptedFailure>>,
    statements: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(String, TableData)>>,
    dropped: Mutex<VecDeque<String>>,
    builds: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self {
            dialect: PostgresDialect,
            delay: Duration::ZERO,
            concurrency: 2,
            rows: Mutex::new(vec![json!({"orders__status": "paid", "orders__count": 3})
                .as_object()
                .cloned()
                .unwrap_or_default()]),
            failures: Mutex::new(Vec::new()),
            statements: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            dropped: Mutex::new(VecDeque::new()),
            builds: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every build sleeps for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Fail the next `times` builds whose SQL contains `pattern`.
    pub fn fail_matching(&self, pattern: &str, error: DriverError, times: usize) {
        self.failures.lock().unwrap().push(ScriptedFailure {
            pattern: pattern.to_string(),
            error,
            remaining: times,
        });
    }

    pub fn set_rows(&self, rows: Vec<Value>) {
        *self.rows.lock().unwrap() = rows.into_iter().filter_map(|r| r.as_object().cloned()).collect();
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, TableData)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.dropped.lock().unwrap().iter().cloned().collect()
    }

    fn scripted_failure(&self, sql: &str) -> Option<DriverError> {
        let mut failures = self.failures.lock().unwrap();
        let failure = failures
            .iter_mut()
            .find(|f| f.remaining > 0 && sql.contains(&f.pattern))?;
        failure.remaining -= 1;
        Some(failure.error.clone())
    }

    async fn build(&self, sql: &str) -> DriverResult<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_failure(sql) {
            return Err(err);
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> DriverResult<QueryResult> {
        self.statements.lock().unwrap().push(sql.to_string());
        if sql.starts_with("CREATE TABLE") {
            self.build(sql).await?;
            return Ok(QueryResult::default());
        }
        if let Some(table) = sql.strip_prefix("DROP TABLE IF EXISTS ") {
            self.dropped.lock().unwrap().push_back(table.to_string());
            return Ok(QueryResult::default());
        }
        if sql.starts_with("CREATE SCHEMA") {
            return Ok(QueryResult::default());
        }
        Ok(QueryResult::from_rows(self.rows.lock().unwrap().clone()))
    }

    async fn upload_table(&self, table: &str, data: TableData) -> DriverResult<()> {
        self.build(table).await?;
        self.uploads.lock().unwrap().push((table.to_string(), data));
        Ok(())
    }

    async fn table_column_types(&self, _table: &str) -> DriverResult<Vec<TableColumn>> {
        Ok(Vec::new())
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }
}

// ============================================================================
// Orchestrator wiring
// ============================================================================

/// 2024-06-01T10:30:00Z.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 30, 0).unwrap()
}

/// A clock tests can move forward.
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(now)))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }

    pub fn clock(&self) -> Clock {
        let inner = self.0.clone();
        Arc::new(move || *inner.lock().unwrap())
    }
}

/// Config with millisecond backoff so retry tests stay fast.
pub fn fast_config() -> CubeflowConfig {
    CubeflowConfig::from_toml(
        r#"
[defaults.orchestrator]
max_attempts = 3
initial_backoff_ms = 1
max_backoff_ms = 5
"#,
    )
    .expect("fixture config")
}

pub fn connections(driver: Arc<MockDriver>, config: CubeflowConfig) -> Arc<ConnectionManager> {
    let mut manager = ConnectionManager::with_config(config);
    manager.insert("default", driver);
    Arc::new(manager)
}

pub async fn orchestrator_with_store(
    schema: Schema,
    driver: Arc<MockDriver>,
    store: Arc<dyn StateStore>,
    clock: &TestClock,
) -> BuildOrchestrator {
    let context = Arc::new(OrchestratorContext::new(store));
    BuildOrchestrator::start(context, Arc::new(schema), connections(driver, fast_config()))
        .await
        .expect("orchestrator start")
        .with_clock(clock.clock())
}

pub async fn orchestrator(schema: Schema, driver: Arc<MockDriver>, clock: &TestClock) -> BuildOrchestrator {
    orchestrator_with_store(schema, driver, Arc::new(MemoryStateStore::new()), clock).await
}
