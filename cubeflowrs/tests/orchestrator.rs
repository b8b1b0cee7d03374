//! Build orchestration against the scripted driver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;

use cubeflow::error::{CubeflowError, DriverError, DriverErrorKind, LockError};
use cubeflow::orchestrator::{
    BuildLock, BuildState, FileStateStore, MemoryStateStore, PartitionState, StateStore, StoreResult,
};
use cubeflow::pre_aggregations::partitions;
use cubeflow::time::DateRange;
use cubeflow::config::CubeflowConfig;
use cubeflow::{BuildOrchestrator, OrchestratorContext, PartitionKey, Schema};

use common::{
    connections, fast_config, fixed_now, orchestrator, orchestrator_with_store, orders_schema,
    partitioned_schema, schema_from_yaml, MockDriver, TestClock,
};

fn by_status() -> PartitionKey {
    PartitionKey::new("Orders.by_status", None)
}

fn daily_keys(schema: &Schema, from: &str, to: &str) -> Vec<PartitionKey> {
    let daily = schema.pre_aggregation("Orders.daily").unwrap();
    let range = DateRange::parse(from, to).unwrap();
    partitions(daily, &range, 100)
        .unwrap()
        .into_iter()
        .map(|w| PartitionKey::new("Orders.daily", Some(w)))
        .collect()
}

/// Poll until `done` holds, failing after two seconds.
async fn eventually(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Single flight
// ============================================================================

#[tokio::test]
async fn concurrent_callers_share_one_build() {
    let driver = Arc::new(MockDriver::new().with_delay(Duration::from_millis(50)));
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(orders_schema(), driver.clone(), &clock).await;
    let key = by_status();

    let results = join_all((0..50).map(|_| orch.ensure_fresh(&key))).await;

    assert_eq!(driver.builds(), 1);
    let outcomes: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    let table = &outcomes[0].table;
    assert!(outcomes.iter().all(|o| &o.table == table && o.built));
    assert!(table.starts_with("cubeflow_pre_aggregations.orders_by_status_"), "{table}");
    assert!(table.ends_with(&format!("_{}", fixed_now().timestamp())), "{table}");
    assert_eq!(orch.context().in_flight().await, 0);
}

#[tokio::test]
async fn fresh_partition_is_not_rebuilt() {
    let driver = Arc::new(MockDriver::new());
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(orders_schema(), driver.clone(), &clock).await;
    let key = by_status();

    let first = orch.ensure_fresh(&key).await.unwrap();
    let second = orch.ensure_fresh(&key).await.unwrap();

    assert!(first.built);
    assert!(!second.built);
    assert_eq!(second.attempts, 0);
    assert_eq!(first.table, second.table);
    assert_eq!(first.refresh_key, second.refresh_key);
    assert_eq!(driver.builds(), 1);

    let state = orch.context().state().get(&key).await.unwrap().unwrap();
    assert_eq!(state.state, BuildState::Fresh);
    assert_eq!(state.table.as_deref(), Some(first.table.as_str()));
    assert_eq!(state.built_at, Some(fixed_now()));
}

#[tokio::test]
async fn new_refresh_key_rebuilds_and_drops_old_table() {
    let driver = Arc::new(MockDriver::new());
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(orders_schema(), driver.clone(), &clock).await;
    let key = by_status();

    let first = orch.ensure_fresh(&key).await.unwrap();
    clock.advance(chrono::Duration::hours(1));
    let second = orch.ensure_fresh(&key).await.unwrap();

    assert!(second.built);
    assert_ne!(first.table, second.table);
    assert_ne!(first.refresh_key, second.refresh_key);
    assert_eq!(driver.dropped(), vec![first.table]);
}

// ============================================================================
// Retries and failures
// ============================================================================

#[tokio::test]
async fn transient_failures_are_retried() {
    let driver = Arc::new(MockDriver::new());
    driver.fail_matching("CREATE TABLE", DriverError::timeout("statement timeout"), 2);
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(orders_schema(), driver.clone(), &clock).await;

    let outcome = orch.ensure_fresh(&by_status()).await.unwrap();
    assert!(outcome.built);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(driver.builds(), 1);
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let driver = Arc::new(MockDriver::new());
    driver.fail_matching(
        "CREATE TABLE",
        DriverError::connection_lost("connection reset"),
        10,
    );
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(orders_schema(), driver.clone(), &clock).await;

    let err = orch.ensure_fresh(&by_status()).await.unwrap_err();
    match err {
        CubeflowError::Build(failure) => {
            assert_eq!(failure.attempts, 3);
            assert_eq!(failure.kind, Some(DriverErrorKind::ConnectionLost));
            assert!(failure.retriable());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(driver.builds(), 0);
}

#[tokio::test]
async fn permanent_failure_reports_sql_and_marks_failed() {
    let driver = Arc::new(MockDriver::new());
    driver.fail_matching("CREATE TABLE", DriverError::syntax("syntax error at or near \"FROM\""), 1);
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(orders_schema(), driver.clone(), &clock).await;
    let key = by_status();

    let err = orch.ensure_fresh(&key).await.unwrap_err();
    assert_eq!(err.partition(), Some("Orders.by_status"));
    match &err {
        CubeflowError::Build(failure) => {
            assert_eq!(failure.attempts, 1);
            assert_eq!(failure.kind, Some(DriverErrorKind::Syntax));
            let sql = failure.sql.as_deref().unwrap();
            assert!(sql.starts_with("CREATE TABLE cubeflow_pre_aggregations.orders_by_status_"));
            assert!(sql.contains(" AS SELECT "));
        }
        other => panic!("unexpected error {other:?}"),
    }

    let state = orch.context().state().get(&key).await.unwrap().unwrap();
    assert_eq!(state.state, BuildState::Failed);
    assert!(state.last_error.unwrap().contains("syntax error"));
    assert_eq!(orch.context().in_flight().await, 0);

    // The failure is not sticky: the next call builds again.
    let outcome = orch.ensure_fresh(&key).await.unwrap();
    assert!(outcome.built);
}

#[tokio::test]
async fn partition_failures_are_isolated() {
    let schema = partitioned_schema();
    let keys = daily_keys(&schema, "2024-01-01", "2024-01-03");
    let driver = Arc::new(MockDriver::new());
    driver.fail_matching("20240102", DriverError::syntax("bad partition"), 10);
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(schema, driver.clone(), &clock).await;

    let results = orch.ensure_fresh_all(&keys).await;

    assert_eq!(results.len(), 3);
    assert!(results[0].1.is_ok());
    assert!(results[2].1.is_ok());
    let err = results[1].1.as_ref().unwrap_err();
    assert!(err.partition().unwrap().starts_with("Orders.daily[2024-01-02"));
    assert_eq!(driver.builds(), 2);
}

#[tokio::test]
async fn builds_respect_source_concurrency() {
    let schema = partitioned_schema();
    let keys = daily_keys(&schema, "2024-01-01", "2024-01-06");
    let driver = Arc::new(
        MockDriver::new()
            .with_delay(Duration::from_millis(20))
            .with_concurrency(2),
    );
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(schema, driver.clone(), &clock).await;

    let results = orch.ensure_fresh_all(&keys).await;

    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(driver.builds(), 6);
    assert!(driver.max_active() <= 2, "max active {}", driver.max_active());
    assert!(driver.max_active() >= 1);
}

// ============================================================================
// Serving
// ============================================================================

#[tokio::test]
async fn stale_partition_is_served_while_it_rebuilds() {
    let driver = Arc::new(MockDriver::new());
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(orders_schema(), driver.clone(), &clock).await;
    let key = by_status();

    let first = orch.serve(&key).await.unwrap();
    assert_eq!(driver.builds(), 1);

    clock.advance(chrono::Duration::hours(1));
    let served = orch.serve(&key).await.unwrap();
    assert_eq!(served, first);

    let watched = driver.clone();
    eventually(move || watched.builds() == 2).await;
    let context = orch.context().clone();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while context.in_flight().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "rebuild did not finish");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let renewed = orch.serve(&key).await.unwrap();
    assert_ne!(renewed, first);
    assert_eq!(driver.dropped(), vec![first]);
    assert_eq!(driver.builds(), 2);
}

#[tokio::test]
async fn immutable_partitions_are_never_rebuilt() {
    let yaml = r#"
cubes:
  - name: Orders
    sql_table: public.orders
    measures:
      count: { type: count }
    dimensions:
      created_at: { type: time, sql: "${CUBE}.created_at" }
    pre_aggregations:
      daily:
        measures: [count]
        time_dimension: created_at
        granularity: day
        partition_granularity: day
        refresh_key: { every: "1 hour", incremental: true, update_window: "1 day" }
"#;
    let schema = common::schema_from_yaml(yaml);
    let keys = daily_keys(&schema, "2024-01-01", "2024-01-01");
    let driver = Arc::new(MockDriver::new());
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(schema, driver.clone(), &clock).await;

    let first = orch.ensure_fresh(&keys[0]).await.unwrap();
    clock.advance(chrono::Duration::days(3));
    let second = orch.ensure_fresh(&keys[0]).await.unwrap();
    let served = orch.serve(&keys[0]).await.unwrap();

    assert!(first.built);
    assert!(!second.built);
    assert_eq!(second.table, first.table);
    assert_eq!(served, first.table);
    assert_eq!(driver.builds(), 1);
}

// ============================================================================
// Recovery and persistence
// ============================================================================

#[tokio::test]
async fn builds_are_refused_before_recovery() {
    let driver = Arc::new(MockDriver::new());
    let context = Arc::new(OrchestratorContext::new(Arc::new(MemoryStateStore::new())));
    let orch = BuildOrchestrator::new(
        context.clone(),
        Arc::new(orders_schema()),
        connections(driver.clone(), fast_config()),
    );

    let err = orch.ensure_fresh(&by_status()).await.unwrap_err();
    assert!(matches!(err, CubeflowError::Lock(LockError::NotRecovered)));
    assert_eq!(driver.builds(), 0);

    context.recover().await.unwrap();
    assert!(orch.ensure_fresh(&by_status()).await.unwrap().built);
}

/// Every lock is already held elsewhere and the store refuses to mark
/// anything stale.
struct ContestedStore(MemoryStateStore);

#[async_trait]
impl StateStore for ContestedStore {
    async fn get(&self, partition: &PartitionKey) -> StoreResult<Option<PartitionState>> {
        self.0.get(partition).await
    }

    async fn put(&self, partition: &PartitionKey, state: PartitionState) -> StoreResult<()> {
        if state.state == BuildState::Stale {
            return Err(LockError::Store("disk full".to_string()));
        }
        self.0.put(partition, state).await
    }

    async fn all(&self) -> StoreResult<Vec<(PartitionKey, PartitionState)>> {
        self.0.all().await
    }

    async fn acquire_lock(&self, lock: BuildLock) -> StoreResult<()> {
        Err(LockError::Held {
            partition: lock.partition.to_string(),
            holder: "other-process".to_string(),
        })
    }

    async fn release_lock(&self, key: &str, owner: &str) -> StoreResult<()> {
        self.0.release_lock(key, owner).await
    }

    async fn clear_locks(&self) -> StoreResult<usize> {
        self.0.clear_locks().await
    }
}

#[tokio::test]
async fn held_lock_is_reported_even_when_revert_fails() {
    let driver = Arc::new(MockDriver::new());
    let clock = TestClock::new(fixed_now());
    let store = Arc::new(ContestedStore(MemoryStateStore::new()));
    let orch = orchestrator_with_store(orders_schema(), driver.clone(), store.clone(), &clock).await;

    let err = orch.ensure_fresh(&by_status()).await.unwrap_err();

    assert!(err.to_string().contains("held by other-process"), "{err}");
    assert_eq!(driver.builds(), 0);
    let state = store.get(&by_status()).await.unwrap().unwrap();
    assert_eq!(state.state, BuildState::Queued);
    assert_eq!(orch.context().in_flight().await, 0);
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let driver = Arc::new(MockDriver::new());
    let clock = TestClock::new(fixed_now());

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(&path).await.unwrap());
    let orch = orchestrator_with_store(orders_schema(), driver.clone(), store, &clock).await;
    let first = orch.ensure_fresh(&by_status()).await.unwrap();
    drop(orch);

    let reopened: Arc<dyn StateStore> = Arc::new(FileStateStore::open(&path).await.unwrap());
    let orch = orchestrator_with_store(orders_schema(), driver.clone(), reopened, &clock).await;
    let second = orch.ensure_fresh(&by_status()).await.unwrap();

    assert!(!second.built);
    assert_eq!(second.table, first.table);
    assert_eq!(driver.builds(), 1);
}

#[tokio::test]
async fn interrupted_build_is_rebuilt_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    {
        let store = FileStateStore::open(&path).await.unwrap();
        let mut state = cubeflow::orchestrator::PartitionState::new(BuildState::Building);
        state.table = Some("cubeflow_pre_aggregations.orders_by_status_old".into());
        store.put(&by_status(), state).await.unwrap();
    }

    let driver = Arc::new(MockDriver::new());
    let clock = TestClock::new(fixed_now());
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(&path).await.unwrap());
    let orch = orchestrator_with_store(orders_schema(), driver.clone(), store, &clock).await;

    let recovered = orch.context().state().get(&by_status()).await.unwrap().unwrap();
    assert_eq!(recovered.state, BuildState::Stale);

    let outcome = orch.ensure_fresh(&by_status()).await.unwrap();
    assert!(outcome.built);
    assert_eq!(
        driver.dropped(),
        vec!["cubeflow_pre_aggregations.orders_by_status_old".to_string()]
    );
}

// ============================================================================
// External rollups
// ============================================================================

#[tokio::test]
async fn external_rollup_is_uploaded_to_the_store() {
    let source = Arc::new(MockDriver::new());
    source.set_rows(vec![
        json!({"orders__created_at_day": "2024-01-01T00:00:00.000", "orders__count": 4}),
        json!({"orders__created_at_day": "2024-01-02T00:00:00.000", "orders__count": 7}),
    ]);
    let store = Arc::new(MockDriver::new());
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(partitioned_schema(), source.clone(), &clock)
        .await
        .with_external(store.clone());

    let outcome = orch
        .ensure_fresh(&PartitionKey::new("Orders.shipped", None))
        .await
        .unwrap();

    assert!(outcome.built);
    assert!(outcome.table.starts_with("cubeflow_pre_aggregations.orders_shipped_"));
    let uploads = store.uploads();
    assert_eq!(uploads.len(), 1);
    let (table, data) = &uploads[0];
    assert_eq!(table, &outcome.table);
    assert_eq!(data.rows.len(), 2);
    let types: Vec<(&str, &str)> = data
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.data_type.as_str()))
        .collect();
    assert_eq!(
        types,
        vec![("orders__count", "BIGINT"), ("orders__created_at_day", "TIMESTAMP")]
    );
    // Nothing is created on the source for external rollups.
    assert!(source.statements().iter().all(|s| !s.starts_with("CREATE TABLE")));
}

#[tokio::test]
async fn external_rollup_without_store_fails() {
    let driver = Arc::new(MockDriver::new());
    let clock = TestClock::new(fixed_now());
    let orch = orchestrator(partitioned_schema(), driver, &clock).await;

    let err = orch
        .ensure_fresh(&PartitionKey::new("Orders.shipped", None))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no external store"), "{err}");
}

// ============================================================================
// Refresh key cache
// ============================================================================

const SQL_KEY_YAML: &str = r#"
cubes:
  - name: Orders
    sql_table: public.orders
    measures:
      count: { type: count }
    dimensions:
      status: { type: string, sql: "${CUBE}.status" }
    pre_aggregations:
      by_status:
        measures: [count]
        dimensions: [status]
        refresh_key: { sql: "SELECT MAX(updated_at) FROM public.orders" }
"#;

async fn refresh_key_queries(config: CubeflowConfig) -> usize {
    let driver = Arc::new(MockDriver::new());
    let schema = schema_from_yaml(SQL_KEY_YAML);
    let context = Arc::new(OrchestratorContext::new(Arc::new(MemoryStateStore::new())));
    let orch = BuildOrchestrator::start(context, Arc::new(schema), connections(driver.clone(), config))
        .await
        .unwrap();
    let pre = orch.schema().pre_aggregation("Orders.by_status").unwrap();
    for _ in 0..2 {
        orch.refresh_keys()
            .evaluate(pre, driver.as_ref(), fixed_now())
            .await
            .unwrap();
    }
    driver
        .statements()
        .iter()
        .filter(|s| s.starts_with("SELECT MAX(updated_at)"))
        .count()
}

#[tokio::test]
async fn refresh_key_cache_follows_datasource_config() {
    let cached = CubeflowConfig::from_toml("[defaults.refresh_keys]\nttl_secs = 3600\n").unwrap();
    assert_eq!(refresh_key_queries(cached).await, 1);

    let uncached = CubeflowConfig::from_toml(
        r#"
[defaults.refresh_keys]
ttl_secs = 3600

[datasources.default.refresh_keys]
ttl_secs = 0
"#,
    )
    .unwrap();
    assert_eq!(refresh_key_queries(uncached).await, 2);
}
