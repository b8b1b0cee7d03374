//! Pre-aggregation build orchestration.
//!
//! [`BuildOrchestrator::ensure_fresh`] makes sure one partition is built with
//! a current refresh key. Callers asking for the same partition while a build
//! runs attach to the same shared future, so a partition is built at most once
//! at a time. Builds run on spawned tasks and finish even when every caller
//! has gone away.
//!
//! Per partition the state moves `Queued -> Building -> Fresh | Failed`; the
//! recovery sweep turns anything left `Queued` or `Building` by a previous
//! process into `Stale`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::driver::{ConnectionManager, Driver};
use crate::error::{BuildFailure, DriverError, DriverErrorKind, LockError, Result};
use crate::pre_aggregations::{
    PartitionKey, PreAggregation, RefreshKeyEvaluator, RefreshKeyValue, RefreshMode,
};
use crate::schema::Schema;

mod external;
mod retry;
mod state;

pub use external::sync_to_external;
pub use retry::{retry_with_backoff, Exhausted, RetryPolicy};
pub use state::{
    BuildLock, BuildState, FileStateStore, MemoryStateStore, PartitionState, StateStore, StoreResult,
};

pub type BuildResult = std::result::Result<BuildOutcome, BuildFailure>;

/// Source of "now" for refresh keys and table versions.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

type SharedBuild = Shared<BoxFuture<'static, BuildResult>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub partition: PartitionKey,
    /// Physical table serving the partition.
    pub table: String,
    pub refresh_key: Option<RefreshKeyValue>,
    /// False when the partition was already fresh.
    pub built: bool,
    pub attempts: u32,
}

/// Process-wide orchestration state. Create one per process and share it
/// between orchestrators.
pub struct OrchestratorContext {
    state: Arc<dyn StateStore>,
    in_flight: Mutex<HashMap<PartitionKey, SharedBuild>>,
    semaphores: std::sync::Mutex<HashMap<String, Arc<Semaphore>>>,
    recovered: AtomicBool,
}

impl OrchestratorContext {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self {
            state,
            in_flight: Mutex::new(HashMap::new()),
            semaphores: std::sync::Mutex::new(HashMap::new()),
            recovered: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered.load(Ordering::Acquire)
    }

    /// Startup sweep: builds interrupted by a crash are marked stale and their
    /// locks dropped. Runs once per context.
    pub async fn recover(&self) -> StoreResult<()> {
        if self.is_recovered() {
            return Ok(());
        }
        let mut reset = 0usize;
        for (key, state) in self.state.all().await? {
            if matches!(state.state, BuildState::Building | BuildState::Queued) {
                self.state.put(&key, state.with_state(BuildState::Stale)).await?;
                reset += 1;
            }
        }
        let locks = self.state.clear_locks().await?;
        self.recovered.store(true, Ordering::Release);
        info!(reset_partitions = reset, cleared_locks = locks, "orchestrator state recovered");
        Ok(())
    }

    /// Number of builds currently running.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    fn semaphore(&self, data_source: &str, permits: usize) -> Arc<Semaphore> {
        let mut semaphores = match self.semaphores.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        semaphores
            .entry(data_source.to_string())
            .or_insert_with(|| {
                debug!(data_source, permits, "creating build limiter");
                Arc::new(Semaphore::new(permits.max(1)))
            })
            .clone()
    }
}

#[derive(Clone)]
pub struct BuildOrchestrator {
    context: Arc<OrchestratorContext>,
    schema: Arc<Schema>,
    connections: Arc<ConnectionManager>,
    external: Option<Arc<dyn Driver>>,
    refresh_keys: Arc<RefreshKeyEvaluator>,
    clock: Clock,
}

impl BuildOrchestrator {
    /// Orchestrator over `context`. Builds are refused until the context has
    /// been recovered; [`BuildOrchestrator::start`] does both.
    pub fn new(
        context: Arc<OrchestratorContext>,
        schema: Arc<Schema>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        let refresh_keys = refresh_key_evaluator(&connections);
        Self {
            context,
            schema,
            connections,
            external: None,
            refresh_keys: Arc::new(refresh_keys),
            clock: Arc::new(Utc::now),
        }
    }

    /// Create the orchestrator and run the recovery sweep.
    pub async fn start(
        context: Arc<OrchestratorContext>,
        schema: Arc<Schema>,
        connections: Arc<ConnectionManager>,
    ) -> Result<Self> {
        context.recover().await?;
        Ok(Self::new(context, schema, connections))
    }

    /// Store for rollups declared `external: true`.
    pub fn with_external(mut self, driver: Arc<dyn Driver>) -> Self {
        self.external = Some(driver);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.context
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn external(&self) -> Option<&Arc<dyn Driver>> {
        self.external.as_ref()
    }

    pub fn refresh_keys(&self) -> &Arc<RefreshKeyEvaluator> {
        &self.refresh_keys
    }

    /// Orchestrator settings for the data source `pre_aggregation` reads from.
    pub fn config_for(&self, pre_aggregation: &PreAggregation) -> OrchestratorConfig {
        self.connections
            .config_for(&pre_aggregation.data_source)
            .orchestrator
    }

    /// Build `key` unless it is already fresh. Concurrent calls for the same
    /// key share one build.
    pub async fn ensure_fresh(&self, key: &PartitionKey) -> Result<BuildOutcome> {
        if !self.context.is_recovered() {
            return Err(LockError::NotRecovered.into());
        }
        let build = {
            let mut in_flight = self.context.in_flight.lock().await;
            match in_flight.get(key) {
                Some(existing) => {
                    debug!(partition = %key, "joining in-flight build");
                    existing.clone()
                }
                None => {
                    let build = self.spawn_build(key.clone());
                    in_flight.insert(key.clone(), build.clone());
                    build
                }
            }
        };
        Ok(build.await?)
    }

    /// One result per partition; a failure in one does not affect the others.
    pub async fn ensure_fresh_all(&self, keys: &[PartitionKey]) -> Vec<(PartitionKey, Result<BuildOutcome>)> {
        let results = join_all(keys.iter().map(|k| self.ensure_fresh(k))).await;
        keys.iter().cloned().zip(results).collect()
    }

    /// Physical table to read for `key`.
    ///
    /// A partition with a built table is served immediately even when its
    /// refresh key moved on; the rebuild then runs in the background. Set
    /// `wait_for_renew` to wait for the rebuild instead.
    pub async fn serve(&self, key: &PartitionKey) -> Result<String> {
        let current = self.context.state.get(key).await?;
        let Some((state, table)) = current.and_then(|s| s.table.clone().map(|t| (s, t))) else {
            return Ok(self.ensure_fresh(key).await?.table);
        };
        let pre = self.pre_aggregation(key)?;
        if self.config_for(pre).wait_for_renew {
            return Ok(self.ensure_fresh(key).await?.table);
        }

        let now = (self.clock)();
        if let Some(window) = &key.window {
            if RefreshKeyEvaluator::is_immutable(pre, window, now) {
                return Ok(table);
            }
        }
        let source = self.source_driver(key, pre)?;
        let fresh = match self.refresh_keys.evaluate(pre, source.as_ref(), now).await {
            Ok(value) => {
                state.state == BuildState::Fresh && state.refresh_key.as_deref() == Some(value.0.as_str())
            }
            Err(err) => {
                warn!(partition = %key, error = %err, "refresh key failed, serving last build");
                false
            }
        };
        if !fresh {
            warn!(partition = %key, %table, "serving stale partition while it rebuilds");
            let this = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                if let Err(err) = this.ensure_fresh(&key).await {
                    warn!(partition = %key, error = %err, "background refresh failed");
                }
            });
        }
        Ok(table)
    }

    fn spawn_build(&self, key: PartitionKey) -> SharedBuild {
        let this = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = this.run_build(&task_key).await;
            this.context.in_flight.lock().await.remove(&task_key);
            result
        });
        let context = self.context.clone();
        async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    context.in_flight.lock().await.remove(&key);
                    Err(failure(&key, None, None, format!("build task aborted: {join_error}"), 0))
                }
            }
        }
        .boxed()
        .shared()
    }

    fn pre_aggregation(&self, key: &PartitionKey) -> std::result::Result<&PreAggregation, BuildFailure> {
        self.schema.pre_aggregation(&key.pre_aggregation).ok_or_else(|| {
            failure(key, None, None, format!("unknown pre-aggregation {}", key.pre_aggregation), 0)
        })
    }

    fn source_driver(
        &self,
        key: &PartitionKey,
        pre: &PreAggregation,
    ) -> std::result::Result<Arc<dyn Driver>, BuildFailure> {
        self.connections.get(&pre.data_source).cloned().ok_or_else(|| {
            failure(key, None, None, format!("data source {} not registered", pre.data_source), 0)
        })
    }

    fn target_driver(
        &self,
        key: &PartitionKey,
        pre: &PreAggregation,
        source: &Arc<dyn Driver>,
    ) -> std::result::Result<Arc<dyn Driver>, BuildFailure> {
        if !pre.external {
            return Ok(source.clone());
        }
        self.external.clone().ok_or_else(|| {
            failure(key, None, None, "external rollup but no external store configured".to_string(), 0)
        })
    }

    async fn run_build(&self, key: &PartitionKey) -> BuildResult {
        let pre = self.pre_aggregation(key)?;
        let source = self.source_driver(key, pre)?;
        let target = self.target_driver(key, pre, &source)?;
        let config = self.config_for(pre);
        let store = |e: LockError| failure(key, None, None, e.to_string(), 0);
        let now = (self.clock)();
        let current = self.context.state.get(key).await.map_err(store)?;

        if let (Some(window), Some(state)) = (&key.window, &current) {
            if let (BuildState::Fresh, Some(table)) = (state.state, &state.table) {
                if RefreshKeyEvaluator::is_immutable(pre, window, now) {
                    debug!(partition = %key, "partition is immutable");
                    return Ok(BuildOutcome {
                        partition: key.clone(),
                        table: table.clone(),
                        refresh_key: state.refresh_key.clone().map(RefreshKeyValue),
                        built: false,
                        attempts: 0,
                    });
                }
            }
        }

        let refresh_key = self
            .refresh_keys
            .evaluate(pre, source.as_ref(), now)
            .await
            .map_err(|e| driver_failure(key, refresh_sql(pre), e, 1))?;
        if let Some(state) = &current {
            if let (BuildState::Fresh, Some(table)) = (state.state, &state.table) {
                if state.refresh_key.as_deref() == Some(refresh_key.0.as_str()) {
                    debug!(partition = %key, "partition is fresh");
                    return Ok(BuildOutcome {
                        partition: key.clone(),
                        table: table.clone(),
                        refresh_key: Some(refresh_key),
                        built: false,
                        attempts: 0,
                    });
                }
            }
        }

        let previous = current.unwrap_or_else(|| PartitionState::new(BuildState::Stale));
        self.context
            .state
            .put(key, previous.with_state(BuildState::Queued))
            .await
            .map_err(store)?;

        let permits = config.concurrency.unwrap_or_else(|| source.concurrency());
        let semaphore = self.context.semaphore(&pre.data_source, permits);
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|e| failure(key, None, None, format!("build limiter closed: {e}"), 0))?;

        let lock = BuildLock {
            key: lock_key(pre, key, &refresh_key),
            partition: key.clone(),
            owner: uuid::Uuid::new_v4().to_string(),
            acquired_at: now,
        };
        if let Err(err) = self.context.state.acquire_lock(lock.clone()).await {
            if let Err(revert) = self
                .context
                .state
                .put(key, previous.with_state(BuildState::Stale))
                .await
            {
                warn!(partition = %key, error = %revert, "failed to mark partition stale");
            }
            return Err(store(err));
        }
        let result = self
            .build_partition(key, pre, &source, &target, &config, &refresh_key, now, &previous)
            .await;
        if let Err(err) = self.context.state.release_lock(&lock.key, &lock.owner).await {
            warn!(partition = %key, error = %err, "failed to release build lock");
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_partition(
        &self,
        key: &PartitionKey,
        pre: &PreAggregation,
        source: &Arc<dyn Driver>,
        target: &Arc<dyn Driver>,
        config: &OrchestratorConfig,
        refresh_key: &RefreshKeyValue,
        now: DateTime<Utc>,
        previous: &PartitionState,
    ) -> BuildResult {
        let store = |e: LockError| failure(key, None, None, e.to_string(), 0);
        self.context
            .state
            .put(key, previous.with_state(BuildState::Building))
            .await
            .map_err(store)?;

        let (load_sql, params) = pre
            .load_query(&self.schema, source.dialect(), key.window.as_ref())
            .map_err(|e| failure(key, None, None, e.to_string(), 0))?;
        let table = versioned_table(pre, key, config, refresh_key, &load_sql, &params, now);
        info!(partition = %key, %table, external = pre.external, "building partition");

        let policy = RetryPolicy::from(config);
        let schema_name = config.schema.as_str();
        let source_driver: &dyn Driver = source.as_ref();
        let target_driver: &dyn Driver = target.as_ref();
        let (table_ref, sql_ref, params_ref) = (table.as_str(), load_sql.as_str(), params.as_slice());
        let create_sql = format!("CREATE TABLE {table} AS {load_sql}");
        let create_ref = create_sql.as_str();
        let external = pre.external;

        let outcome = retry_with_backoff(&policy, move || async move {
            target_driver.create_schema_if_not_exists(schema_name).await?;
            if external {
                sync_to_external(source_driver, target_driver, table_ref, sql_ref, params_ref)
                    .await
                    .map(|_| ())
            } else {
                source_driver.query(create_ref, params_ref).await.map(|_| ())
            }
        })
        .await;

        match outcome {
            Ok(((), attempts)) => {
                let state = PartitionState {
                    state: BuildState::Fresh,
                    table: Some(table.clone()),
                    refresh_key: Some(refresh_key.0.clone()),
                    built_at: Some(now),
                    last_error: None,
                };
                self.context.state.put(key, state).await.map_err(store)?;
                info!(partition = %key, %table, attempts, "partition built");
                if let Some(old) = previous.table.as_deref().filter(|old| *old != table) {
                    if let Err(err) = target.drop_table(old).await {
                        warn!(partition = %key, table = old, error = %err, "failed to drop superseded table");
                    }
                }
                Ok(BuildOutcome {
                    partition: key.clone(),
                    table,
                    refresh_key: Some(refresh_key.clone()),
                    built: true,
                    attempts,
                })
            }
            Err(Exhausted { error: err, attempts }) => {
                error!(partition = %key, attempts, kind = %err.kind, error = %err.message, "partition build failed");
                let mut state = previous.with_state(BuildState::Failed);
                state.last_error = Some(err.to_string());
                if let Err(store_err) = self.context.state.put(key, state).await {
                    warn!(partition = %key, error = %store_err, "failed to record build failure");
                }
                let sql = if external { load_sql } else { create_sql };
                Err(driver_failure(key, Some(sql), err, attempts))
            }
        }
    }
}

fn failure(
    key: &PartitionKey,
    sql: Option<String>,
    kind: Option<DriverErrorKind>,
    message: String,
    attempts: u32,
) -> BuildFailure {
    BuildFailure {
        partition: key.to_string(),
        sql,
        kind,
        message,
        attempts,
    }
}

fn driver_failure(key: &PartitionKey, sql: Option<String>, err: DriverError, attempts: u32) -> BuildFailure {
    failure(key, sql, Some(err.kind), err.message, attempts)
}

/// One refresh-key cache per configured data source.
fn refresh_key_evaluator(connections: &ConnectionManager) -> RefreshKeyEvaluator {
    let Some(config) = connections.config() else {
        return RefreshKeyEvaluator::default();
    };
    config.datasources.keys().fold(
        RefreshKeyEvaluator::new(&config.defaults.refresh_keys),
        |evaluator, name| {
            let resolved = config.for_datasource(name);
            evaluator.with_datasource(name.clone(), resolved.refresh_keys)
        },
    )
}

fn refresh_sql(pre: &PreAggregation) -> Option<String> {
    match &pre.refresh_key.mode {
        RefreshMode::Sql { sql, .. } => Some(sql.clone()),
        RefreshMode::Every(_) => None,
    }
}

/// Identity of one build: the same partition, layout and refresh key always
/// map to the same lock.
fn lock_key(pre: &PreAggregation, key: &PartitionKey, refresh_key: &RefreshKeyValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pre.id.as_bytes());
    if let Some(window) = &key.window {
        hasher.update(window.to_string().as_bytes());
    }
    hasher.update(pre.structure_version.as_bytes());
    hasher.update(refresh_key.0.as_bytes());
    hex::encode(hasher.finalize())
}

/// `{schema}.{base}{suffix}_{content}_{structure}_{ts}`.
fn versioned_table(
    pre: &PreAggregation,
    key: &PartitionKey,
    config: &OrchestratorConfig,
    refresh_key: &RefreshKeyValue,
    load_sql: &str,
    params: &[serde_json::Value],
    now: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(load_sql.as_bytes());
    hasher.update(serde_json::Value::from(params.to_vec()).to_string().as_bytes());
    hasher.update(refresh_key.0.as_bytes());
    let content = hex::encode(hasher.finalize());
    format!(
        "{}_{}_{}_{}",
        pre.table_name(&config.schema, key.window.as_ref()),
        short(&content),
        short(&pre.structure_version),
        now.timestamp()
    )
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
