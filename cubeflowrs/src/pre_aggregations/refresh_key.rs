use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::RefreshKeyCacheConfig;
use crate::driver::Driver;
use crate::error::DriverError;
use crate::models::RefreshKeyDefinition;

use super::key_cache::KeyCache;
use super::partitions::PartitionWindow;
use super::PreAggregation;

const DEFAULT_EVERY: Duration = Duration::from_secs(3600);

/// Opaque fingerprint; a rollup is stale when its stored value differs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshKeyValue(pub String);

impl fmt::Display for RefreshKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Hash of the result of `sql` on the source. `every` bounds how long a
    /// result is reused.
    Sql { sql: String, every: Option<Duration> },
    /// Time bucket of width `every`.
    Every(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshKey {
    pub mode: RefreshMode,
    /// Only partitions within `update_window` of now are rebuilt.
    pub incremental: bool,
    pub update_window: Option<Duration>,
}

impl Default for RefreshKey {
    fn default() -> Self {
        Self {
            mode: RefreshMode::Every(DEFAULT_EVERY),
            incremental: false,
            update_window: None,
        }
    }
}

impl RefreshKey {
    pub fn from_definition(def: Option<&RefreshKeyDefinition>) -> Result<Self, String> {
        let Some(def) = def else {
            return Ok(Self::default());
        };
        let every = def.every.as_deref().map(parse_interval).transpose()?;
        let update_window = def.update_window.as_deref().map(parse_interval).transpose()?;
        if update_window.is_some() && !def.incremental {
            return Err("update_window requires incremental: true".to_string());
        }
        let mode = match &def.sql {
            Some(sql) if !sql.trim().is_empty() => RefreshMode::Sql {
                sql: sql.trim().to_string(),
                every,
            },
            Some(_) => return Err("refresh_key.sql is empty".to_string()),
            None => RefreshMode::Every(every.unwrap_or(DEFAULT_EVERY)),
        };
        Ok(Self {
            mode,
            incremental: def.incremental,
            update_window,
        })
    }
}

/// Parse intervals like `1 hour`, `30 minutes`, `1 day` or `2 weeks`.
pub fn parse_interval(raw: &str) -> Result<Duration, String> {
    let mut parts = raw.split_whitespace();
    let (Some(count), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("invalid interval '{raw}', expected '<n> <unit>'"));
    };
    let count: u64 = count
        .parse()
        .map_err(|_| format!("invalid interval count in '{raw}'"))?;
    if count == 0 {
        return Err(format!("interval '{raw}' must be positive"));
    }
    let unit_secs = match unit.trim_end_matches('s') {
        "second" | "sec" => 1,
        "minute" | "min" => 60,
        "hour" => 3_600,
        "day" => 86_400,
        "week" => 604_800,
        _ => return Err(format!("unsupported interval unit '{unit}' in '{raw}'")),
    };
    Ok(Duration::from_secs(count * unit_secs))
}

/// Start of the `every`-wide bucket containing `now`, as unix seconds.
pub fn interval_bucket(now: DateTime<Utc>, every: Duration) -> i64 {
    let every = i64::try_from(every.as_secs()).unwrap_or(i64::MAX).max(1);
    now.timestamp().div_euclid(every) * every
}

/// Evaluates refresh keys, caching SQL-mode results per data source.
pub struct RefreshKeyEvaluator {
    caches: Mutex<HashMap<String, KeyCache>>,
    defaults: RefreshKeyCacheConfig,
    overrides: HashMap<String, RefreshKeyCacheConfig>,
}

impl Default for RefreshKeyEvaluator {
    fn default() -> Self {
        Self::new(&RefreshKeyCacheConfig::default())
    }
}

impl RefreshKeyEvaluator {
    pub fn new(config: &RefreshKeyCacheConfig) -> Self {
        Self {
            caches: Mutex::new(HashMap::new()),
            defaults: config.clone(),
            overrides: HashMap::new(),
        }
    }

    /// Use `config` for keys evaluated against `data_source`.
    pub fn with_datasource(mut self, data_source: impl Into<String>, config: RefreshKeyCacheConfig) -> Self {
        self.overrides.insert(data_source.into(), config);
        self
    }

    pub fn cache_config(&self, data_source: &str) -> &RefreshKeyCacheConfig {
        self.overrides.get(data_source).unwrap_or(&self.defaults)
    }

    pub async fn evaluate(
        &self,
        pre_aggregation: &PreAggregation,
        driver: &dyn Driver,
        now: DateTime<Utc>,
    ) -> Result<RefreshKeyValue, DriverError> {
        match &pre_aggregation.refresh_key.mode {
            RefreshMode::Every(every) => Ok(RefreshKeyValue(interval_bucket(now, *every).to_string())),
            RefreshMode::Sql { sql, every } => {
                let data_source = pre_aggregation.data_source.as_str();
                if let Some(hit) = self
                    .caches
                    .lock()
                    .await
                    .get(data_source)
                    .and_then(|cache| cache.get(data_source, sql))
                {
                    tracing::debug!(pre_aggregation = %pre_aggregation.id, "refresh key cache hit");
                    return Ok(hit.clone());
                }
                let result = driver.query(sql, &[]).await?;
                let bytes = serde_json::to_vec(&result.rows)
                    .map_err(|e| DriverError::new(crate::error::DriverErrorKind::Other, e.to_string()))?;
                let value = RefreshKeyValue(hex::encode(Sha256::digest(&bytes)));
                self.caches
                    .lock()
                    .await
                    .entry(data_source.to_string())
                    .or_insert_with(|| KeyCache::with_config(self.cache_config(data_source)))
                    .insert(data_source, sql, value.clone(), *every);
                tracing::debug!(pre_aggregation = %pre_aggregation.id, key = %value, "refresh key evaluated");
                Ok(value)
            }
        }
    }

    pub async fn invalidate(&self) {
        self.caches.lock().await.clear();
    }

    /// True for incremental partitions that ended before the update window.
    /// Once built they are never rebuilt.
    pub fn is_immutable(pre_aggregation: &PreAggregation, window: &PartitionWindow, now: DateTime<Utc>) -> bool {
        if !pre_aggregation.refresh_key.incremental {
            return false;
        }
        let local_now = local_time(pre_aggregation, now);
        let update_window = pre_aggregation
            .refresh_key
            .update_window
            .and_then(|w| chrono::Duration::from_std(w).ok())
            .unwrap_or_else(chrono::Duration::zero);
        window.end <= local_now - update_window
    }
}

fn local_time(pre_aggregation: &PreAggregation, now: DateTime<Utc>) -> NaiveDateTime {
    pre_aggregation.timezone.to_local(now.naive_utc())
}
