//! Compile, route and execute queries.
//!
//! A query is compiled against the source warehouse, then offered to the
//! rollups declared on the cubes it joins. When one matches, the partitions
//! it needs are made available through the orchestrator and the rewritten
//! query runs against them; otherwise the source SQL runs unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::{Driver, Row};
use crate::error::{CubeflowError, Result};
use crate::models::QueryRequest;
use crate::orchestrator::BuildOrchestrator;
use crate::pre_aggregations::{match_query, MatchOptions, PartitionKey, PreAggregation, RewrittenQuery};
use crate::query_builder::{expand_compare_date_range, CompiledQuery, OutputColumn, SqlBuilder};

/// Where a query will be answered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryPlan {
    Source(CompiledQuery),
    Rollup {
        compiled: CompiledQuery,
        rewritten: RewrittenQuery,
    },
}

impl QueryPlan {
    pub fn compiled(&self) -> &CompiledQuery {
        match self {
            QueryPlan::Source(compiled) | QueryPlan::Rollup { compiled, .. } => compiled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<OutputColumn>,
    pub rows: Vec<Row>,
    /// Rollup the rows came from, if any.
    pub pre_aggregation: Option<String>,
}

pub struct QueryRuntime {
    builder: SqlBuilder,
    orchestrator: BuildOrchestrator,
}

impl QueryRuntime {
    pub fn new(orchestrator: BuildOrchestrator) -> Self {
        let compiler = orchestrator
            .connections()
            .config()
            .map(|c| c.defaults.compiler.clone())
            .unwrap_or_default();
        Self {
            builder: SqlBuilder::new(compiler),
            orchestrator,
        }
    }

    pub fn builder(&self) -> &SqlBuilder {
        &self.builder
    }

    pub fn orchestrator(&self) -> &BuildOrchestrator {
        &self.orchestrator
    }

    /// Compile `request` and pick a rollup for it without building anything.
    pub fn plan(&self, request: &QueryRequest) -> Result<QueryPlan> {
        let schema = self.orchestrator.schema();
        let connections = self.orchestrator.connections();
        let compiled = self.builder.compile_for_request(schema, connections, request)?;
        if compiled.pre_aggregation_candidates.is_empty() {
            return Ok(QueryPlan::Source(compiled));
        }

        let query = self.builder.logical_query(schema, request)?;
        let candidates: Vec<PreAggregation> = schema
            .pre_aggregations()
            .iter()
            .filter(|p| compiled.pre_aggregation_candidates.contains(&p.id))
            .filter(|p| p.external || p.data_source == compiled.data_source)
            .filter(|p| !p.external || self.orchestrator.external().is_some())
            .cloned()
            .collect();
        let config = connections.config_for(&compiled.data_source).orchestrator;
        let options = MatchOptions {
            schema: config.schema,
            max_partitions: config.max_partitions,
        };

        // Rollups in the external store are read with its dialect.
        let mut internal = Vec::new();
        let mut external = Vec::new();
        for candidate in candidates {
            if candidate.external {
                external.push(candidate);
            } else {
                internal.push(candidate);
            }
        }
        let source = self.source_driver(&compiled.data_source)?;
        let mut rewritten = match_query(schema, &query, &internal, source.dialect(), &options)?;
        if rewritten.is_none() {
            if let Some(store) = self.orchestrator.external() {
                rewritten = match_query(schema, &query, &external, store.dialect(), &options)?;
            }
        }

        Ok(match rewritten {
            Some(rewritten) => QueryPlan::Rollup { compiled, rewritten },
            None => QueryPlan::Source(compiled),
        })
    }

    /// Run `request`, reading from a rollup when one matches.
    pub async fn run(&self, request: &QueryRequest) -> Result<QueryResponse> {
        match self.plan(request)? {
            QueryPlan::Source(compiled) => {
                let driver = self.source_driver(&compiled.data_source)?;
                let result = driver.query(&compiled.sql, &compiled.params).await?;
                Ok(QueryResponse {
                    sql: compiled.sql,
                    params: compiled.params,
                    columns: compiled.columns,
                    rows: result.rows,
                    pre_aggregation: None,
                })
            }
            QueryPlan::Rollup { rewritten, .. } => {
                let physical = self.prepare_partitions(&rewritten).await?;
                let rewritten = rewritten.with_tables(&physical);
                let driver = if rewritten.external {
                    self.orchestrator.external().cloned().ok_or_else(|| {
                        CubeflowError::Config("external rollup but no external store configured".to_string())
                    })?
                } else {
                    self.source_driver(&rewritten.data_source)?
                };
                tracing::debug!(
                    pre_aggregation = %rewritten.pre_aggregation,
                    tables = ?rewritten.tables,
                    "running query against rollup"
                );
                let result = driver.query(&rewritten.sql, &rewritten.params).await?;
                Ok(QueryResponse {
                    sql: rewritten.sql,
                    params: rewritten.params,
                    columns: rewritten.columns,
                    rows: result.rows,
                    pre_aggregation: Some(rewritten.pre_aggregation),
                })
            }
        }
    }

    /// Run every range of a `compareDateRange` request, in request order.
    pub async fn run_all(&self, request: &QueryRequest) -> Result<Vec<QueryResponse>> {
        let mut responses = Vec::new();
        for single in expand_compare_date_range(request)? {
            responses.push(self.run(&single).await?);
        }
        Ok(responses)
    }

    /// Serve every partition the rewritten query reads; maps logical table
    /// names to the physical tables serving them.
    async fn prepare_partitions(&self, rewritten: &RewrittenQuery) -> Result<HashMap<String, String>> {
        let keys: Vec<PartitionKey> = if rewritten.partitions.is_empty() {
            vec![PartitionKey::new(rewritten.pre_aggregation.as_str(), None)]
        } else {
            rewritten
                .partitions
                .iter()
                .map(|w| PartitionKey::new(rewritten.pre_aggregation.as_str(), Some(*w)))
                .collect()
        };
        let served = futures::future::try_join_all(keys.iter().map(|k| self.orchestrator.serve(k))).await?;
        Ok(rewritten.tables.iter().cloned().zip(served).collect())
    }

    fn source_driver(&self, data_source: &str) -> Result<Arc<dyn Driver>> {
        self.orchestrator
            .connections()
            .get(data_source)
            .cloned()
            .ok_or_else(|| CubeflowError::Config(format!("data source {data_source} not registered")))
    }
}
