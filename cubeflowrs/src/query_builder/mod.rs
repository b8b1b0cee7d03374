use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CompilerConfig;
use crate::dialect::Dialect;
use crate::driver::ConnectionManager;
use crate::error::{CompileError, CubeflowError, Result};
use crate::models::QueryRequest;
use crate::schema::{MemberRef, MemberResolver, Schema};
use crate::sql_ast::{ParamAllocator, SqlRenderer};
use crate::time::Granularity;

mod components;
mod filters;
mod planner;

pub use components::{
    expand_compare_date_range, Filter, FilterTree, LogicalQuery, OrderTarget, TimeDimension,
};
pub(crate) use filters::escape_like;
pub use planner::{ColumnKind, OutputColumn};
pub(crate) use planner::RollupSource;

/// Output of a compile: SQL, bound values and column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<OutputColumn>,
    pub time_granularity: Option<Granularity>,
    pub data_source: String,
    /// Cubes joined into the query, root first.
    pub cubes: Vec<String>,
    /// Pre-aggregations declared on the joined cubes.
    pub pre_aggregation_candidates: Vec<String>,
}

/// Rendered SQL before it is wrapped into a public result type.
pub(crate) struct RenderedQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<OutputColumn>,
    pub cubes: Vec<String>,
}

/// Resolve, plan and render one logical query.
pub(crate) fn render_query(
    schema: &Schema,
    query: &LogicalQuery,
    dialect: &dyn Dialect,
    overrides: Vec<(MemberRef, String)>,
    rollup: Option<&RollupSource>,
) -> std::result::Result<RenderedQuery, CompileError> {
    let mut resolver = MemberResolver::new(schema, dialect);
    for (member, sql) in overrides {
        resolver.set_override(member, sql);
    }
    let mut params = ParamAllocator::new();
    let planned = planner::build_query(query, &mut resolver, &mut params, rollup)?;
    let marked = SqlRenderer::new(dialect).render_select(&planned.select);
    let (sql, params) = params.finalize(&marked, dialect);
    Ok(RenderedQuery {
        sql,
        params,
        columns: planned.columns,
        cubes: planned.cubes,
    })
}

#[derive(Debug, Clone, Default)]
pub struct SqlBuilder {
    config: CompilerConfig,
}

impl SqlBuilder {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Validate `request` into the form the planner and matcher consume.
    pub fn logical_query(&self, schema: &Schema, request: &QueryRequest) -> Result<LogicalQuery> {
        Ok(LogicalQuery::from_request(schema, request, &self.config)?)
    }

    /// Compile a request against `schema` with an explicit dialect.
    pub fn compile(
        &self,
        schema: &Schema,
        request: &QueryRequest,
        dialect: &dyn Dialect,
    ) -> Result<CompiledQuery> {
        let query = self.logical_query(schema, request)?;
        self.compile_logical(schema, &query, dialect)
    }

    pub fn compile_logical(
        &self,
        schema: &Schema,
        query: &LogicalQuery,
        dialect: &dyn Dialect,
    ) -> Result<CompiledQuery> {
        let rendered = render_query(schema, query, dialect, Vec::new(), None)?;
        let root = rendered
            .cubes
            .first()
            .ok_or_else(|| CompileError::MalformedQuery("query touches no cube".to_string()))?;
        let data_source = schema.cube(root)?.data_source().to_string();
        let pre_aggregation_candidates = schema
            .pre_aggregations()
            .iter()
            .filter(|p| rendered.cubes.contains(&p.cube))
            .map(|p| p.id.clone())
            .collect();

        tracing::debug!(
            dialect = dialect.name(),
            cubes = ?rendered.cubes,
            params = rendered.params.len(),
            "compiled query"
        );

        Ok(CompiledQuery {
            sql: rendered.sql,
            params: rendered.params,
            columns: rendered.columns,
            time_granularity: query.granularity(),
            data_source,
            cubes: rendered.cubes,
            pre_aggregation_candidates,
        })
    }

    /// Compile every range of a `compareDateRange` request, in request order.
    pub fn compile_all(
        &self,
        schema: &Schema,
        request: &QueryRequest,
        dialect: &dyn Dialect,
    ) -> Result<Vec<CompiledQuery>> {
        components::expand_compare_date_range(request)?
            .iter()
            .map(|r| self.compile(schema, r, dialect))
            .collect()
    }

    /// Compile using the dialect of the data source the request resolves to.
    pub fn compile_for_request(
        &self,
        schema: &Schema,
        connections: &ConnectionManager,
        request: &QueryRequest,
    ) -> Result<CompiledQuery> {
        let query = self.logical_query(schema, request)?;
        let cube = query
            .referenced_members()
            .first()
            .map(|m| m.cube.clone())
            .ok_or_else(|| CompileError::MalformedQuery("query references no member".to_string()))?;
        let data_source = schema.cube(&cube)?.data_source().to_string();
        let driver = connections.get(&data_source).ok_or_else(|| {
            CubeflowError::Config(format!("data source {data_source} not registered"))
        })?;
        self.compile_logical(schema, &query, driver.dialect())
    }
}
