pub mod config;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod join_graph;
pub mod models;
pub mod orchestrator;
pub mod pre_aggregations;
pub mod query_builder;
pub mod registry;
pub mod runtime;
pub mod schema;
pub mod sql_ast;
pub mod telemetry;
pub mod time;

use std::path::Path;

use crate::error::Result;
use crate::registry::CubeRegistry;

/// Load cube definitions from disk and compile them into a [`Schema`].
pub fn load_schema<P: AsRef<Path>>(model_dir: P) -> Result<Schema> {
    let registry = CubeRegistry::load_from_dir(model_dir)?;
    Schema::build(&registry)
}

pub use config::CubeflowConfig;
pub use driver::{ConnectionManager, Driver, QueryResult};
pub use error::{CompileError, CubeflowError, DriverError, DriverErrorKind, ErrorClass};
pub use models::{CubeDefinition, QueryRequest};
pub use orchestrator::{BuildOrchestrator, OrchestratorContext};
pub use pre_aggregations::{PartitionKey, PreAggregation, RewrittenQuery};
pub use query_builder::{CompiledQuery, SqlBuilder};
pub use runtime::{QueryPlan, QueryResponse, QueryRuntime};
pub use schema::Schema;
