//! Compile a query JSON file against a directory of cube YAML files and print
//! the SQL.
//!
//! ```text
//! cargo run --example print_sql -- <cube_dir> <query.json> [dialect]
//! ```

use anyhow::{anyhow, Context};
use cubeflow::dialect::dialect_for;
use cubeflow::telemetry::init_tracing;
use cubeflow::{load_schema, CubeflowConfig, QueryRequest, SqlBuilder};

fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(cube_dir), Some(query_path)) = (args.next(), args.next()) else {
        return Err(anyhow!("usage: print_sql <cube_dir> <query.json> [dialect]"));
    };
    let dialect_name = args.next().unwrap_or_else(|| "postgres".to_string());
    let dialect = dialect_for(&dialect_name).ok_or_else(|| anyhow!("unknown dialect {dialect_name}"))?;

    let schema = load_schema(&cube_dir).with_context(|| format!("loading cubes from {cube_dir}"))?;
    let raw = std::fs::read_to_string(&query_path).with_context(|| format!("reading {query_path}"))?;
    let request: QueryRequest = serde_json::from_str(&raw).context("parsing query JSON")?;

    let config = CubeflowConfig::load_default();
    let builder = SqlBuilder::new(config.defaults.compiler);
    for compiled in builder.compile_all(&schema, &request, dialect.as_ref())? {
        println!("{}", compiled.sql);
        println!("-- params: {}", serde_json::to_string(&compiled.params)?);
        if !compiled.pre_aggregation_candidates.is_empty() {
            println!("-- rollup candidates: {}", compiled.pre_aggregation_candidates.join(", "));
        }
    }
    Ok(())
}
