use futures::TryStreamExt;
use serde_json::Value;

use crate::driver::{Driver, DriverResult, Row, TableColumn, TableData};
use crate::time::parse_timestamp;

/// Run `load_sql` on `source` and upload the rows to `external` as `table`.
/// Returns the number of rows copied.
pub async fn sync_to_external(
    source: &dyn Driver,
    external: &dyn Driver,
    table: &str,
    load_sql: &str,
    params: &[Value],
) -> DriverResult<usize> {
    let rows: Vec<Row> = source.stream(load_sql, params).await?.try_collect().await?;
    let columns = infer_columns(&rows);
    let count = rows.len();
    tracing::debug!(table, rows = count, columns = columns.len(), "uploading rollup rows");
    external.upload_table(table, TableData { columns, rows }).await?;
    Ok(count)
}

/// Column types from the first non-null value of each column. Columns that are
/// null everywhere default to text.
fn infer_columns(rows: &[Row]) -> Vec<TableColumn> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    first
        .keys()
        .map(|name| {
            let sample = rows
                .iter()
                .filter_map(|r| r.get(name))
                .find(|v| !v.is_null());
            TableColumn {
                name: name.clone(),
                data_type: sample.map_or("TEXT", value_type).to_string(),
            }
        })
        .collect()
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "BOOLEAN",
        Value::Number(n) if n.is_i64() || n.is_u64() => "BIGINT",
        Value::Number(_) => "DOUBLE",
        Value::String(s) if parse_timestamp(s).is_ok() => "TIMESTAMP",
        _ => "TEXT",
    }
}
