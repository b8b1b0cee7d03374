//! Rollup matching, rewriting and load SQL.

mod common;

use std::collections::HashMap;

use pretty_assertions::assert_eq;
use serde_json::json;

use cubeflow::dialect::PostgresDialect;
use cubeflow::pre_aggregations::{match_query, partitions, MatchOptions, PreAggregation};
use cubeflow::time::DateRange;
use cubeflow::{RewrittenQuery, Schema, SqlBuilder};

use common::{orders_q1_request, orders_schema, partitioned_schema, request, schema_from_yaml};

fn rollups(schema: &Schema) -> Vec<PreAggregation> {
    schema.pre_aggregations().to_vec()
}

fn try_match(schema: &Schema, query: serde_json::Value) -> Option<RewrittenQuery> {
    let logical = SqlBuilder::default()
        .logical_query(schema, &request(query))
        .unwrap();
    match_query(
        schema,
        &logical,
        &rollups(schema),
        &PostgresDialect,
        &MatchOptions::default(),
    )
    .unwrap()
}

// ============================================================================
// Matching
// ============================================================================

#[test]
fn monthly_query_reads_daily_rollup() {
    let schema = orders_schema();
    let logical = SqlBuilder::default()
        .logical_query(&schema, &orders_q1_request())
        .unwrap();
    let rewritten = match_query(
        &schema,
        &logical,
        &rollups(&schema),
        &PostgresDialect,
        &MatchOptions::default(),
    )
    .unwrap()
    .expect("by_status should answer the query");

    assert_eq!(rewritten.pre_aggregation, "Orders.by_status");
    assert_eq!(
        rewritten.tables,
        vec!["cubeflow_pre_aggregations.orders_by_status".to_string()]
    );
    assert!(rewritten.partitions.is_empty());
    assert!(rewritten
        .sql
        .contains("FROM cubeflow_pre_aggregations.orders_by_status AS \"orders__by_status\""));
    assert!(rewritten.sql.contains(
        "date_trunc('month', \"orders__by_status\".\"orders__created_at_day\") AS \"orders__created_at_month\""
    ));
    assert!(rewritten
        .sql
        .contains("SUM(\"orders__by_status\".\"orders__count\") AS \"orders__count\""));
    assert!(rewritten.sql.contains("GROUP BY 1, 2"));
    // Rollup buckets are stored as wall-clock time, so bounds bind unshifted.
    assert_eq!(
        rewritten.params,
        vec![json!("2024-01-01T00:00:00.000"), json!("2024-03-31T23:59:59.999")]
    );
}

#[test]
fn number_measures_are_recomposed_from_stored_parts() {
    let rewritten = try_match(
        &orders_schema(),
        json!({"measures": ["Orders.average"], "dimensions": ["Orders.status"]}),
    )
    .expect("average is derived from count and total");
    assert!(rewritten.sql.contains(
        "SUM(\"orders__by_status\".\"orders__total\") / NULLIF(SUM(\"orders__by_status\".\"orders__count\"), 0)"
    ), "{}", rewritten.sql);
}

#[test]
fn finer_granularity_is_rejected() {
    let rewritten = try_match(
        &orders_schema(),
        json!({
            "measures": ["Orders.count"],
            "timeDimensions": [{"dimension": "Orders.created_at", "granularity": "hour"}]
        }),
    );
    assert!(rewritten.is_none());
}

#[test]
fn unstored_members_are_rejected() {
    let schema = orders_schema();
    let cases = [
        json!({"measures": ["Orders.count"], "dimensions": ["Users.country"]}),
        json!({"measures": ["Orders.customers"]}),
        json!({"measures": ["Orders.count"], "segments": ["Orders.large"]}),
        json!({
            "measures": ["Orders.count"],
            "filters": [{"member": "Orders.amount", "operator": "gt", "values": [5]}]
        }),
    ];
    for query in cases {
        assert!(try_match(&schema, query.clone()).is_none(), "{query}");
    }
}

#[test]
fn unaligned_range_is_rejected() {
    let rewritten = try_match(
        &orders_schema(),
        json!({
            "measures": ["Orders.count"],
            "timeDimensions": [{
                "dimension": "Orders.created_at",
                "granularity": "day",
                "dateRange": ["2024-01-01T06:00:00", "2024-01-31"]
            }]
        }),
    );
    assert!(rewritten.is_none());
}

#[test]
fn other_timezone_is_rejected() {
    let rewritten = try_match(
        &orders_schema(),
        json!({"measures": ["Orders.count"], "timezone": "+03:00"}),
    );
    assert!(rewritten.is_none());
}

// ============================================================================
// Partitions and physical tables
// ============================================================================

#[test]
fn partitioned_rollup_reads_one_table_per_day() {
    let rewritten = try_match(
        &partitioned_schema(),
        json!({
            "measures": ["Orders.count"],
            "dimensions": ["Orders.status"],
            "timeDimensions": [{
                "dimension": "Orders.created_at",
                "granularity": "day",
                "dateRange": ["2024-01-01", "2024-01-03"]
            }]
        }),
    )
    .expect("daily rollup should match");

    assert_eq!(rewritten.pre_aggregation, "Orders.daily");
    assert_eq!(rewritten.partitions.len(), 3);
    assert_eq!(
        rewritten.tables,
        vec![
            "cubeflow_pre_aggregations.orders_daily20240101".to_string(),
            "cubeflow_pre_aggregations.orders_daily20240102".to_string(),
            "cubeflow_pre_aggregations.orders_daily20240103".to_string(),
        ]
    );
    assert_eq!(rewritten.sql.matches("UNION ALL").count(), 2);
    // Buckets match the stored granularity, so no re-truncation.
    assert!(!rewritten.sql.contains("date_trunc"), "{}", rewritten.sql);
}

#[test]
fn build_range_bounds_queries_without_a_range() {
    let rewritten = try_match(
        &partitioned_schema(),
        json!({"measures": ["Orders.total"], "dimensions": ["Orders.status"]}),
    )
    .expect("build range supplies the partitions");
    assert_eq!(rewritten.partitions.len(), 6);
}

const BOUNDED_YAML: &str = r#"
cubes:
  - name: Orders
    sql_table: public.orders
    measures:
      count: { type: count }
    dimensions:
      created_at: { type: time, sql: "${CUBE}.created_at" }
    pre_aggregations:
      january:
        measures: [count]
        time_dimension: created_at
        granularity: day
        build_range: ["2024-01-01", "2024-01-31"]
"#;

fn count_by_day(range: Option<[&str; 2]>) -> serde_json::Value {
    let mut td = json!({"dimension": "Orders.created_at", "granularity": "day"});
    if let Some(range) = range {
        td["dateRange"] = json!(range);
    }
    json!({"measures": ["Orders.count"], "timeDimensions": [td]})
}

#[test]
fn unpartitioned_rollup_only_answers_inside_its_build_range() {
    let schema = schema_from_yaml(BOUNDED_YAML);

    let inside = try_match(&schema, count_by_day(Some(["2024-01-05", "2024-01-20"])));
    assert_eq!(inside.map(|r| r.pre_aggregation).as_deref(), Some("Orders.january"));

    for range in [
        Some(["2024-06-01", "2024-06-30"]),
        Some(["2023-12-15", "2024-01-15"]),
        None,
    ] {
        assert!(try_match(&schema, count_by_day(range)).is_none(), "{range:?}");
    }
}

#[test]
fn partitioned_rollup_rejects_ranges_past_its_build_range() {
    let schema = partitioned_schema();
    for range in [["2024-02-01", "2024-02-03"], ["2024-01-05", "2024-01-09"]] {
        let query = json!({
            "measures": ["Orders.count"],
            "dimensions": ["Orders.status"],
            "timeDimensions": [{
                "dimension": "Orders.created_at",
                "granularity": "day",
                "dateRange": range
            }]
        });
        assert!(try_match(&schema, query).is_none(), "{range:?}");
    }
}

#[test]
fn with_tables_points_at_versioned_tables() {
    let rewritten = try_match(
        &partitioned_schema(),
        json!({
            "measures": ["Orders.count"],
            "dimensions": ["Orders.status"],
            "timeDimensions": [{
                "dimension": "Orders.created_at",
                "granularity": "day",
                "dateRange": ["2024-01-01", "2024-01-02"]
            }]
        }),
    )
    .unwrap();
    assert_eq!(rewritten.pre_aggregation, "Orders.daily");
    let physical: HashMap<String, String> = rewritten
        .tables
        .iter()
        .map(|t| (t.clone(), format!("{t}_abcd1234_ef567890_1717237800")))
        .collect();

    let bound = rewritten.with_tables(&physical);
    for logical in &rewritten.tables {
        let versioned = &physical[logical];
        assert!(bound.sql.contains(&format!("SELECT * FROM {versioned}")), "{}", bound.sql);
        assert!(!bound.sql.contains(&format!("{logical} ")), "{}", bound.sql);
    }
    assert_eq!(bound.tables.len(), 2);
    assert_eq!(bound.params, rewritten.params);
}

#[test]
fn partitions_cover_requested_range() {
    let schema = partitioned_schema();
    let daily = schema.pre_aggregation("Orders.daily").unwrap();
    let range = DateRange::parse("2024-01-01", "2024-01-03").unwrap();
    let windows = partitions(daily, &range, 100).unwrap();
    assert_eq!(windows.len(), 3);
    assert_eq!(windows[0].end, windows[1].start);
    assert_eq!(windows[2].suffix(), "20240103");

    let err = partitions(daily, &range, 2).unwrap_err();
    assert!(err.to_string().contains("more than 2 partitions"));
}

// ============================================================================
// Load SQL
// ============================================================================

#[test]
fn load_query_groups_by_stored_columns() {
    let schema = orders_schema();
    let by_status = schema.pre_aggregation("Orders.by_status").unwrap();
    let (sql, params) = by_status.load_query(&schema, &PostgresDialect, None).unwrap();
    assert_eq!(
        sql,
        "SELECT \"Orders\".status AS \"orders__status\", \
         date_trunc('day', (\"Orders\".created_at::timestamptz AT TIME ZONE $1)) AS \"orders__created_at_day\", \
         COUNT(*) AS \"orders__count\", SUM(\"Orders\".amount) AS \"orders__total\" \
         FROM public.orders AS \"Orders\" GROUP BY 1, 2"
    );
    assert_eq!(params, vec![json!("UTC")]);
}

#[test]
fn load_query_is_bounded_by_partition_window() {
    let schema = partitioned_schema();
    let daily = schema.pre_aggregation("Orders.daily").unwrap();
    let range = DateRange::parse("2024-01-02", "2024-01-02").unwrap();
    let window = partitions(daily, &range, 10).unwrap()[0];

    let (sql, params) = daily
        .load_query(&schema, &PostgresDialect, Some(&window))
        .unwrap();
    assert!(sql.contains(
        "WHERE (\"Orders\".created_at >= $2::timestamptz AND \"Orders\".created_at <= $3::timestamptz)"
    ));
    assert_eq!(
        params,
        vec![
            json!("UTC"),
            json!("2024-01-02T00:00:00.000Z"),
            json!("2024-01-02T23:59:59.999Z")
        ]
    );
}

#[test]
fn structure_version_tracks_definition() {
    let first = orders_schema();
    let second = orders_schema();
    let a = first.pre_aggregation("Orders.by_status").unwrap();
    let b = second.pre_aggregation("Orders.by_status").unwrap();
    assert_eq!(a.structure_version, b.structure_version);

    let partitioned = partitioned_schema();
    let c = partitioned.pre_aggregation("Orders.daily").unwrap();
    assert_ne!(a.structure_version, c.structure_version);
    assert_eq!(a.base_name(), "orders_by_status");
    assert_eq!(a.time_column().as_deref(), Some("orders__created_at_day"));
}
