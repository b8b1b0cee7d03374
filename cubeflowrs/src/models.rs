//! Cube definitions and the JSON query request.
//!
//! Cube definitions arrive already resolved from the authoring layer, typically
//! as YAML documents (see [`crate::registry::CubeRegistry::load_from_dir`]).
//! Member maps keep declaration order, which drives deterministic tie-breaking
//! in join planning and default ordering.

use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::time::Granularity;

/// A name-keyed map that preserves declaration order and rejects duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> OrderedMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Inserts or replaces `name`, keeping the original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, value: T) {
        let name = name.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> FromIterator<(String, T)> for OrderedMap<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        let mut map = OrderedMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<T: Serialize> Serialize for OrderedMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = OrderedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of named members")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, T)> = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    if entries.iter().any(|(k, _)| *k == key) {
                        return Err(de::Error::custom(format!("duplicate member '{key}'")));
                    }
                    entries.push((key, value));
                }
                Ok(OrderedMap { entries })
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

fn default_data_source() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CubeDefinition {
    pub name: String,
    /// Physical table, e.g. `public.orders`.
    #[serde(default)]
    pub sql_table: Option<String>,
    /// Arbitrary SELECT used as the cube's source.
    #[serde(default)]
    pub sql: Option<String>,
    /// Inherit source and members from another cube.
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default = "default_data_source")]
    pub data_source: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub measures: OrderedMap<Measure>,
    #[serde(default)]
    pub dimensions: OrderedMap<Dimension>,
    #[serde(default)]
    pub segments: OrderedMap<Segment>,
    #[serde(default)]
    pub joins: OrderedMap<Join>,
    #[serde(default)]
    pub pre_aggregations: OrderedMap<PreAggregationDefinition>,
}

impl CubeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_table: None,
            sql: None,
            extends: None,
            data_source: default_data_source(),
            title: None,
            description: None,
            measures: OrderedMap::new(),
            dimensions: OrderedMap::new(),
            segments: OrderedMap::new(),
            joins: OrderedMap::new(),
            pre_aggregations: OrderedMap::new(),
        }
    }

    pub fn member_kind(&self, member: &str) -> Option<MemberKind> {
        if self.measures.contains_key(member) {
            Some(MemberKind::Measure)
        } else if self.dimensions.contains_key(member) {
            Some(MemberKind::Dimension)
        } else if self.segments.contains_key(member) {
            Some(MemberKind::Segment)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Measure,
    Dimension,
    Segment,
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemberKind::Measure => "measure",
            MemberKind::Dimension => "dimension",
            MemberKind::Segment => "segment",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MeasureType {
    Count,
    #[serde(alias = "count_distinct")]
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
    Number,
}

impl MeasureType {
    /// Partial results of additive measures can be combined again, so a
    /// rollup holding them can serve coarser queries.
    pub fn is_additive(&self) -> bool {
        matches!(
            self,
            MeasureType::Count | MeasureType::Sum | MeasureType::Min | MeasureType::Max
        )
    }
}

/// SQL condition attached to a measure; rows failing it are not aggregated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasureFilter {
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Measure {
    #[serde(rename = "type")]
    pub measure_type: MeasureType,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub filters: Vec<MeasureFilter>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Measure {
    pub fn new(measure_type: MeasureType, sql: Option<&str>) -> Self {
        Self {
            measure_type,
            sql: sql.map(str::to_string),
            filters: Vec::new(),
            format: None,
            title: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionType {
    String,
    Number,
    Time,
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    #[serde(rename = "type")]
    pub dimension_type: DimensionType,
    pub sql: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Dimension {
    pub fn new(dimension_type: DimensionType, sql: &str) -> Self {
        Self {
            dimension_type,
            sql: sql.to_string(),
            primary_key: false,
            format: None,
            title: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Segment {
    pub sql: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relationship {
    #[serde(rename = "belongsTo", alias = "belongs_to", alias = "many_to_one")]
    BelongsTo,
    #[serde(rename = "hasMany", alias = "has_many", alias = "one_to_many")]
    HasMany,
    #[serde(rename = "hasOne", alias = "has_one", alias = "one_to_one")]
    HasOne,
}

/// Join declared on the owning cube; the map key is the target cube.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Join {
    pub relationship: Relationship,
    pub sql: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshKeyDefinition {
    #[serde(default)]
    pub sql: Option<String>,
    /// Interval such as `1 hour` or `30 minutes`.
    #[serde(default)]
    pub every: Option<String>,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub update_window: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreAggregationDefinition {
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub time_dimension: Option<String>,
    #[serde(default)]
    pub granularity: Option<Granularity>,
    #[serde(default)]
    pub partition_granularity: Option<Granularity>,
    #[serde(default)]
    pub refresh_key: Option<RefreshKeyDefinition>,
    #[serde(default)]
    pub external: bool,
    /// Timezone the rollup's time buckets are built in (default UTC).
    #[serde(default)]
    pub timezone: Option<String>,
    /// Static `[start, end]` bounds used when a query carries no date range.
    #[serde(default)]
    pub build_range: Option<(String, String)>,
}

// ---------------------------------------------------------------------------
// Query JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub time_dimensions: Vec<TimeDimensionRequest>,
    #[serde(default)]
    pub filters: Vec<FilterNode>,
    #[serde(default)]
    pub order: OrderSpec,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeDimensionRequest {
    pub dimension: String,
    #[serde(default)]
    pub granularity: Option<Granularity>,
    #[serde(default)]
    pub date_range: Option<DateRangeInput>,
    #[serde(default)]
    pub compare_date_range: Option<Vec<DateRangeInput>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateRangeInput {
    Pair(String, String),
    Single(String),
}

impl DateRangeInput {
    pub fn bounds(&self) -> (&str, &str) {
        match self {
            DateRangeInput::Pair(from, to) => (from, to),
            DateRangeInput::Single(day) => (day, day),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    And { and: Vec<FilterNode> },
    Or { or: Vec<FilterNode> },
    Leaf(FilterLeaf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterLeaf {
    #[serde(default, alias = "dimension")]
    pub member: Option<String>,
    pub operator: FilterOperator,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl FilterLeaf {
    pub fn new(member: &str, operator: FilterOperator, values: Vec<Value>) -> Self {
        Self {
            member: Some(member.to_string()),
            operator,
            values,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    NotContains,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    Set,
    NotSet,
    InDateRange,
    NotInDateRange,
    BeforeDate,
    BeforeOrOnDate,
    AfterDate,
    AfterOrOnDate,
    MeasureFilter,
}

impl FilterOperator {
    pub fn is_date_operator(&self) -> bool {
        matches!(
            self,
            FilterOperator::InDateRange
                | FilterOperator::NotInDateRange
                | FilterOperator::BeforeDate
                | FilterOperator::BeforeOrOnDate
                | FilterOperator::AfterDate
                | FilterOperator::AfterOrOnDate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Requested ordering. Accepts `{"Orders.count": "desc"}` or
/// `[["Orders.count", "desc"]]`; object key order is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderSpec(pub Vec<(String, SortDirection)>);

impl OrderSpec {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for OrderSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (member, dir) in &self.0 {
            map.serialize_entry(member, dir)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OrderSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderVisitor;

        impl<'de> Visitor<'de> for OrderVisitor {
            type Value = OrderSpec;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an order object or a list of [member, direction] pairs")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut items = Vec::new();
                while let Some((member, dir)) = access.next_entry::<String, SortDirection>()? {
                    items.push((member, dir));
                }
                Ok(OrderSpec(items))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut items = Vec::new();
                while let Some(pair) = access.next_element::<(String, SortDirection)>()? {
                    items.push(pair);
                }
                Ok(OrderSpec(items))
            }
        }

        deserializer.deserialize_any(OrderVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_yaml_keeps_declaration_order() {
        let yaml = r#"
name: Orders
sql_table: public.orders
measures:
  count: { type: count }
  total: { type: sum, sql: "${CUBE}.amount" }
  average: { type: number, sql: "${total} / NULLIF(${count}, 0)" }
dimensions:
  status: { type: string, sql: "${CUBE}.status" }
  created_at: { type: time, sql: "${CUBE}.created_at" }
joins:
  Users: { relationship: belongsTo, sql: "${CUBE}.user_id = ${Users}.id" }
"#;
        let cube: CubeDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            cube.measures.keys().collect::<Vec<_>>(),
            vec!["count", "total", "average"]
        );
        assert_eq!(cube.data_source, "default");
        assert_eq!(
            cube.joins.get("Users").unwrap().relationship,
            Relationship::BelongsTo
        );
        assert_eq!(cube.member_kind("status"), Some(MemberKind::Dimension));
    }

    #[test]
    fn duplicate_members_are_rejected() {
        let yaml = r#"
name: Orders
sql_table: orders
measures:
  count: { type: count }
  count: { type: sum, sql: amount }
"#;
        let err = serde_yaml::from_str::<CubeDefinition>(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate member 'count'"));
    }

    #[test]
    fn query_json_shapes() {
        let json = r#"{
            "measures": ["Orders.count"],
            "timeDimensions": [{"dimension": "Orders.createdAt", "granularity": "month",
                                "dateRange": ["2024-01-01", "2024-03-31"]}],
            "filters": [{"or": [
                {"member": "Orders.status", "operator": "equals", "values": ["a"]},
                {"dimension": "Orders.status", "operator": "set"}
            ]}],
            "order": {"Orders.count": "desc", "Orders.createdAt": "asc"}
        }"#;
        let q: QueryRequest = serde_json::from_str(json).unwrap();
        assert_eq!(q.time_dimensions[0].granularity, Some(Granularity::Month));
        assert_eq!(
            q.order.0,
            vec![
                ("Orders.count".to_string(), SortDirection::Desc),
                ("Orders.createdAt".to_string(), SortDirection::Asc)
            ]
        );
        match &q.filters[0] {
            FilterNode::Or { or } => {
                assert_eq!(or.len(), 2);
                assert!(matches!(&or[1], FilterNode::Leaf(l) if l.member.as_deref() == Some("Orders.status")));
            }
            other => panic!("unexpected filter {other:?}"),
        }
    }

    #[test]
    fn order_accepts_pairs() {
        let q: QueryRequest =
            serde_json::from_str(r#"{"order": [["Orders.status", "asc"]]}"#).unwrap();
        assert_eq!(q.order.0[0].1, SortDirection::Asc);
    }
}
