//! Pre-aggregations: rollup definitions resolved against the schema.
//!
//! A [`PreAggregation`] is the validated, immutable form of a cube's
//! `pre_aggregations` entry. It knows its storage names and how to render the
//! SQL that loads one partition; the matcher, refresh keys and partition
//! generator live in the submodules.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::dialect::Dialect;
use crate::error::{CompileError, CubeflowError, Result};
use crate::models::{MemberKind, MeasureType, PreAggregationDefinition};
use crate::query_builder::{render_query, LogicalQuery, TimeDimension};
use crate::schema::{to_snake_case, MemberRef, Schema};
use crate::time::{DateRange, Granularity, Timezone};

mod key_cache;
pub mod matcher;
pub mod partitions;
pub mod refresh_key;

pub use key_cache::KeyCache;
pub use matcher::{match_query, MatchOptions, RewrittenQuery};
pub use partitions::{partitions, PartitionKey, PartitionWindow};
pub use refresh_key::{RefreshKey, RefreshKeyEvaluator, RefreshKeyValue, RefreshMode};

#[derive(Debug, Clone, PartialEq)]
pub struct PreAggregation {
    /// `Cube.name`.
    pub id: String,
    pub cube: String,
    pub name: String,
    pub measures: Vec<MemberRef>,
    pub dimensions: Vec<MemberRef>,
    pub segments: Vec<MemberRef>,
    pub time_dimension: Option<MemberRef>,
    pub granularity: Option<Granularity>,
    pub partition_granularity: Option<Granularity>,
    pub refresh_key: RefreshKey,
    pub external: bool,
    pub timezone: Timezone,
    pub build_range: Option<DateRange>,
    pub data_source: String,
    /// Hash of the definition; changes whenever the table layout would.
    pub structure_version: String,
}

impl PreAggregation {
    pub fn from_definition(
        schema: &Schema,
        cube: &str,
        name: &str,
        def: &PreAggregationDefinition,
    ) -> Result<Self> {
        let id = format!("{cube}.{name}");
        let invalid = |msg: String| CubeflowError::Schema(format!("pre-aggregation {id}: {msg}"));

        let member = |path: &str, kind: MemberKind| -> Result<MemberRef> {
            let member = MemberRef::parse(path, Some(cube)).map_err(|e| invalid(e.to_string()))?;
            let symbol = schema.symbol(&member).map_err(|e| invalid(e.to_string()))?;
            if symbol.kind != kind {
                return Err(invalid(format!("'{member}' is a {}, expected a {kind}", symbol.kind)));
            }
            if member.cube != cube && !schema.join_graph().connected(cube, &member.cube) {
                return Err(invalid(format!("'{member}' is not reachable from {cube}")));
            }
            Ok(member)
        };

        let measures = def
            .measures
            .iter()
            .map(|m| member(m, MemberKind::Measure))
            .collect::<Result<Vec<_>>>()?;
        for m in &measures {
            if schema.symbol(m)?.measure_type == Some(MeasureType::Number) {
                return Err(invalid(format!(
                    "'{m}' is a number measure; store its component measures instead"
                )));
            }
        }
        let dimensions = def
            .dimensions
            .iter()
            .map(|d| member(d, MemberKind::Dimension))
            .collect::<Result<Vec<_>>>()?;
        let segments = def
            .segments
            .iter()
            .map(|s| member(s, MemberKind::Segment))
            .collect::<Result<Vec<_>>>()?;
        let time_dimension = def
            .time_dimension
            .as_deref()
            .map(|t| member(t, MemberKind::Dimension))
            .transpose()?;

        if measures.is_empty() && dimensions.is_empty() && time_dimension.is_none() {
            return Err(invalid("declares no members".to_string()));
        }
        match (&time_dimension, def.granularity) {
            (Some(_), None) => return Err(invalid("time_dimension needs a granularity".to_string())),
            (None, Some(_)) => return Err(invalid("granularity needs a time_dimension".to_string())),
            _ => {}
        }
        if let Some(partition) = def.partition_granularity {
            let Some(granularity) = def.granularity else {
                return Err(invalid("partition_granularity needs a time_dimension".to_string()));
            };
            if matches!(partition, Granularity::Second | Granularity::Minute) {
                return Err(invalid(format!("cannot partition by {partition}")));
            }
            if !partition.can_roll_up_from(granularity) {
                return Err(invalid(format!(
                    "partition_granularity {partition} does not align with granularity {granularity}"
                )));
            }
        }

        let refresh_key =
            RefreshKey::from_definition(def.refresh_key.as_ref()).map_err(invalid)?;
        if refresh_key.incremental && def.partition_granularity.is_none() {
            return Err(invalid("incremental refresh needs partition_granularity".to_string()));
        }
        let timezone = Timezone::parse(def.timezone.as_deref().unwrap_or("UTC"))
            .map_err(|e| invalid(e.to_string()))?;
        let build_range = def
            .build_range
            .as_ref()
            .map(|(from, to)| DateRange::parse(from, to))
            .transpose()
            .map_err(|e| invalid(e.to_string()))?;

        let structure_version = {
            let mut hasher = Sha256::new();
            hasher.update(id.as_bytes());
            hasher.update(serde_json::to_vec(def)?);
            hex::encode(hasher.finalize())
        };

        Ok(Self {
            data_source: schema.cube(cube)?.data_source().to_string(),
            id,
            cube: cube.to_string(),
            name: name.to_string(),
            measures,
            dimensions,
            segments,
            time_dimension,
            granularity: def.granularity,
            partition_granularity: def.partition_granularity,
            refresh_key,
            external: def.external,
            timezone,
            build_range,
            structure_version,
        })
    }

    /// Table name without schema or partition suffix, e.g. `orders_main`.
    pub fn base_name(&self) -> String {
        format!("{}_{}", to_snake_case(&self.cube), to_snake_case(&self.name))
    }

    /// Logical table name, `{schema}.{cube}_{name}{suffix}`.
    pub fn table_name(&self, schema: &str, window: Option<&PartitionWindow>) -> String {
        let suffix = window.map(PartitionWindow::suffix).unwrap_or_default();
        format!("{schema}.{}{suffix}", self.base_name())
    }

    /// Alias the rollup is read under in rewritten queries.
    pub fn alias(&self) -> String {
        format!("{}__{}", to_snake_case(&self.cube), to_snake_case(&self.name))
    }

    /// Column holding the time bucket.
    pub fn time_column(&self) -> Option<String> {
        match (&self.time_dimension, self.granularity) {
            (Some(td), Some(g)) => Some(format!("{}_{}", td.alias(), g.as_str())),
            _ => None,
        }
    }

    /// SELECT that produces the rows of one partition, or of the whole rollup
    /// when `window` is `None`.
    pub fn load_query(
        &self,
        schema: &Schema,
        dialect: &dyn Dialect,
        window: Option<&PartitionWindow>,
    ) -> std::result::Result<(String, Vec<Value>), CompileError> {
        let date_range = match window {
            Some(w) => Some(w.as_date_range()),
            None => self.build_range,
        };
        let time_dimensions = match (&self.time_dimension, self.granularity) {
            (Some(member), Some(granularity)) => vec![TimeDimension {
                member: member.clone(),
                granularity: Some(granularity),
                date_range,
            }],
            _ => Vec::new(),
        };
        let query = LogicalQuery {
            measures: self.measures.clone(),
            dimensions: self.dimensions.clone(),
            segments: self.segments.clone(),
            time_dimensions,
            where_filters: Vec::new(),
            having_filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            timezone: self.timezone,
        };
        let rendered = render_query(schema, &query, dialect, Vec::new(), None)?;
        Ok((rendered.sql, rendered.params))
    }
}
