//! Compiled schema: the symbol table every compile and match runs against.
//!
//! [`Schema::build`] makes one pass over a [`CubeRegistry`]. It parses every
//! SQL template, checks that each reference names a real cube and member,
//! builds the join graph and resolves pre-aggregation definitions. Afterwards
//! lookups are plain map reads keyed by `(cube, member)`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CubeflowError, Result};
use crate::join_graph::JoinGraph;
use crate::models::{CubeDefinition, DimensionType, MeasureType, MemberKind};
use crate::pre_aggregations::PreAggregation;
use crate::registry::CubeRegistry;

mod resolver;
mod template;

pub use resolver::{MemberResolver, TouchedCubes};
pub use template::{SqlTemplate, TemplatePart};

/// Fully qualified member name, `Cube.member`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberRef {
    pub cube: String,
    pub member: String,
}

impl MemberRef {
    pub fn new(cube: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            cube: cube.into(),
            member: member.into(),
        }
    }

    /// Parse `Cube.member`; a bare `member` is qualified with `default_cube`.
    pub fn parse(path: &str, default_cube: Option<&str>) -> std::result::Result<Self, CompileError> {
        match path.split_once('.') {
            Some((cube, member)) if !cube.is_empty() && !member.is_empty() && !member.contains('.') => {
                Ok(Self::new(cube, member))
            }
            None if !path.is_empty() => match default_cube {
                Some(cube) => Ok(Self::new(cube, path)),
                None => Err(CompileError::UnresolvedMember {
                    member: path.to_string(),
                    reason: "member must be qualified as Cube.member".to_string(),
                }),
            },
            _ => Err(CompileError::UnresolvedMember {
                member: path.to_string(),
                reason: "expected Cube.member".to_string(),
            }),
        }
    }

    /// Output column alias, e.g. `orders__created_at`.
    pub fn alias(&self) -> String {
        format!("{}__{}", to_snake_case(&self.cube), to_snake_case(&self.member))
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cube, self.member)
    }
}

pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c);
        }
    }
    out
}

/// Where a cube's rows come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CubeSource {
    Table(String),
    Query(String),
}

impl CubeSource {
    pub fn render(&self) -> String {
        match self {
            CubeSource::Table(t) => t.clone(),
            CubeSource::Query(q) => format!("({q})"),
        }
    }
}

/// One entry of the symbol table.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: MemberKind,
    pub template: Option<SqlTemplate>,
    /// Measure filters, already parsed.
    pub filters: Vec<SqlTemplate>,
    pub measure_type: Option<MeasureType>,
    pub dimension_type: Option<DimensionType>,
}

#[derive(Debug, Clone)]
pub struct CompiledCube {
    pub definition: CubeDefinition,
    pub source: CubeSource,
    symbols: HashMap<String, Symbol>,
}

impl CompiledCube {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn data_source(&self) -> &str {
        &self.definition.data_source
    }

    pub fn symbol(&self, member: &str) -> Option<&Symbol> {
        self.symbols.get(member)
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    cubes: Vec<CompiledCube>,
    index: HashMap<String, usize>,
    join_graph: JoinGraph,
    pre_aggregations: Vec<PreAggregation>,
}

impl Schema {
    pub fn build(registry: &CubeRegistry) -> Result<Self> {
        let is_cube = |name: &str| registry.get(name).is_some();
        let mut cubes = Vec::with_capacity(registry.len());
        let mut index = HashMap::new();

        for def in registry.cubes() {
            let compiled = compile_cube(def, &is_cube)?;
            index.insert(def.name.clone(), cubes.len());
            cubes.push(compiled);
        }

        let join_graph = JoinGraph::build(registry, &is_cube)?;
        let mut schema = Schema {
            cubes,
            index,
            join_graph,
            pre_aggregations: Vec::new(),
        };
        schema.check_references()?;

        let mut pre_aggregations = Vec::new();
        for cube in &schema.cubes {
            for (name, def) in cube.definition.pre_aggregations.iter() {
                pre_aggregations.push(PreAggregation::from_definition(&schema, cube.name(), name, def)?);
            }
        }
        schema.pre_aggregations = pre_aggregations;

        tracing::debug!(
            cubes = schema.cubes.len(),
            pre_aggregations = schema.pre_aggregations.len(),
            "schema compiled"
        );
        Ok(schema)
    }

    pub fn cube(&self, name: &str) -> std::result::Result<&CompiledCube, CompileError> {
        self.index
            .get(name)
            .map(|&i| &self.cubes[i])
            .ok_or_else(|| CompileError::UnknownCube(name.to_string()))
    }

    pub fn cubes(&self) -> impl Iterator<Item = &CompiledCube> {
        self.cubes.iter()
    }

    /// Position of `cube` in declaration order.
    pub fn declaration_index(&self, cube: &str) -> usize {
        self.index.get(cube).copied().unwrap_or(usize::MAX)
    }

    pub fn symbol(&self, member: &MemberRef) -> std::result::Result<&Symbol, CompileError> {
        self.cube(&member.cube)?
            .symbol(&member.member)
            .ok_or_else(|| CompileError::UnresolvedMember {
                member: member.to_string(),
                reason: format!("cube '{}' has no member '{}'", member.cube, member.member),
            })
    }

    pub fn join_graph(&self) -> &JoinGraph {
        &self.join_graph
    }

    pub fn pre_aggregations(&self) -> &[PreAggregation] {
        &self.pre_aggregations
    }

    pub fn pre_aggregation(&self, id: &str) -> Option<&PreAggregation> {
        self.pre_aggregations.iter().find(|p| p.id == id)
    }

    fn check_references(&self) -> Result<()> {
        for cube in &self.cubes {
            for (member, symbol) in &cube.symbols {
                let templates = symbol.template.iter().chain(symbol.filters.iter());
                for template in templates {
                    self.check_template(cube.name(), member, template)?;
                }
            }
        }
        for edge in self.join_graph.edges() {
            self.check_template(&edge.owner, &format!("joins.{}", edge.target), &edge.template)?;
        }
        Ok(())
    }

    fn check_template(&self, owner: &str, context: &str, template: &SqlTemplate) -> Result<()> {
        for part in &template.parts {
            let target = match part {
                TemplatePart::Member { cube, member } => {
                    MemberRef::new(cube.as_deref().unwrap_or(owner), member.as_str())
                }
                _ => continue,
            };
            self.symbol(&target).map_err(|e| {
                CubeflowError::Schema(format!("{owner}.{context}: {e}"))
            })?;
        }
        Ok(())
    }
}

fn compile_cube(def: &CubeDefinition, is_cube: &impl Fn(&str) -> bool) -> Result<CompiledCube> {
    let source = match (&def.sql_table, &def.sql) {
        (Some(table), None) => CubeSource::Table(table.clone()),
        (None, Some(sql)) => CubeSource::Query(sql.trim().to_string()),
        (Some(_), Some(_)) => {
            return Err(CubeflowError::Schema(format!(
                "cube '{}' sets both sql_table and sql",
                def.name
            )))
        }
        (None, None) => {
            return Err(CubeflowError::Schema(format!(
                "cube '{}' needs sql_table, sql or extends",
                def.name
            )))
        }
    };

    let parse = |member: &str, sql: &str| {
        SqlTemplate::parse(sql, is_cube)
            .map_err(|e| CubeflowError::Schema(format!("{}.{member}: {e}", def.name)))
    };

    let mut symbols: HashMap<String, Symbol> = HashMap::new();
    let mut insert = |name: &str, symbol: Symbol| -> Result<()> {
        if symbols.insert(name.to_string(), symbol).is_some() {
            return Err(CubeflowError::Schema(format!(
                "cube '{}' declares member '{name}' more than once",
                def.name
            )));
        }
        Ok(())
    };

    for (name, measure) in def.measures.iter() {
        let template = measure.sql.as_deref().map(|sql| parse(name, sql)).transpose()?;
        match (measure.measure_type, &template) {
            (MeasureType::Count, _) => {}
            (_, None) => {
                return Err(CubeflowError::Schema(format!(
                    "measure {}.{name} of type {:?} needs sql",
                    def.name, measure.measure_type
                )))
            }
            _ => {}
        }
        let filters = measure
            .filters
            .iter()
            .map(|f| parse(name, &f.sql))
            .collect::<Result<Vec<_>>>()?;
        insert(
            name,
            Symbol {
                kind: MemberKind::Measure,
                template,
                filters,
                measure_type: Some(measure.measure_type),
                dimension_type: None,
            },
        )?;
    }
    for (name, dimension) in def.dimensions.iter() {
        insert(
            name,
            Symbol {
                kind: MemberKind::Dimension,
                template: Some(parse(name, &dimension.sql)?),
                filters: Vec::new(),
                measure_type: None,
                dimension_type: Some(dimension.dimension_type),
            },
        )?;
    }
    for (name, segment) in def.segments.iter() {
        insert(
            name,
            Symbol {
                kind: MemberKind::Segment,
                template: Some(parse(name, &segment.sql)?),
                filters: Vec::new(),
                measure_type: None,
                dimension_type: None,
            },
        )?;
    }

    Ok(CompiledCube {
        definition: def.clone(),
        source,
        symbols,
    })
}
