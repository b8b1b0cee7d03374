use std::collections::{BTreeMap, HashMap};

use crate::dialect::Dialect;
use crate::error::CompileError;
use crate::models::{MeasureType, MemberKind};

use super::{MemberRef, Schema, SqlTemplate, TemplatePart};

/// Cubes a query touched, with the number of member resolutions in each.
pub type TouchedCubes = BTreeMap<String, usize>;

type Result<T> = std::result::Result<T, CompileError>;

/// Where an expanded template will be placed. Decides whether measure
/// references are legal inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Row-level predicate or grouping expression.
    Where,
    /// Input of an aggregate function.
    AggregateInput,
    /// Body of a `number` measure, composed from other measures.
    Derived,
}

/// Per-compile resolver. Caches compiled measures and records touched cubes.
pub struct MemberResolver<'s> {
    schema: &'s Schema,
    dialect: &'s dyn Dialect,
    touched: TouchedCubes,
    measure_cache: HashMap<MemberRef, String>,
    overrides: HashMap<MemberRef, String>,
    stack: Vec<MemberRef>,
    track_touches: bool,
}

impl<'s> MemberResolver<'s> {
    pub fn new(schema: &'s Schema, dialect: &'s dyn Dialect) -> Self {
        Self {
            schema,
            dialect,
            touched: TouchedCubes::new(),
            measure_cache: HashMap::new(),
            overrides: HashMap::new(),
            stack: Vec::new(),
            track_touches: true,
        }
    }

    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    pub fn dialect(&self) -> &'s dyn Dialect {
        self.dialect
    }

    /// Substitute `sql` wherever `member` is referenced. Used to point members
    /// at rollup columns.
    pub fn set_override(&mut self, member: MemberRef, sql: String) {
        self.measure_cache.clear();
        self.overrides.insert(member, sql);
    }

    /// Stop recording touched cubes, e.g. once the join tree is fixed.
    pub fn freeze_touches(&mut self) {
        self.track_touches = false;
    }

    pub fn touched(&self) -> &TouchedCubes {
        &self.touched
    }

    pub fn touch_cube(&mut self, cube: &str) {
        if self.track_touches {
            self.touched.entry(cube.to_string()).or_insert(0);
        }
    }

    fn touch(&mut self, member: &MemberRef) {
        if self.track_touches {
            *self.touched.entry(member.cube.clone()).or_insert(0) += 1;
        }
    }

    /// `resolve(cube, memberPath)`: `memberPath` is `Cube.member` or a bare
    /// member of `cube`. Measures resolve to their aggregate expression,
    /// dimensions and segments to row-level SQL.
    pub fn resolve(&mut self, cube: &str, member_path: &str) -> Result<String> {
        let member = MemberRef::parse(member_path, Some(cube))?;
        if member.cube != cube {
            self.check_reachable(cube, &member)?;
        }
        match self.schema.symbol(&member)?.kind {
            MemberKind::Measure => self.measure_sql(&member),
            MemberKind::Dimension => self.dimension_sql(&member),
            MemberKind::Segment => self.segment_sql(&member),
        }
    }

    pub fn dimension_sql(&mut self, member: &MemberRef) -> Result<String> {
        self.touch(member);
        if let Some(sql) = self.overrides.get(member) {
            return Ok(sql.clone());
        }
        let symbol = self.schema.symbol(member)?;
        if symbol.kind != MemberKind::Dimension {
            return Err(CompileError::UnresolvedMember {
                member: member.to_string(),
                reason: format!("expected a dimension, found a {}", symbol.kind),
            });
        }
        let template = symbol.template.as_ref().cloned().unwrap_or_else(|| SqlTemplate::literal("NULL"));
        self.with_frame(member, MemberKind::Dimension, |r| {
            r.expand(&member.cube, &template, Position::Where)
        })
    }

    pub fn segment_sql(&mut self, member: &MemberRef) -> Result<String> {
        self.touch(member);
        let symbol = self.schema.symbol(member)?;
        if symbol.kind != MemberKind::Segment {
            return Err(CompileError::UnresolvedMember {
                member: member.to_string(),
                reason: format!("expected a segment, found a {}", symbol.kind),
            });
        }
        let template = symbol.template.as_ref().cloned().unwrap_or_else(|| SqlTemplate::literal("1 = 1"));
        self.with_frame(member, MemberKind::Segment, |r| {
            r.expand(&member.cube, &template, Position::Where)
        })
    }

    /// The aggregate expression for a measure, with `number` measures composed
    /// from their already compiled dependencies.
    pub fn measure_sql(&mut self, member: &MemberRef) -> Result<String> {
        self.touch(member);
        if let Some(sql) = self.overrides.get(member) {
            return Ok(sql.clone());
        }
        if let Some(sql) = self.measure_cache.get(member) {
            return Ok(sql.clone());
        }
        let symbol = self.schema.symbol(member)?.clone();
        let measure_type = match (symbol.kind, symbol.measure_type) {
            (MemberKind::Measure, Some(t)) => t,
            _ => {
                return Err(CompileError::UnresolvedMember {
                    member: member.to_string(),
                    reason: format!("expected a measure, found a {}", symbol.kind),
                })
            }
        };

        let sql = self.with_frame(member, MemberKind::Measure, |r| {
            if measure_type == MeasureType::Number {
                let template = symbol.template.as_ref().ok_or_else(|| CompileError::UnresolvedMember {
                    member: member.to_string(),
                    reason: "number measure has no sql".to_string(),
                })?;
                return r.expand(&member.cube, template, Position::Derived);
            }
            let input = symbol
                .template
                .as_ref()
                .map(|t| r.expand(&member.cube, t, Position::AggregateInput))
                .transpose()?;
            let conditions = symbol
                .filters
                .iter()
                .map(|f| r.expand(&member.cube, f, Position::Where).map(|c| format!("({c})")))
                .collect::<Result<Vec<_>>>()?;
            Ok(r.aggregate(measure_type, input.as_deref(), &conditions))
        })?;

        self.measure_cache.insert(member.clone(), sql.clone());
        Ok(sql)
    }

    /// Row-level predicate built from a measure's own filters, or `None` when
    /// the measure has none.
    pub fn measure_filter_sql(&mut self, member: &MemberRef) -> Result<Option<String>> {
        self.touch(member);
        let symbol = self.schema.symbol(member)?.clone();
        if symbol.kind != MemberKind::Measure {
            return Err(CompileError::MalformedFilter(format!(
                "measureFilter needs a measure, '{member}' is a {}",
                symbol.kind
            )));
        }
        if symbol.filters.is_empty() {
            return Ok(None);
        }
        let parts = symbol
            .filters
            .iter()
            .map(|f| self.expand(&member.cube, f, Position::Where).map(|c| format!("({c})")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(parts.join(" AND ")))
    }

    /// Expand a join condition template declared on `owner`.
    pub fn join_condition(&mut self, owner: &str, template: &SqlTemplate) -> Result<String> {
        self.expand(owner, template, Position::Where)
    }

    fn aggregate(&self, measure_type: MeasureType, input: Option<&str>, conditions: &[String]) -> String {
        if conditions.is_empty() {
            return self.dialect.render_aggregation(measure_type, input);
        }
        let condition = conditions.join(" AND ");
        if self.dialect.supports_filtered_aggregates() {
            let base = self.dialect.render_aggregation(measure_type, input);
            return format!("{base} FILTER (WHERE {condition})");
        }
        let guarded = match input {
            Some(expr) => format!("CASE WHEN {condition} THEN {expr} END"),
            None => format!("CASE WHEN {condition} THEN 1 END"),
        };
        self.dialect.render_aggregation(measure_type, Some(&guarded))
    }

    fn with_frame<T>(
        &mut self,
        member: &MemberRef,
        kind: MemberKind,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if let Some(start) = self.stack.iter().position(|m| m == member) {
            let cycle = self.stack[start..]
                .iter()
                .chain(std::iter::once(member))
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(match kind {
                MemberKind::Measure => CompileError::CyclicMeasure(cycle),
                _ => CompileError::CyclicDimension(cycle),
            });
        }
        self.stack.push(member.clone());
        let result = f(self);
        self.stack.pop();
        result
    }

    fn check_reachable(&self, from: &str, target: &MemberRef) -> Result<()> {
        self.schema.cube(&target.cube)?;
        if self.schema.join_graph().connected(from, &target.cube) {
            Ok(())
        } else {
            Err(CompileError::UnresolvedMember {
                member: target.to_string(),
                reason: format!(
                    "cube '{}' is not reachable from '{from}' through joins",
                    target.cube
                ),
            })
        }
    }

    fn expand(&mut self, owner: &str, template: &SqlTemplate, position: Position) -> Result<String> {
        let mut out = String::new();
        for part in &template.parts {
            match part {
                TemplatePart::Text(text) => out.push_str(text),
                TemplatePart::SelfAlias => out.push_str(&self.dialect.quote_ident(owner)),
                TemplatePart::CubeAlias(cube) => {
                    if cube != owner {
                        self.check_reachable(owner, &MemberRef::new(cube.as_str(), "*"))?;
                    }
                    self.touch_cube(cube);
                    out.push_str(&self.dialect.quote_ident(cube));
                }
                TemplatePart::Member { cube, member } => {
                    let target = MemberRef::new(cube.as_deref().unwrap_or(owner), member.as_str());
                    if target.cube != owner {
                        self.check_reachable(owner, &target)?;
                    }
                    let sql = match self.schema.symbol(&target)?.kind {
                        MemberKind::Dimension => self.dimension_sql(&target)?,
                        MemberKind::Segment => self.segment_sql(&target)?,
                        MemberKind::Measure => match position {
                            Position::Derived => self.measure_sql(&target)?,
                            Position::Where => {
                                return Err(CompileError::MeasureInWhere(target.to_string()))
                            }
                            Position::AggregateInput => {
                                return Err(CompileError::UnresolvedMember {
                                    member: target.to_string(),
                                    reason: "aggregating measures reference other measures only through type number"
                                        .to_string(),
                                })
                            }
                        },
                    };
                    out.push_str(&sql);
                }
            }
        }
        Ok(out)
    }
}
