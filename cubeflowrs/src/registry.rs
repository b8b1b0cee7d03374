use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use glob::glob;
use serde::Deserialize;

use crate::error::{CubeflowError, Result};
use crate::models::{CubeDefinition, OrderedMap};

/// Raw cube definitions in declaration order.
///
/// Declaration order is file order (paths sorted) and then document order
/// within a file. It is the tie-breaker for join planning, so loading the same
/// directory always yields the same registry.
#[derive(Debug, Default, Clone)]
pub struct CubeRegistry {
    cubes: Vec<CubeDefinition>,
    index: HashMap<String, usize>,
}

/// A YAML file holds either a single cube or a `cubes:` list.
#[derive(Deserialize)]
#[serde(untagged)]
enum CubeFile {
    Many { cubes: Vec<CubeDefinition> },
    One(Box<CubeDefinition>),
}

impl CubeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cubes(cubes: Vec<CubeDefinition>) -> Result<Self> {
        let mut registry = CubeRegistry::new();
        for cube in cubes {
            registry.insert(cube)?;
        }
        registry.resolve_extends()?;
        Ok(registry)
    }

    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let dir = root.as_ref();
        if !dir.exists() {
            return Err(CubeflowError::Schema(format!(
                "cube directory not found: {}",
                dir.display()
            )));
        }
        let mut paths = Vec::new();
        for pattern in ["*.yml", "*.yaml"] {
            let entries = glob(&format!("{}/{pattern}", dir.display()))
                .map_err(|e| CubeflowError::Other(e.into()))?;
            paths.extend(entries.flatten());
        }
        paths.sort();

        let mut registry = CubeRegistry::new();
        for path in &paths {
            registry.load_file(path)?;
        }
        registry.resolve_extends()?;
        tracing::debug!(
            cubes = registry.cubes.len(),
            files = paths.len(),
            dir = %dir.display(),
            "loaded cube definitions"
        );
        Ok(registry)
    }

    fn load_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)?;
        let file: CubeFile = serde_yaml::from_str(&contents).map_err(|e| {
            CubeflowError::Schema(format!("{}: {e}", path.display()))
        })?;
        match file {
            CubeFile::Many { cubes } => {
                for cube in cubes {
                    self.insert(cube)?;
                }
            }
            CubeFile::One(cube) => self.insert(*cube)?,
        }
        Ok(())
    }

    fn insert(&mut self, cube: CubeDefinition) -> Result<()> {
        if self.index.contains_key(&cube.name) {
            return Err(CubeflowError::Schema(format!(
                "cube '{}' is defined more than once",
                cube.name
            )));
        }
        self.index.insert(cube.name.clone(), self.cubes.len());
        self.cubes.push(cube);
        Ok(())
    }

    /// Copy source and members from parent cubes into children. Members the
    /// child declares itself win.
    fn resolve_extends(&mut self) -> Result<()> {
        let mut done: HashSet<String> = self
            .cubes
            .iter()
            .filter(|c| c.extends.is_none())
            .map(|c| c.name.clone())
            .collect();

        while done.len() < self.cubes.len() {
            let mut progressed = false;
            for idx in 0..self.cubes.len() {
                let name = self.cubes[idx].name.clone();
                if done.contains(&name) {
                    continue;
                }
                let parent_name = self.cubes[idx].extends.clone().unwrap_or_default();
                let parent_idx = *self.index.get(&parent_name).ok_or_else(|| {
                    CubeflowError::Schema(format!(
                        "cube '{name}' extends unknown cube '{parent_name}'"
                    ))
                })?;
                if !done.contains(&parent_name) {
                    continue;
                }
                let parent = self.cubes[parent_idx].clone();
                inherit(&mut self.cubes[idx], &parent);
                done.insert(name);
                progressed = true;
            }
            if !progressed {
                let stuck: Vec<_> = self
                    .cubes
                    .iter()
                    .filter(|c| !done.contains(&c.name))
                    .map(|c| c.name.as_str())
                    .collect();
                return Err(CubeflowError::Schema(format!(
                    "cyclic extends between cubes: {}",
                    stuck.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&CubeDefinition> {
        self.index.get(name).map(|&i| &self.cubes[i])
    }

    pub fn cubes(&self) -> &[CubeDefinition] {
        &self.cubes
    }

    pub fn len(&self) -> usize {
        self.cubes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cubes.is_empty()
    }
}

fn inherit(child: &mut CubeDefinition, parent: &CubeDefinition) {
    if child.sql_table.is_none() && child.sql.is_none() {
        child.sql_table = parent.sql_table.clone();
        child.sql = parent.sql.clone();
    }
    child.measures = merge(&child.measures, &parent.measures);
    child.dimensions = merge(&child.dimensions, &parent.dimensions);
    child.segments = merge(&child.segments, &parent.segments);
    child.joins = merge(&child.joins, &parent.joins);
    child.pre_aggregations = merge(&child.pre_aggregations, &parent.pre_aggregations);
}

fn merge<T: Clone>(own: &OrderedMap<T>, inherited: &OrderedMap<T>) -> OrderedMap<T> {
    let mut merged = inherited.clone();
    for (k, v) in own.iter() {
        merged.insert(k, v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dimension, DimensionType, Measure, MeasureType};

    #[test]
    fn extends_copies_parent_members() {
        let mut base = CubeDefinition::new("Orders");
        base.sql_table = Some("orders".into());
        base.measures
            .insert("count", Measure::new(MeasureType::Count, None));
        base.dimensions
            .insert("status", Dimension::new(DimensionType::String, "${CUBE}.status"));

        let mut child = CubeDefinition::new("CompletedOrders");
        child.extends = Some("Orders".into());
        child
            .dimensions
            .insert("status", Dimension::new(DimensionType::String, "'completed'"));

        let registry = CubeRegistry::from_cubes(vec![child, base]).unwrap();
        let child = registry.get("CompletedOrders").unwrap();
        assert_eq!(child.sql_table.as_deref(), Some("orders"));
        assert!(child.measures.contains_key("count"));
        assert_eq!(child.dimensions.get("status").unwrap().sql, "'completed'");
    }

    #[test]
    fn cyclic_extends_is_an_error() {
        let mut a = CubeDefinition::new("A");
        a.extends = Some("B".into());
        let mut b = CubeDefinition::new("B");
        b.extends = Some("A".into());
        let err = CubeRegistry::from_cubes(vec![a, b]).unwrap_err();
        assert!(err.to_string().contains("cyclic extends"));
    }

    #[test]
    fn duplicate_cubes_are_rejected() {
        let err = CubeRegistry::from_cubes(vec![CubeDefinition::new("A"), CubeDefinition::new("A")])
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
