//! Join planning over the cube relationship graph.
//!
//! Reachability treats every declared join as an undirected edge. SQL emission
//! is directed: each step `LEFT JOIN`s the newly covered cube, using the join
//! condition declared on whichever side owns the edge.
//!
//! Planning is a greedy Steiner tree. Start from a root cube. Then repeatedly
//! run a multi-source BFS from everything already covered and attach the
//! nearest uncovered target along its shortest path. Ties go to declaration
//! order. A target reachable by two distinct shortest paths is reported as
//! ambiguous rather than guessed.
//!
//! Known limitation: fan-out is detected, not corrected. When a `hasMany` hop
//! multiplies rows, measures of the "one" side are over-counted. Such steps are
//! flagged on the emitted [`JoinStep`].

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::error::{CompileError, CubeflowError, Result};
use crate::models::Relationship;
use crate::registry::CubeRegistry;
use crate::schema::{SqlTemplate, TouchedCubes};

/// A join as declared on its owning cube.
#[derive(Debug, Clone, Serialize)]
pub struct JoinEdge {
    pub owner: String,
    pub target: String,
    pub relationship: Relationship,
    pub template: SqlTemplate,
}

/// One `LEFT JOIN` in emission order.
#[derive(Debug, Clone, Serialize)]
pub struct JoinStep {
    /// Already joined cube the step hangs off.
    pub from: String,
    /// Cube introduced by this step.
    pub to: String,
    pub edge: JoinEdge,
    /// Rows of `from` are repeated once per matching row of `to`.
    pub fans_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinTree {
    pub root: String,
    pub steps: Vec<JoinStep>,
}

impl JoinTree {
    /// Cubes in the order they enter the FROM clause.
    pub fn cubes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.root.as_str()).chain(self.steps.iter().map(|s| s.to.as_str()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinGraph {
    order: Vec<String>,
    decl: HashMap<String, usize>,
    edges: Vec<JoinEdge>,
    /// cube -> (neighbor, edge indexes), neighbors in declaration order.
    adjacency: HashMap<String, Vec<(String, Vec<usize>)>>,
    component: HashMap<String, usize>,
}

impl JoinGraph {
    pub fn build(registry: &CubeRegistry, is_cube: &impl Fn(&str) -> bool) -> Result<Self> {
        let mut graph = JoinGraph::default();
        for (i, cube) in registry.cubes().iter().enumerate() {
            graph.order.push(cube.name.clone());
            graph.decl.insert(cube.name.clone(), i);
        }

        for cube in registry.cubes() {
            for (target, join) in cube.joins.iter() {
                if !is_cube(target) {
                    return Err(CubeflowError::Schema(format!(
                        "cube '{}' joins unknown cube '{target}'",
                        cube.name
                    )));
                }
                let template = SqlTemplate::parse(&join.sql, is_cube).map_err(|e| {
                    CubeflowError::Schema(format!("{}.joins.{target}: {e}", cube.name))
                })?;
                let idx = graph.edges.len();
                graph.edges.push(JoinEdge {
                    owner: cube.name.clone(),
                    target: target.to_string(),
                    relationship: join.relationship,
                    template,
                });
                graph.link(&cube.name, target, idx);
                graph.link(target, &cube.name, idx);
            }
        }

        let decl = graph.decl.clone();
        for neighbors in graph.adjacency.values_mut() {
            neighbors.sort_by_key(|(n, _)| decl.get(n).copied().unwrap_or(usize::MAX));
        }
        graph.label_components();
        Ok(graph)
    }

    fn link(&mut self, from: &str, to: &str, edge: usize) {
        let neighbors = self.adjacency.entry(from.to_string()).or_default();
        match neighbors.iter_mut().find(|(n, _)| n == to) {
            Some((_, edges)) => edges.push(edge),
            None => neighbors.push((to.to_string(), vec![edge])),
        }
    }

    fn label_components(&mut self) {
        let mut next = 0;
        for cube in self.order.clone() {
            if self.component.contains_key(&cube) {
                continue;
            }
            let mut queue = VecDeque::from([cube]);
            while let Some(node) = queue.pop_front() {
                if self.component.insert(node.clone(), next).is_some() {
                    continue;
                }
                for (n, _) in self.adjacency.get(&node).into_iter().flatten() {
                    if !self.component.contains_key(n) {
                        queue.push_back(n.clone());
                    }
                }
            }
            next += 1;
        }
    }

    pub fn edges(&self) -> &[JoinEdge] {
        &self.edges
    }

    /// True when a join path exists between the two cubes.
    pub fn connected(&self, a: &str, b: &str) -> bool {
        match (self.component.get(a), self.component.get(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    fn decl_index(&self, cube: &str) -> usize {
        self.decl.get(cube).copied().unwrap_or(usize::MAX)
    }

    /// `buildJoins(touchedCubes)`: shortest connecting tree rooted at the cube
    /// with the most touched members.
    pub fn build_joins(&self, touched: &TouchedCubes) -> std::result::Result<JoinTree, CompileError> {
        let root = touched
            .iter()
            .max_by(|(a, ca), (b, cb)| {
                ca.cmp(cb)
                    .then_with(|| self.decl_index(b).cmp(&self.decl_index(a)))
            })
            .map(|(cube, _)| cube.clone())
            .ok_or_else(|| CompileError::MalformedQuery("query references no cubes".to_string()))?;
        if !self.decl.contains_key(&root) {
            return Err(CompileError::UnknownCube(root));
        }

        let mut covered: Vec<String> = vec![root.clone()];
        let mut covered_set: HashSet<String> = covered.iter().cloned().collect();
        let mut remaining: Vec<String> = touched.keys().filter(|c| **c != root).cloned().collect();
        remaining.sort_by_key(|c| self.decl_index(c));
        let mut steps = Vec::new();

        while !remaining.is_empty() {
            let search = self.bfs(&covered);
            let next = remaining
                .iter()
                .filter_map(|c| search.dist.get(c).map(|d| (*d, self.decl_index(c), c.clone())))
                .min();
            let Some((_, _, target)) = next else {
                let mut cubes = vec![root.clone()];
                cubes.extend(remaining.iter().cloned());
                return Err(CompileError::NoJoinPath(cubes));
            };

            let paths = search.paths_to(&target, 2);
            if paths.len() > 1 {
                return Err(CompileError::AmbiguousJoinPath {
                    target: target.clone(),
                    paths: paths.iter().map(|p| p.join(" -> ")).collect(),
                });
            }
            let path = paths.into_iter().next().unwrap_or_default();
            for hop in path.windows(2) {
                let (from, to) = (&hop[0], &hop[1]);
                if covered_set.contains(to) {
                    continue;
                }
                let edge = self.edge_between(from, to).ok_or_else(|| {
                    CompileError::NoJoinPath(vec![from.clone(), to.clone()])
                })?;
                let fans_out = match (edge.owner == *from, edge.relationship) {
                    (true, Relationship::HasMany) => true,
                    (false, Relationship::BelongsTo) => true,
                    _ => false,
                };
                if fans_out {
                    tracing::debug!(from = %from, to = %to, "join step multiplies rows");
                }
                steps.push(JoinStep {
                    from: from.clone(),
                    to: to.clone(),
                    edge: edge.clone(),
                    fans_out,
                });
                covered.push(to.clone());
                covered_set.insert(to.clone());
            }
            remaining.retain(|c| !covered_set.contains(c));
        }

        Ok(JoinTree { root, steps })
    }

    /// Prefer the join declared on the side we walk from.
    fn edge_between(&self, from: &str, to: &str) -> Option<&JoinEdge> {
        let (_, idxs) = self.adjacency.get(from)?.iter().find(|(n, _)| n == to)?;
        idxs.iter()
            .map(|&i| &self.edges[i])
            .find(|e| e.owner == from)
            .or_else(|| idxs.first().map(|&i| &self.edges[i]))
    }

    fn bfs(&self, sources: &[String]) -> Search {
        let mut search = Search::default();
        let mut queue = VecDeque::new();
        for s in sources {
            search.dist.insert(s.clone(), 0);
            queue.push_back(s.clone());
        }
        while let Some(node) = queue.pop_front() {
            let d = search.dist[&node];
            for (n, _) in self.adjacency.get(&node).into_iter().flatten() {
                match search.dist.get(n) {
                    None => {
                        search.dist.insert(n.clone(), d + 1);
                        search.preds.insert(n.clone(), vec![node.clone()]);
                        queue.push_back(n.clone());
                    }
                    Some(&nd) if nd == d + 1 => {
                        search.preds.entry(n.clone()).or_default().push(node.clone());
                    }
                    _ => {}
                }
            }
        }
        search
    }
}

#[derive(Default)]
struct Search {
    dist: HashMap<String, usize>,
    preds: HashMap<String, Vec<String>>,
}

impl Search {
    /// Up to `limit` distinct shortest paths from a source to `target`.
    fn paths_to(&self, target: &str, limit: usize) -> Vec<Vec<String>> {
        let preds = match self.preds.get(target) {
            None => return vec![vec![target.to_string()]],
            Some(p) => p,
        };
        let mut out = Vec::new();
        for p in preds {
            for mut path in self.paths_to(p, limit) {
                path.push(target.to_string());
                out.push(path);
                if out.len() >= limit {
                    return out;
                }
            }
        }
        out
    }
}
