//! Static dependency graph between workflow phases.
//!
//! The graph is built once at startup from `phase -> [prerequisites]` pairs and
//! validated: every prerequisite must name a known phase and there must be no
//! cycles. It is never persisted.

use std::collections::{BTreeMap, HashMap};

use crate::errors::LedgerError;

type PhaseIndex = usize;

/// Phases of the default analysis-to-deployment workflow, in declaration order.
pub const DEFAULT_WORKFLOW: &[(&str, &[&str])] = &[
    ("data-inventory", &[]),
    ("data-validation", &["data-inventory"]),
    ("analysis", &["data-validation"]),
    ("synthesis", &["analysis"]),
    ("recommendations", &["synthesis"]),
    ("integration", &["recommendations"]),
    ("deployment", &["integration"]),
    ("reporting", &["synthesis"]),
];

/// A validated, acyclic phase dependency graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Phase ids in declaration order
    ids: Vec<String>,
    index_map: HashMap<String, PhaseIndex>,
    /// index -> prerequisite ids
    dependencies: Vec<Vec<String>>,
    /// index -> indices of phases that list it as a prerequisite
    dependents: Vec<Vec<PhaseIndex>>,
}

impl DependencyGraph {
    /// Build and validate a graph from `(phase, prerequisites)` pairs.
    pub fn build<I, S, D>(phases: I) -> Result<Self, LedgerError>
    where
        I: IntoIterator<Item = (S, Vec<D>)>,
        S: Into<String>,
        D: Into<String>,
    {
        let mut ids = Vec::new();
        let mut dependencies = Vec::new();
        let mut index_map = HashMap::new();

        for (id, deps) in phases {
            let id = id.into();
            if index_map.contains_key(&id) {
                return Err(LedgerError::DuplicatePhase(id));
            }
            index_map.insert(id.clone(), ids.len());
            ids.push(id);
            dependencies.push(deps.into_iter().map(Into::into).collect::<Vec<String>>());
        }

        let mut dependents: Vec<Vec<PhaseIndex>> = vec![Vec::new(); ids.len()];
        for (idx, deps) in dependencies.iter().enumerate() {
            for dep in deps {
                let from = *index_map
                    .get(dep)
                    .ok_or_else(|| LedgerError::UnknownDependency {
                        phase: ids[idx].clone(),
                        dependency: dep.clone(),
                    })?;
                dependents[from].push(idx);
            }
        }

        let graph = Self {
            ids,
            index_map,
            dependencies,
            dependents,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    /// The built-in workflow graph.
    pub fn default_workflow() -> Self {
        // The constant table is acyclic and self-consistent; the test suite
        // guards that, so a failure here falls back to an empty graph.
        Self::build(
            DEFAULT_WORKFLOW
                .iter()
                .map(|(id, deps)| (*id, deps.to_vec())),
        )
        .unwrap_or_default()
    }

    /// Build from a config table. Phases are taken in the table's sorted key
    /// order, not the order they were written in the file.
    pub fn from_table(table: &BTreeMap<String, Vec<String>>) -> Result<Self, LedgerError> {
        Self::build(table.iter().map(|(k, v)| (k.clone(), v.clone())))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_map.contains_key(id)
    }

    /// Phase ids in declaration order.
    pub fn phase_ids(&self) -> &[String] {
        &self.ids
    }

    /// Prerequisites of `id`. Unknown phases have none.
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.index_map
            .get(id)
            .map(|&i| self.dependencies[i].as_slice())
            .unwrap_or(&[])
    }

    /// Phases that list `id` as a direct prerequisite.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.index_map.get(id).map_or_else(Vec::new, |&i| {
            self.dependents[i]
                .iter()
                .map(|&d| self.ids[d].as_str())
                .collect()
        })
    }

    /// Kahn's algorithm; any node left with a positive in-degree sits on a cycle.
    fn validate_no_cycles(&self) -> Result<(), LedgerError> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(|d| d.len()).collect();
        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.ids.len() {
            let offender = in_degree
                .iter()
                .position(|&deg| deg > 0)
                .map(|i| self.ids[i].clone())
                .unwrap_or_default();
            return Err(LedgerError::Cycle(offender));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> DependencyGraph {
        DependencyGraph::build(vec![
            ("base", vec![]),
            ("mid", vec!["base"]),
            ("top", vec!["mid"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_build_chain() {
        let graph = chain();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependencies("mid"), &["base".to_string()]);
        assert_eq!(graph.dependents("base"), vec!["mid"]);
        assert_eq!(graph.dependents("top"), Vec::<&str>::new());
    }

    #[test]
    fn test_unknown_phase_has_no_edges() {
        let graph = chain();
        assert!(graph.dependencies("ghost").is_empty());
        assert!(graph.dependents("ghost").is_empty());
        assert!(!graph.contains("ghost"));
    }

    #[test]
    fn test_cycle_detection() {
        let result = DependencyGraph::build(vec![
            ("a", vec!["c"]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
        ]);
        assert!(matches!(result, Err(LedgerError::Cycle(_))));
    }

    #[test]
    fn test_missing_dependency() {
        let result = DependencyGraph::build(vec![("a", vec!["nonexistent"])]);
        match result {
            Err(LedgerError::UnknownDependency { phase, dependency }) => {
                assert_eq!(phase, "a");
                assert_eq!(dependency, "nonexistent");
            }
            other => panic!("Expected UnknownDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_phase() {
        let result = DependencyGraph::build(vec![("a", Vec::<&str>::new()), ("a", vec![])]);
        assert!(matches!(result, Err(LedgerError::DuplicatePhase(_))));
    }

    #[test]
    fn test_default_workflow_is_valid() {
        let built = DependencyGraph::build(
            DEFAULT_WORKFLOW
                .iter()
                .map(|(id, deps)| (*id, deps.to_vec())),
        );
        assert!(built.is_ok());

        let graph = DependencyGraph::default_workflow();
        assert_eq!(graph.len(), DEFAULT_WORKFLOW.len());
        let mut synthesis_dependents = graph.dependents("synthesis");
        synthesis_dependents.sort();
        assert_eq!(synthesis_dependents, vec!["recommendations", "reporting"]);
    }

    #[test]
    fn test_from_table() {
        let mut table = BTreeMap::new();
        table.insert("alpha".to_string(), vec![]);
        table.insert("beta".to_string(), vec!["alpha".to_string()]);
        let graph = DependencyGraph::from_table(&table).unwrap();
        assert_eq!(graph.dependents("alpha"), vec!["beta"]);
    }

    #[test]
    fn test_from_table_uses_sorted_key_order() {
        let mut table = BTreeMap::new();
        table.insert("zeta".to_string(), vec![]);
        table.insert("deploy".to_string(), vec!["zeta".to_string()]);
        table.insert("build".to_string(), vec![]);
        let graph = DependencyGraph::from_table(&table).unwrap();
        assert_eq!(graph.phase_ids(), ["build", "deploy", "zeta"]);
    }
}
