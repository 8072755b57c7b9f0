//! Service dependency graph

use super::spec::ServiceSpec;
use crate::error::ConfigError;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Directed graph over services induced by `depends_on`.
///
/// Nodes are indices into the declaration order. Construction rejects unknown
/// names and cycles, so every built graph has a topological order.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

impl DependencyGraph {
    /// Build and validate the graph for `services`
    pub fn build(services: &[ServiceSpec]) -> Result<Self, ConfigError> {
        let index: HashMap<&str, usize> = services
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut dependencies = vec![Vec::new(); services.len()];
        let mut dependents = vec![Vec::new(); services.len()];

        for (i, service) in services.iter().enumerate() {
            for dep in &service.depends_on {
                let j = *index
                    .get(dep.as_str())
                    .ok_or_else(|| ConfigError::UnknownDependency {
                        service: service.name.clone(),
                        dependency: dep.clone(),
                    })?;
                if !dependencies[i].contains(&j) {
                    dependencies[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        let mut graph = Self {
            dependencies,
            dependents,
            order: Vec::new(),
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(ConfigError::CyclicDependency(
                cycle.into_iter().map(|i| services[i].name.clone()).collect(),
            ));
        }

        graph.order = graph.topological_order();
        Ok(graph)
    }

    /// Startup order; ties broken by declaration order
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Direct dependencies of `node`
    pub fn dependencies(&self, node: usize) -> &[usize] {
        &self.dependencies[node]
    }

    /// Services that directly depend on `node`
    pub fn dependents(&self, node: usize) -> &[usize] {
        &self.dependents[node]
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut path = Vec::new();

        for node in 0..self.len() {
            if marks[node] == Mark::Unvisited {
                if let Some(cycle) = self.visit(node, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(&self, node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::Visiting;
        path.push(node);

        for &dep in &self.dependencies[node] {
            match marks[dep] {
                Mark::Visiting => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(dep, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node] = Mark::Done;
        None
    }

    /// Kahn's algorithm, always releasing the earliest declared ready node
    fn topological_order(&self) -> Vec<usize> {
        let mut pending: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(services: &[ServiceSpec], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| services[i].name.clone()).collect()
    }

    #[test]
    fn test_get_start_order() {
        let services = vec![
            ServiceSpec::new("web", "nginx").depends_on("api"),
            ServiceSpec::new("api", "node").depends_on("db"),
            ServiceSpec::new("db", "postgres"),
        ];

        let graph = DependencyGraph::build(&services).unwrap();
        assert_eq!(names(&services, graph.order()), vec!["db", "api", "web"]);
    }

    #[test]
    fn test_independent_services_keep_declaration_order() {
        let services = vec![
            ServiceSpec::new("redis", "redis"),
            ServiceSpec::new("postgres", "postgres"),
            ServiceSpec::new("mailhog", "mailhog"),
        ];

        let graph = DependencyGraph::build(&services).unwrap();
        assert_eq!(graph.order(), &[0, 1, 2]);
    }

    #[test]
    fn test_tie_break_after_release() {
        // "late" is released by "base" but is declared before "free", so it
        // must come first once both are ready.
        let services = vec![
            ServiceSpec::new("late", "x").depends_on("base"),
            ServiceSpec::new("base", "x"),
            ServiceSpec::new("free", "x"),
        ];

        let graph = DependencyGraph::build(&services).unwrap();
        assert_eq!(names(&services, graph.order()), vec!["base", "late", "free"]);
    }

    #[test]
    fn test_circular_dependency_detection() {
        let services = vec![
            ServiceSpec::new("a", "nginx").depends_on("b"),
            ServiceSpec::new("b", "nginx").depends_on("c"),
            ServiceSpec::new("c", "nginx").depends_on("a"),
        ];

        assert_eq!(
            DependencyGraph::build(&services).unwrap_err(),
            ConfigError::CyclicDependency(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "a".to_string()
            ])
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let services = vec![ServiceSpec::new("a", "nginx").depends_on("a")];
        assert_eq!(
            DependencyGraph::build(&services).unwrap_err(),
            ConfigError::CyclicDependency(vec!["a".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let services = vec![ServiceSpec::new("api", "node").depends_on("db")];
        assert_eq!(
            DependencyGraph::build(&services).unwrap_err(),
            ConfigError::UnknownDependency {
                service: "api".to_string(),
                dependency: "db".to_string(),
            }
        );
    }

    #[test]
    fn test_repeated_dependency_counted_once() {
        let services = vec![
            ServiceSpec::new("db", "postgres"),
            ServiceSpec::new("api", "node").depends_on("db").depends_on("db"),
        ];

        let graph = DependencyGraph::build(&services).unwrap();
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependents(0), &[1]);
        assert_eq!(graph.order(), &[0, 1]);
    }
}
