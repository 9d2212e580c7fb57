//! Dependency graph resolution.
//!
//! Jobs form a directed graph through their prerequisites. Resolution yields
//! an order in which every job follows all of its prerequisites. Among jobs
//! that are ready at the same time, the one with the most transitive
//! dependents goes first, then the one declared earlier.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::{PipelineError, PipelineResult};
use crate::validation::ValidationError;

/// Resolved job graph, indexed by definition order
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    prerequisites: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    downstream: Vec<usize>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Builds and resolves a graph from `(job, prerequisites)` pairs in definition order.
    ///
    /// Fails with `ConfigurationError` for duplicate or dangling names and with
    /// `CycleDetected` when the prerequisites loop.
    pub fn build<'a, I, P>(jobs: I) -> PipelineResult<Self>
    where
        I: IntoIterator<Item = (&'a str, P)>,
        P: IntoIterator<Item = &'a str>,
    {
        let mut names = Vec::new();
        let mut raw_edges = Vec::new();
        let mut index = HashMap::new();

        for (name, prereqs) in jobs {
            if index.insert(name.to_string(), names.len()).is_some() {
                return Err(ValidationError::DuplicateJob {
                    name: name.to_string(),
                }
                .into());
            }
            names.push(name.to_string());
            raw_edges.push(prereqs.into_iter().collect::<Vec<_>>());
        }

        let mut prerequisites = vec![Vec::new(); names.len()];
        let mut dependents = vec![Vec::new(); names.len()];
        for (job, prereqs) in raw_edges.into_iter().enumerate() {
            for prereq in prereqs {
                let Some(&p) = index.get(prereq) else {
                    return Err(ValidationError::DanglingPrerequisite {
                        job: names[job].clone(),
                        prerequisite: prereq.to_string(),
                    }
                    .into());
                };
                if prerequisites[job].contains(&p) {
                    return Err(ValidationError::DuplicatePrerequisite {
                        job: names[job].clone(),
                        prerequisite: prereq.to_string(),
                    }
                    .into());
                }
                prerequisites[job].push(p);
                dependents[p].push(job);
            }
        }

        let mut graph = Self {
            names,
            index,
            prerequisites,
            dependents,
            downstream: Vec::new(),
            order: Vec::new(),
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(PipelineError::CycleDetected { jobs: cycle });
        }
        graph.downstream = (0..graph.len()).map(|i| graph.reachable_dependents(i)).collect();
        graph.order = graph.resolve_order();
        Ok(graph)
    }

    /// Number of jobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if the graph has no jobs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Job name at `index`
    #[must_use]
    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// Definition index of `name`
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Direct prerequisites of the job at `index`
    #[must_use]
    pub fn prerequisites(&self, index: usize) -> &[usize] {
        &self.prerequisites[index]
    }

    /// Direct dependents of the job at `index`
    #[must_use]
    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Number of jobs that transitively depend on the job at `index`
    #[must_use]
    pub fn downstream_count(&self, index: usize) -> usize {
        self.downstream[index]
    }

    /// Dispatch priority for simultaneously ready jobs; smaller sorts first
    #[must_use]
    pub fn rank(&self, index: usize) -> (Reverse<usize>, usize) {
        (Reverse(self.downstream[index]), index)
    }

    /// Resolved order as definition indices
    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Resolved order as job names
    #[must_use]
    pub fn ordered_names(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.names[i].as_str()).collect()
    }

    /// Every job that transitively depends on the job at `index`
    #[must_use]
    pub fn transitive_dependents(&self, index: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            for &next in &self.dependents[current] {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    fn reachable_dependents(&self, index: usize) -> usize {
        self.transitive_dependents(index).len()
    }

    fn resolve_order(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.prerequisites.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<((Reverse<usize>, usize), usize)>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse((self.rank(i), i)))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse((_, job))) = ready.pop() {
            order.push(job);
            for &dependent in &self.dependents[job] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push(Reverse((self.rank(dependent), dependent)));
                }
            }
        }
        order
    }

    /// Finds one cycle, returned in prerequisite direction with the first job repeated at the end
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut path: Vec<usize> = Vec::new();

        for root in 0..self.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS: (node, next prerequisite position)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;
            path.push(root);

            while let Some((node, pos)) = stack.last_mut() {
                let node = *node;
                if let Some(&next) = self.prerequisites[node].get(*pos) {
                    *pos += 1;
                    match marks[next] {
                        Mark::Unvisited => {
                            marks[next] = Mark::OnStack;
                            path.push(next);
                            stack.push((next, 0));
                        }
                        Mark::OnStack => {
                            let start = path.iter().position(|&n| n == next).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|&n| self.names[n].clone()).collect();
                            cycle.push(self.names[next].clone());
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    path.pop();
                    stack.pop();
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn graph(jobs: &[(&'static str, &[&'static str])]) -> PipelineResult<DependencyGraph> {
        DependencyGraph::build(jobs.iter().map(|(name, prereqs)| (*name, prereqs.iter().copied())))
    }

    #[test]
    fn test_linear_chain() {
        let g = graph(&[
            ("lint", &[]),
            ("test", &["lint"]),
            ("build", &["test"]),
            ("deploy", &["build"]),
        ])
        .unwrap();
        assert_eq!(g.ordered_names(), vec!["lint", "test", "build", "deploy"]);
        assert_eq!(g.downstream_count(0), 3);
    }

    #[test]
    fn test_prefers_most_downstream_then_definition_order() {
        // `docs` has no dependents, `compile` feeds two jobs.
        let g = graph(&[
            ("docs", &[]),
            ("audit", &[]),
            ("compile", &[]),
            ("unit", &["compile"]),
            ("package", &["compile"]),
        ])
        .unwrap();
        assert_eq!(
            g.ordered_names(),
            vec!["compile", "docs", "audit", "unit", "package"]
        );
    }

    #[test]
    fn test_fan_in_waits_for_all_prerequisites() {
        let g = graph(&[
            ("a", &[]),
            ("b", &[]),
            ("join", &["a", "b"]),
        ])
        .unwrap();
        let order = g.ordered_names();
        assert_eq!(order.last(), Some(&"join"));
        assert_eq!(g.dependents(0), &[2]);
        assert_eq!(g.prerequisites(2), &[0, 1]);
    }

    #[test]
    fn test_dangling_prerequisite() {
        let err = graph(&[("deploy", &["biuld"])]).unwrap_err();
        assert_eq!(
            err,
            PipelineError::ConfigurationError(ValidationError::DanglingPrerequisite {
                job: "deploy".to_string(),
                prerequisite: "biuld".to_string(),
            })
        );
    }

    #[test]
    fn test_duplicate_job() {
        let err = graph(&[("a", &[]), ("a", &[])]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ConfigurationError(ValidationError::DuplicateJob { .. })
        ));
    }

    #[test]
    fn test_cycle_names_every_member() {
        let err = graph(&[
            ("entry", &[]),
            ("a", &["entry", "c"]),
            ("b", &["a"]),
            ("c", &["b"]),
        ])
        .unwrap_err();
        let PipelineError::CycleDetected { jobs } = err else {
            panic!("expected cycle");
        };
        assert_eq!(jobs, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = graph(&[("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            PipelineError::CycleDetected {
                jobs: vec!["a".to_string(), "a".to_string()]
            }
        );
    }

    #[test]
    fn test_transitive_dependents() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]).unwrap();
        assert_eq!(g.transitive_dependents(0), HashSet::from([1, 2]));
        assert!(g.transitive_dependents(3).is_empty());
    }

    /// Random DAG: job `i` may only depend on jobs with a smaller index.
    fn dag_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
        (1usize..14).prop_flat_map(|n| {
            (0..n)
                .map(|i| proptest::sample::subsequence((0..i).collect::<Vec<_>>(), 0..=i))
                .collect::<Vec<_>>()
        })
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("job{i}")).collect()
    }

    proptest! {
        #[test]
        fn prop_order_respects_prerequisites(edges in dag_strategy(), reverse in any::<bool>()) {
            let n = edges.len();
            let labels = names(n);
            let mut defs: Vec<(&str, Vec<&str>)> = edges
                .iter()
                .enumerate()
                .map(|(i, prereqs)| {
                    (labels[i].as_str(), prereqs.iter().map(|&p| labels[p].as_str()).collect())
                })
                .collect();
            if reverse {
                defs.reverse();
            }

            let g = DependencyGraph::build(defs.iter().map(|(n, p)| (*n, p.iter().copied()))).unwrap();
            let order = g.ordered_names();
            prop_assert_eq!(order.len(), n);

            let position: HashMap<&str, usize> =
                order.iter().enumerate().map(|(i, name)| (*name, i)).collect();
            for (job, prereqs) in &defs {
                for prereq in prereqs {
                    prop_assert!(position[job] > position[prereq]);
                }
            }
        }

        #[test]
        fn prop_cycle_is_reported_as_a_real_cycle(
            n in 2usize..10,
            extra in proptest::collection::vec((0usize..10, 0usize..10), 0..8),
        ) {
            let labels = names(n);
            // Ring: job i depends on job i-1 and job0 depends on the last job.
            let mut prereqs: Vec<Vec<&str>> = (0..n)
                .map(|i| vec![labels[(i + n - 1) % n].as_str()])
                .collect();
            for (from, to) in extra {
                let (from, to) = (from % n, to % n);
                if !prereqs[from].contains(&labels[to].as_str()) {
                    prereqs[from].push(labels[to].as_str());
                }
            }

            let err = DependencyGraph::build(
                labels.iter().zip(&prereqs).map(|(l, p)| (l.as_str(), p.iter().copied())),
            )
            .unwrap_err();
            let PipelineError::CycleDetected { jobs } = err else {
                return Err(TestCaseError::fail("expected a cycle"));
            };
            prop_assert!(jobs.len() >= 2);
            prop_assert_eq!(jobs.first(), jobs.last());
            for pair in jobs.windows(2) {
                let from = labels.iter().position(|l| *l == pair[0]).unwrap();
                prop_assert!(prereqs[from].contains(&pair[1].as_str()));
            }
        }
    }
}
