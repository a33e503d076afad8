//! Dependency bookkeeping between core objects.
//!
//! Edges are declared by the objects themselves, so no cycle detection is
//! done here. Walkers must track what they visited.

use std::collections::{HashMap, HashSet};

use crate::sync::CoreObjectId;

/// Forward and reverse adjacency between core objects.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// object -> objects it depends on
    dependencies: HashMap<CoreObjectId, HashSet<CoreObjectId>>,
    /// object -> objects that depend on it
    dependants: HashMap<CoreObjectId, HashSet<CoreObjectId>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the dependency set of `object` with `new_dependencies`.
    ///
    /// Only the edges that changed are touched in the reverse map.
    pub fn update_dependencies(&mut self, object: CoreObjectId, new_dependencies: &[CoreObjectId]) {
        let new: HashSet<CoreObjectId> = new_dependencies
            .iter()
            .copied()
            .filter(|&dependency| dependency != object)
            .collect();
        let old = self.dependencies.remove(&object).unwrap_or_default();

        for removed in old.difference(&new) {
            Self::unlink(&mut self.dependants, *removed, object);
        }
        for added in new.difference(&old) {
            self.dependants.entry(*added).or_default().insert(object);
        }

        if !new.is_empty() {
            self.dependencies.insert(object, new);
        }
    }

    /// Objects that depend on `object`.
    pub fn dependants_of(&self, object: CoreObjectId) -> impl Iterator<Item = CoreObjectId> + '_ {
        self.dependants.get(&object).into_iter().flatten().copied()
    }

    /// Objects `object` depends on.
    pub fn dependencies_of(&self, object: CoreObjectId) -> impl Iterator<Item = CoreObjectId> + '_ {
        self.dependencies.get(&object).into_iter().flatten().copied()
    }

    /// Drops every edge touching `object`.
    pub fn remove(&mut self, object: CoreObjectId) {
        if let Some(dependencies) = self.dependencies.remove(&object) {
            for dependency in dependencies {
                Self::unlink(&mut self.dependants, dependency, object);
            }
        }
        if let Some(dependants) = self.dependants.remove(&object) {
            for dependant in dependants {
                Self::unlink(&mut self.dependencies, dependant, object);
            }
        }
    }

    /// Every object reachable through dependant edges, excluding `object`.
    #[must_use]
    pub fn transitive_dependants(&self, object: CoreObjectId) -> Vec<CoreObjectId> {
        let mut visited = HashSet::from([object]);
        let mut stack = vec![object];
        let mut out = Vec::new();

        while let Some(current) = stack.pop() {
            for dependant in self.dependants_of(current) {
                if visited.insert(dependant) {
                    out.push(dependant);
                    stack.push(dependant);
                }
            }
        }
        out
    }

    /// Number of objects with at least one dependency.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// Returns true if no edges exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    fn unlink(
        map: &mut HashMap<CoreObjectId, HashSet<CoreObjectId>>,
        from: CoreObjectId,
        to: CoreObjectId,
    ) {
        if let Some(set) = map.get_mut(&from) {
            set.remove(&to);
            if set.is_empty() {
                map.remove(&from);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<const N: usize>() -> [CoreObjectId; N] {
        std::array::from_fn(|_| CoreObjectId::next())
    }

    fn sorted(iter: impl Iterator<Item = CoreObjectId>) -> Vec<CoreObjectId> {
        let mut v: Vec<_> = iter.collect();
        v.sort();
        v
    }

    #[test]
    fn test_update_maintains_reverse_edges() {
        let [mesh, material, texture] = ids();
        let mut graph = DependencyGraph::new();

        graph.update_dependencies(mesh, &[material, texture]);
        assert_eq!(sorted(graph.dependants_of(material)), vec![mesh]);
        assert_eq!(sorted(graph.dependants_of(texture)), vec![mesh]);

        graph.update_dependencies(mesh, &[material]);
        assert_eq!(graph.dependants_of(texture).count(), 0);
        assert_eq!(sorted(graph.dependencies_of(mesh)), vec![material]);

        graph.update_dependencies(mesh, &[]);
        assert!(graph.is_empty());
        assert_eq!(graph.dependants_of(material).count(), 0);
    }

    #[test]
    fn test_remove_drops_both_directions() {
        let [a, b, c] = ids();
        let mut graph = DependencyGraph::new();
        graph.update_dependencies(b, &[a]);
        graph.update_dependencies(c, &[b]);

        graph.remove(b);
        assert_eq!(graph.dependants_of(a).count(), 0);
        assert_eq!(graph.dependencies_of(c).count(), 0);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_transitive_dependants_survive_cycles() {
        let [a, b, c, unrelated] = ids();
        let mut graph = DependencyGraph::new();
        graph.update_dependencies(b, &[a]);
        graph.update_dependencies(c, &[b]);
        graph.update_dependencies(a, &[c]);
        graph.update_dependencies(unrelated, &[]);

        assert_eq!(sorted(graph.transitive_dependants(a).into_iter()), sorted([b, c].into_iter()));
    }

    #[test]
    fn test_self_dependency_ignored() {
        let [a] = ids();
        let mut graph = DependencyGraph::new();
        graph.update_dependencies(a, &[a]);
        assert!(graph.is_empty());
    }
}
