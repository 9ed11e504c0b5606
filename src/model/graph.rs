// ABOUTME: Dependency graph over the targets of one build pass.
// ABOUTME: Topological ordering, reachability and the set of deployed images.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use super::target::{ImageTarget, TargetId, TargetSpec};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle detected at {0}")]
    Cycle(TargetId),

    #[error("{target} depends on {dependency}, which is not part of the build")]
    MissingDependency {
        target: TargetId,
        dependency: TargetId,
    },

    #[error("target {0} declared more than once")]
    DuplicateTarget(TargetId),

    #[error("target {0} is not in the graph")]
    UnknownTarget(TargetId),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order targets so every dependency precedes its dependents.
///
/// Ties keep input order, so a list that is already sorted comes back unchanged.
pub fn topological_sort(specs: &[TargetSpec]) -> Result<Vec<TargetSpec>, GraphError> {
    let index = index_by_id(specs)?;
    let mut marks: HashMap<&TargetId, Mark> = HashMap::with_capacity(specs.len());
    let mut order: Vec<usize> = Vec::with_capacity(specs.len());

    for spec in specs {
        visit(spec.id(), specs, &index, &mut marks, &mut order)?;
    }

    Ok(order.into_iter().map(|i| specs[i].clone()).collect())
}

fn index_by_id(specs: &[TargetSpec]) -> Result<HashMap<&TargetId, usize>, GraphError> {
    let mut index = HashMap::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        if index.insert(spec.id(), i).is_some() {
            return Err(GraphError::DuplicateTarget(spec.id().clone()));
        }
    }
    Ok(index)
}

fn visit<'a>(
    id: &'a TargetId,
    specs: &'a [TargetSpec],
    index: &HashMap<&'a TargetId, usize>,
    marks: &mut HashMap<&'a TargetId, Mark>,
    order: &mut Vec<usize>,
) -> Result<(), GraphError> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => return Err(GraphError::Cycle(id.clone())),
        None => {}
    }

    let i = *index
        .get(id)
        .ok_or_else(|| GraphError::UnknownTarget(id.clone()))?;
    marks.insert(id, Mark::Visiting);

    let spec = &specs[i];
    for dep in spec.dependency_ids() {
        if !index.contains_key(dep) {
            return Err(GraphError::MissingDependency {
                target: id.clone(),
                dependency: dep.clone(),
            });
        }
        visit(dep, specs, index, marks, order)?;
    }

    marks.insert(id, Mark::Done);
    order.push(i);
    Ok(())
}

/// Targets of one build pass, sorted dependencies first.
#[derive(Debug, Clone)]
pub struct TargetGraph {
    sorted: Vec<TargetSpec>,
    index: HashMap<TargetId, usize>,
    dependents: HashMap<TargetId, Vec<TargetId>>,
}

impl TargetGraph {
    pub fn new(specs: &[TargetSpec]) -> Result<Self, GraphError> {
        let sorted = topological_sort(specs)?;
        let index = sorted
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id().clone(), i))
            .collect();

        let mut dependents: HashMap<TargetId, Vec<TargetId>> = HashMap::new();
        for spec in &sorted {
            for dep in spec.dependency_ids() {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(spec.id().clone());
            }
        }

        Ok(Self {
            sorted,
            index,
            dependents,
        })
    }

    pub fn sorted(&self) -> &[TargetSpec] {
        &self.sorted
    }

    pub fn get(&self, id: &TargetId) -> Option<&TargetSpec> {
        self.index.get(id).map(|&i| &self.sorted[i])
    }

    /// Targets nothing else depends on.
    pub fn roots(&self) -> impl Iterator<Item = &TargetSpec> {
        self.sorted
            .iter()
            .filter(|s| !self.dependents.contains_key(s.id()))
    }

    pub fn dependents_of(&self, id: &TargetId) -> &[TargetId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Exactly one root, which transitively depends on everything else.
    pub fn is_single_source_dag(&self) -> bool {
        self.roots().count() == 1
    }

    /// Images handed directly to a deploy target. Without a deploy target the
    /// root images count as deployed.
    pub fn deployed_images(&self) -> Vec<&ImageTarget> {
        let has_deploy = self.sorted.iter().any(TargetSpec::is_deploy_target);

        self.sorted
            .iter()
            .filter_map(TargetSpec::as_image)
            .filter(|image| {
                let dependents = self.dependents_of(&image.id);
                if has_deploy {
                    dependents.iter().any(|d| {
                        self.get(d)
                            .map(TargetSpec::is_deploy_target)
                            .unwrap_or(false)
                    })
                } else {
                    dependents.is_empty()
                }
            })
            .collect()
    }

    /// Call `f` on `root` and each of its transitive dependencies exactly once,
    /// dependencies before dependents.
    pub fn visit_tree<F>(&self, root: &TargetId, mut f: F) -> Result<(), GraphError>
    where
        F: FnMut(&TargetSpec),
    {
        if !self.index.contains_key(root) {
            return Err(GraphError::UnknownTarget(root.clone()));
        }

        let mut seen: HashSet<&TargetId> = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(spec) = self.get(id) {
                stack.extend(spec.dependency_ids());
            }
        }

        // Walk in sorted order so callers see a deterministic sequence.
        for spec in &self.sorted {
            if seen.contains(spec.id()) {
                f(spec);
            }
        }
        Ok(())
    }
}
