// ABOUTME: Walks a manifest's targets in dependency order and builds only the dirty ones.
// ABOUTME: Clean targets reuse their previous result; anything downstream of a dirty target rebuilds.

use async_trait::async_trait;
use std::collections::BTreeSet;

use super::error::BuildError;
use crate::model::{TargetId, TargetSpec, topological_sort};
use crate::store::{BuildResult, BuildResultSet, BuildState, BuildStateSet};

/// Build strategy for one dirty target, supplied by the caller.
#[async_trait]
pub trait BuildHandler: Send {
    /// `state` is the target's own state when it changed, or a clean state when
    /// it only rebuilds because a dependency did. `dep_results` holds results
    /// for the target's direct dependencies.
    async fn handle(
        &mut self,
        target: &TargetSpec,
        state: BuildState,
        dep_results: &BuildResultSet,
    ) -> Result<BuildResult, BuildError>;
}

#[derive(Debug)]
pub struct TargetQueue {
    sorted: Vec<TargetSpec>,
    state: BuildStateSet,
    results: BuildResultSet,
    /// Targets with their own reason to rebuild.
    needs_own_build: BTreeSet<TargetId>,
    /// Targets downstream of something that rebuilds.
    deps_need_build: BTreeSet<TargetId>,
}

impl TargetQueue {
    pub fn new(specs: &[TargetSpec], state: BuildStateSet) -> Result<Self, BuildError> {
        let sorted = topological_sort(specs).map_err(|e| BuildError::unexpected(e.to_string()))?;

        let needs_own_build: BTreeSet<TargetId> = sorted
            .iter()
            .map(TargetSpec::id)
            .filter(|id| state.get_or_clean(id).needs_image_build())
            .cloned()
            .collect();

        // Sorted order means every dependency is decided before its dependents.
        let mut deps_need_build = BTreeSet::new();
        for target in &sorted {
            let dirty_dep = target
                .dependency_ids()
                .iter()
                .any(|dep| needs_own_build.contains(dep) || deps_need_build.contains(dep));
            if dirty_dep {
                deps_need_build.insert(target.id().clone());
            }
        }

        let mut queue = Self {
            sorted,
            state,
            results: BuildResultSet::new(),
            needs_own_build,
            deps_need_build,
        };
        queue.backfill_existing_results()?;
        Ok(queue)
    }

    fn backfill_existing_results(&mut self) -> Result<(), BuildError> {
        for target in &self.sorted {
            let id = target.id();
            if self.is_building(id) {
                continue;
            }
            let last = self
                .state
                .get(id)
                .and_then(|s| s.last_result.clone())
                .filter(BuildResult::is_reusable)
                .ok_or_else(|| {
                    BuildError::unexpected(format!(
                        "Internal error: build marked clean but last result not found: {}",
                        id
                    ))
                })?;
            self.results.insert(last);
        }
        Ok(())
    }

    pub fn is_building(&self, id: &TargetId) -> bool {
        self.needs_own_build.contains(id) || self.deps_need_build.contains(id)
    }

    pub fn count_builds(&self) -> usize {
        self.sorted.iter().filter(|t| self.is_building(t.id())).count()
    }

    /// Call `handler` once per dirty target, dependencies first. Stops at the first error.
    pub async fn run_builds<H: BuildHandler>(&mut self, handler: &mut H) -> Result<(), BuildError> {
        for target in &self.sorted {
            let id = target.id();
            if !self.is_building(id) {
                continue;
            }
            let state = if self.needs_own_build.contains(id) {
                self.state.get_or_clean(id)
            } else {
                BuildState::clean()
            };
            let dep_results = self.results.filter(target.dependency_ids());
            let result = handler.handle(target, state, &dep_results).await?;
            self.results.insert(result);
        }
        Ok(())
    }

    /// Results produced by this queue, excluding reused ones.
    pub fn new_results(&self) -> BuildResultSet {
        self.results
            .results()
            .filter(|r| self.is_building(r.target_id()))
            .cloned()
            .collect()
    }

    /// Results carried over from previous builds.
    pub fn reused_results(&self) -> BuildResultSet {
        self.results
            .results()
            .filter(|r| !self.is_building(r.target_id()))
            .cloned()
            .collect()
    }

    pub fn all_results(&self) -> &BuildResultSet {
        &self.results
    }
}
