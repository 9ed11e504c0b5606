// ABOUTME: Integration tests for dependency-ordered target builds.
// ABOUTME: Property tests over random image graphs check ordering, dirtiness and reuse.

mod support;

use async_trait::async_trait;
use kiln::buildcontrol::{BuildError, BuildHandler, TargetQueue};
use kiln::model::{ImageTarget, K8sTarget, TargetId, TargetSpec};
use kiln::store::{BuildResult, BuildResultSet, BuildState, BuildStateSet};
use kiln::types::ImageRef;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::path::PathBuf;
use support::success_result;

const MAX_IMAGES: usize = 6;

/// Image `i` may only depend on images with a lower index, so the graph is acyclic.
fn graph(n: usize, edges: &[Vec<bool>]) -> Vec<TargetSpec> {
    let mut specs: Vec<TargetSpec> = (0..n)
        .map(|i| {
            let deps = (0..i)
                .filter(|j| edges[i][*j])
                .map(|j| TargetId::image(format!("img{j}")))
                .collect();
            ImageTarget::new(
                format!("img{i}"),
                ImageRef::parse(&format!("img{i}")).unwrap(),
                format!("/src/img{i}"),
            )
            .with_dependencies(deps)
            .into()
        })
        .collect();
    specs.push(
        K8sTarget {
            id: TargetId::k8s("app"),
            yaml_path: PathBuf::from("/src/app.yaml"),
            namespace: None,
            image_dependency_ids: (0..n).map(|i| TargetId::image(format!("img{i}"))).collect(),
        }
        .into(),
    );
    specs
}

fn previous(spec: &TargetSpec) -> BuildResult {
    match spec {
        TargetSpec::Image(it) => BuildResult::image(it.id.clone(), it.image_ref.with_tag("kiln-old")),
        other => BuildResult::deploy(other.id().clone(), vec![]),
    }
}

#[derive(Default)]
struct Recorder {
    order: Vec<TargetId>,
    missing_deps: Vec<TargetId>,
}

#[async_trait]
impl BuildHandler for Recorder {
    async fn handle(
        &mut self,
        target: &TargetSpec,
        _state: BuildState,
        dep_results: &BuildResultSet,
    ) -> Result<BuildResult, BuildError> {
        if target.dependency_ids().iter().any(|d| !dep_results.contains(d)) {
            self.missing_deps.push(target.id().clone());
        }
        self.order.push(target.id().clone());
        Ok(success_result(target))
    }
}

fn run<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(f)
}

proptest! {
    #[test]
    fn dirty_targets_and_their_dependents_build_in_order(
        n in 1..=MAX_IMAGES,
        edges in prop::collection::vec(prop::collection::vec(any::<bool>(), MAX_IMAGES), MAX_IMAGES),
        dirty in prop::collection::vec(any::<bool>(), MAX_IMAGES + 1),
    ) {
        let specs = graph(n, &edges);
        let state: BuildStateSet = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let files = dirty[i].then(|| PathBuf::from(format!("/src/file{i}")));
                (spec.id().clone(), BuildState::new(Some(previous(spec)), files))
            })
            .collect();

        // Targets are listed dependencies-first, so one pass settles dirtiness.
        let mut expected = BTreeSet::new();
        for (i, spec) in specs.iter().enumerate() {
            if dirty[i] || spec.dependency_ids().iter().any(|d| expected.contains(d)) {
                expected.insert(spec.id().clone());
            }
        }

        let mut queue = TargetQueue::new(&specs, state).unwrap();
        prop_assert_eq!(queue.count_builds(), expected.len());

        let mut recorder = Recorder::default();
        run(queue.run_builds(&mut recorder)).unwrap();

        let visited: BTreeSet<TargetId> = recorder.order.iter().cloned().collect();
        prop_assert_eq!(&visited, &expected);
        prop_assert!(recorder.missing_deps.is_empty());
        for (pos, id) in recorder.order.iter().enumerate() {
            let spec = specs.iter().find(|s| s.id() == id).unwrap();
            for dep in spec.dependency_ids() {
                if let Some(dep_pos) = recorder.order.iter().position(|v| v == dep) {
                    prop_assert!(dep_pos < pos, "{} built before its dependency {}", id, dep);
                }
            }
        }

        prop_assert_eq!(queue.all_results().len(), specs.len());
        prop_assert_eq!(queue.new_results().len(), expected.len());
        prop_assert_eq!(queue.reused_results().len(), specs.len() - expected.len());
    }

    #[test]
    fn rebuilding_with_no_changes_builds_nothing(
        n in 1..=MAX_IMAGES,
        edges in prop::collection::vec(prop::collection::vec(any::<bool>(), MAX_IMAGES), MAX_IMAGES),
    ) {
        let specs = graph(n, &edges);
        let mut first = TargetQueue::new(&specs, BuildStateSet::new()).unwrap();
        prop_assert_eq!(first.count_builds(), specs.len());
        run(first.run_builds(&mut Recorder::default())).unwrap();

        let state: BuildStateSet = first
            .all_results()
            .results()
            .map(|r| (r.target_id().clone(), BuildState::new(Some(r.clone()), None)))
            .collect();
        let mut second = TargetQueue::new(&specs, state).unwrap();
        prop_assert_eq!(second.count_builds(), 0);

        let mut recorder = Recorder::default();
        run(second.run_builds(&mut recorder)).unwrap();
        prop_assert!(recorder.order.is_empty());
        prop_assert_eq!(second.all_results(), first.all_results());
    }
}

#[tokio::test]
async fn invalidated_result_forces_a_rebuild() {
    let specs = graph(2, &[vec![false; MAX_IMAGES], vec![true; MAX_IMAGES]]);
    let state: BuildStateSet = specs
        .iter()
        .map(|spec| {
            let last = match spec.id() {
                id if id == &TargetId::image("img0") => BuildResult::invalidated(id.clone()),
                _ => previous(spec),
            };
            (spec.id().clone(), BuildState::new(Some(last), None))
        })
        .collect();

    let mut queue = TargetQueue::new(&specs, state).unwrap();
    let mut recorder = Recorder::default();
    queue.run_builds(&mut recorder).await.unwrap();

    assert_eq!(
        recorder.order,
        vec![
            TargetId::image("img0"),
            TargetId::image("img1"),
            TargetId::k8s("app")
        ]
    );
}

#[tokio::test]
async fn handler_error_stops_the_walk() {
    struct FailFirst(usize);

    #[async_trait]
    impl BuildHandler for FailFirst {
        async fn handle(
            &mut self,
            target: &TargetSpec,
            _state: BuildState,
            _dep_results: &BuildResultSet,
        ) -> Result<BuildResult, BuildError> {
            self.0 += 1;
            Err(BuildError::dont_fall_back(format!("{} broke", target.id())))
        }
    }

    let specs = graph(3, &vec![vec![false; MAX_IMAGES]; MAX_IMAGES]);
    let mut queue = TargetQueue::new(&specs, BuildStateSet::new()).unwrap();
    let mut handler = FailFirst(0);
    let err = queue.run_builds(&mut handler).await.unwrap_err();

    assert_eq!(handler.0, 1);
    assert_eq!(err, BuildError::dont_fall_back("image:img0 broke"));
}

/// Records each visit with whether the handler saw a clean state.
#[derive(Default)]
struct StateRecorder {
    visits: Vec<(TargetId, bool)>,
}

#[async_trait]
impl BuildHandler for StateRecorder {
    async fn handle(
        &mut self,
        target: &TargetSpec,
        state: BuildState,
        _dep_results: &BuildResultSet,
    ) -> Result<BuildResult, BuildError> {
        self.visits.push((target.id().clone(), state.is_empty()));
        Ok(success_result(target))
    }
}

#[tokio::test]
async fn image_and_deploy_round_trip() {
    let specs = graph(1, &[vec![false; MAX_IMAGES]]);
    let a = TargetId::image("img0");
    let b = TargetId::k8s("app");

    let mut first = TargetQueue::new(&specs, BuildStateSet::new()).unwrap();
    let mut recorder = StateRecorder::default();
    first.run_builds(&mut recorder).await.unwrap();
    assert_eq!(recorder.visits, vec![(a.clone(), true), (b.clone(), true)]);
    assert_eq!(first.all_results().len(), 2);

    let unchanged: BuildStateSet = first
        .all_results()
        .results()
        .map(|r| (r.target_id().clone(), BuildState::new(Some(r.clone()), None)))
        .collect();
    let mut second = TargetQueue::new(&specs, unchanged.clone()).unwrap();
    let mut recorder = StateRecorder::default();
    second.run_builds(&mut recorder).await.unwrap();
    assert!(recorder.visits.is_empty());
    assert_eq!(second.reused_results().len(), 2);

    let mut a_dirty = unchanged;
    a_dirty.insert(a.clone(), BuildState::clean());
    let mut third = TargetQueue::new(&specs, a_dirty).unwrap();
    let mut recorder = StateRecorder::default();
    third.run_builds(&mut recorder).await.unwrap();
    // B's own state still holds its last result, but it rebuilds from scratch.
    assert_eq!(recorder.visits, vec![(a, true), (b, true)]);
    assert_eq!(third.new_results().len(), 2);
}
