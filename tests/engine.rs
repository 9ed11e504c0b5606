// ABOUTME: End-to-end tests for the engine with a scripted build strategy.
// ABOUTME: Covers build ordering, holds, parallelism, triggers, file watching, pod tracking and shutdown.

mod support;

use kiln::engine::{ConfigLoader, Engine, EngineOptions, FileWatcher, read_triggers};
use kiln::error::Error;
use kiln::model::{Manifest, TargetId, TargetSpec, TriggerMode};
use kiln::store::{Action, RuntimeStatus};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use support::{
    FakeBuilder, FakeCluster, RecordingWatcher, image, k8s_manifest, local_manifest, name,
};
use tokio::sync::mpsc;

fn options(max_parallel_builds: usize) -> EngineOptions {
    EngineOptions {
        max_parallel_builds,
        ..EngineOptions::default()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn initial_builds_run_local_targets_first() {
    support::init_tracing();
    let builder = Arc::new(FakeBuilder::new());
    let engine = Engine::new(&options(1), builder.clone(), None);
    engine.load_manifests(vec![
        k8s_manifest(
            "web",
            vec![image("base", &[]), image("web", &["base"])],
            &["web"],
        ),
        local_manifest("codegen", true),
    ]);

    engine.run_initial_builds().await.unwrap();

    assert_eq!(builder.built_manifests(), vec!["codegen", "web"]);
    let web = &builder.calls()[1];
    assert_eq!(
        web.targets,
        vec![
            TargetId::image("base"),
            TargetId::image("web"),
            TargetId::k8s("web")
        ]
    );

    let state = engine.store().rlock_state();
    assert_eq!(state.completed_build_count, 2);
    assert!(state.failed_manifests().is_empty());
}

#[tokio::test]
async fn dependents_wait_for_their_resource_deps() {
    let builder = Arc::new(FakeBuilder::with_delay(Duration::from_millis(20)));
    let engine = Engine::new(&options(3), builder.clone(), None);
    engine.load_manifests(vec![
        local_manifest("api", true).with_resource_deps(vec![name("db")]),
        local_manifest("db", true),
    ]);

    engine.run_initial_builds().await.unwrap();

    assert_eq!(builder.built_manifests(), vec!["db", "api"]);
}

#[tokio::test]
async fn failed_dependency_fails_the_run_without_hanging() {
    let builder = Arc::new(FakeBuilder::new());
    builder.fail("db");
    let engine = Engine::new(&options(3), builder.clone(), None);
    engine.load_manifests(vec![
        local_manifest("db", true),
        local_manifest("api", true).with_resource_deps(vec![name("db")]),
    ]);

    let err = tokio::time::timeout(Duration::from_secs(5), engine.run_initial_builds())
        .await
        .expect("run_initial_builds hung")
        .unwrap_err();

    match err {
        Error::BuildsFailed { count, names } => {
            assert_eq!(count, 2);
            assert_eq!(names, "db, api");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(builder.built_manifests(), vec!["db"]);
}

#[tokio::test]
async fn parallel_builds_stay_under_the_limit() {
    let builder = Arc::new(FakeBuilder::with_delay(Duration::from_millis(30)));
    let engine = Engine::new(&options(2), builder.clone(), None);
    engine.load_manifests(
        ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|n| local_manifest(n, true))
            .collect(),
    );

    engine.run_initial_builds().await.unwrap();

    assert_eq!(builder.calls().len(), 5);
    assert!(builder.max_in_flight() <= 2);
}

#[tokio::test]
async fn unparallelizable_local_target_builds_alone() {
    let builder = Arc::new(FakeBuilder::with_delay(Duration::from_millis(20)));
    let engine = Engine::new(&options(3), builder.clone(), None);
    engine.load_manifests(vec![
        local_manifest("migrate", false),
        local_manifest("lint", true),
        local_manifest("test", true),
    ]);

    engine.run_initial_builds().await.unwrap();

    assert_eq!(builder.built_manifests()[0], "migrate");
    assert_eq!(builder.calls().len(), 3);
}

#[tokio::test]
async fn manual_manifests_wait_for_a_trigger() {
    let builder = Arc::new(FakeBuilder::new());
    let engine = Arc::new(Engine::new(&options(3), builder.clone(), None));
    engine.load_manifests(vec![
        local_manifest("app", true),
        local_manifest("seed", true).with_trigger_mode(TriggerMode::Manual),
    ]);

    let running = engine.clone();
    let up = tokio::spawn(async move { running.up().await });

    wait_until(|| builder.calls().len() == 1).await;
    assert_eq!(builder.built_manifests(), vec!["app"]);

    engine.store().dispatch(Action::trigger(name("seed")));
    wait_until(|| builder.calls().len() == 2).await;
    assert_eq!(builder.built_manifests(), vec!["app", "seed"]);

    engine.shutdown();
    up.await.unwrap().unwrap();
}

#[tokio::test]
async fn file_change_rebuilds_with_the_changed_files() {
    let builder = Arc::new(FakeBuilder::new());
    let engine = Arc::new(Engine::new(&options(3), builder.clone(), None));
    engine.load_manifests(vec![local_manifest("app", true)]);

    let running = engine.clone();
    let up = tokio::spawn(async move { running.up().await });

    wait_until(|| engine.store().rlock_state().completed_build_count == 1).await;

    let changed = PathBuf::from("/src/app/main.rs");
    engine
        .store()
        .dispatch(Action::file_change(TargetId::local("app"), vec![changed.clone()]));
    wait_until(|| builder.calls().len() == 2).await;

    assert_eq!(builder.calls()[1].files_changed, vec![changed]);
    wait_until(|| engine.store().rlock_state().completed_build_count == 2).await;
    {
        let state = engine.store().rlock_state();
        let app = state.manifest_state(&name("app")).unwrap();
        assert!(!app.has_pending_file_changes());
        assert_eq!(app.build_history.len(), 2);
    }

    engine.shutdown();
    up.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_cancels_in_flight_builds() {
    let builder = Arc::new(FakeBuilder::with_delay(Duration::from_secs(30)));
    let engine = Arc::new(Engine::new(&options(3), builder.clone(), None));
    engine.load_manifests(vec![local_manifest("slow", true)]);

    let running = engine.clone();
    let ci = tokio::spawn(async move { running.run_initial_builds().await });

    wait_until(|| builder.calls().len() == 1).await;
    engine.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), ci)
        .await
        .expect("shutdown did not stop the engine")
        .unwrap();
    assert!(matches!(result, Err(Error::BuildsFailed { count: 1, .. })));
}

fn pods(engine: &Engine) -> Vec<String> {
    let state = engine.store().rlock_state();
    state
        .manifest_state(&name("web"))
        .map(|ms| {
            ms.runtime_state
                .containers
                .iter()
                .filter_map(|c| c.pod_id.as_ref().map(|p| p.as_str().to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn slow_report_for_an_earlier_deploy_never_lands() {
    let builder = Arc::new(FakeBuilder::new());
    let cluster = Arc::new(
        FakeCluster::new()
            .with_pod("kiln-1", Duration::from_millis(200), "old-pod")
            .with_pod("kiln-2", Duration::ZERO, "new-pod"),
    );
    let engine = Arc::new(Engine::new(&options(1), builder.clone(), Some(cluster.clone())));
    engine.load_manifests(vec![k8s_manifest("web", vec![image("web", &[])], &["web"])]);

    let running = engine.clone();
    let up = tokio::spawn(async move { running.up().await });

    wait_until(|| engine.store().rlock_state().completed_build_count == 1).await;
    wait_until(|| cluster.polls() >= 1).await;
    engine.store().dispatch(Action::file_change(
        TargetId::image("web"),
        vec![PathBuf::from("/src/web/main.go")],
    ));

    wait_until(|| pods(&engine) == vec!["new-pod"]).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(pods(&engine), vec!["new-pod"]);
    {
        let state = engine.store().rlock_state();
        let web = state.manifest_state(&name("web")).unwrap();
        assert_eq!(web.runtime_state.status, RuntimeStatus::Ready);
        assert_eq!(builder.calls().len(), 2);
    }

    engine.shutdown();
    up.await.unwrap().unwrap();
}

fn watcher(backend: &RecordingWatcher) -> (FileWatcher, mpsc::UnboundedSender<Vec<PathBuf>>) {
    let (events, rx) = mpsc::unbounded_channel();
    let watcher = FileWatcher::new(Box::new(backend.clone()), rx)
        .with_debounce(Duration::from_millis(10));
    (watcher, events)
}

#[tokio::test]
async fn watched_source_edit_rebuilds_its_manifest() {
    let builder = Arc::new(FakeBuilder::new());
    let engine = Arc::new(Engine::new(&options(3), builder.clone(), None));
    let backend = RecordingWatcher::default();
    let (watcher, events) = watcher(&backend);
    engine.watch_files(watcher);
    engine.load_manifests(vec![local_manifest("app", true)]);

    let running = engine.clone();
    let up = tokio::spawn(async move { running.up().await });

    wait_until(|| engine.store().rlock_state().completed_build_count == 1).await;
    wait_until(|| !backend.watched().is_empty()).await;
    assert_eq!(
        backend.watched(),
        BTreeMap::from([(PathBuf::from("/src/app"), true)])
    );

    let edited = PathBuf::from("/src/app/main.rs");
    events
        .send(vec![
            PathBuf::from("/src/app/.git/index"),
            edited.clone(),
            PathBuf::from("/elsewhere/notes.txt"),
        ])
        .unwrap();

    wait_until(|| builder.calls().len() == 2).await;
    assert_eq!(builder.calls()[1].files_changed, vec![edited]);

    engine.shutdown();
    up.await.unwrap().unwrap();
}

#[tokio::test]
async fn config_edit_reloads_instead_of_marking_sources() {
    let config = PathBuf::from("/src/kiln.yml");
    let app = |allow_parallel: bool| -> Manifest {
        let mut m = local_manifest("app", allow_parallel);
        m.config_files = vec![config.clone()];
        m
    };
    let edited = app(false);
    let loader: ConfigLoader = Arc::new(move || Ok::<_, Error>(vec![edited.clone()]));

    let builder = Arc::new(FakeBuilder::new());
    let engine = Arc::new(Engine::new(&options(3), builder.clone(), None));
    let backend = RecordingWatcher::default();
    let (watcher, events) = watcher(&backend);
    engine.watch_files(watcher.with_config(config.clone(), loader));
    engine.load_manifests(vec![app(true)]);

    let running = engine.clone();
    let up = tokio::spawn(async move { running.up().await });

    wait_until(|| engine.store().rlock_state().completed_build_count == 1).await;
    wait_until(|| backend.watched().len() == 2).await;
    assert_eq!(
        backend.watched(),
        BTreeMap::from([
            (PathBuf::from("/src"), false),
            (PathBuf::from("/src/app"), true)
        ])
    );

    events.send(vec![config.clone()]).unwrap();

    wait_until(|| engine.store().rlock_state().completed_build_count == 2).await;
    {
        let state = engine.store().rlock_state();
        let ms = state.manifest_state(&name("app")).unwrap();
        assert_eq!(ms.build_history[0].edits, vec![config.clone()]);
        assert!(!ms.has_pending_file_changes());
        let TargetSpec::Local(local) = &state.manifest_target(&name("app")).unwrap().manifest.deploy_target
        else {
            panic!("app should deploy locally");
        };
        assert!(!local.allow_parallel);
    }
    assert!(builder.calls()[1].files_changed.is_empty());

    engine.shutdown();
    up.await.unwrap().unwrap();
}

#[tokio::test]
async fn typed_manifest_name_triggers_a_build() {
    let builder = Arc::new(FakeBuilder::new());
    let engine = Arc::new(Engine::new(&options(3), builder.clone(), None));
    engine.load_manifests(vec![
        local_manifest("app", true),
        local_manifest("seed", true).with_trigger_mode(TriggerMode::Manual),
    ]);

    let running = engine.clone();
    let up = tokio::spawn(async move { running.up().await });
    let (lines_tx, lines) = mpsc::unbounded_channel();
    let triggers = tokio::spawn(read_triggers(
        engine.store().clone(),
        engine.shutdown_handle().subscribe(),
        lines,
    ));

    wait_until(|| builder.calls().len() == 1).await;
    for line in ["", "Not A Name!", "unknown", "  seed  "] {
        lines_tx.send(line.to_string()).unwrap();
    }

    wait_until(|| builder.calls().len() == 2).await;
    assert_eq!(builder.built_manifests(), vec!["app", "seed"]);

    engine.shutdown();
    up.await.unwrap().unwrap();
    triggers.await.unwrap();
}
