//! End-to-end workflow runs against mock drivers.

use std::sync::Arc;
use std::time::Duration;

use labflow_config::{EngineConfig, LabConfig, SpawnTemplate};
use labflow_engine::testing::MockDriverFactory;
use labflow_engine::{Engine, EngineError, SpawnHandler};
use labflow_types::{ActionStatus, ExecutionContext, LabwareThreadStatus, MethodStatus, WorkflowStatus};

fn settings() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 5,
        availability_poll_ms: 5,
        event_feed_capacity: 4096,
    }
}

async fn engine(toml: &str) -> (Engine, Arc<MockDriverFactory>) {
    let catalog = LabConfig::from_toml(toml).expect("catalog parses");
    let factory = Arc::new(MockDriverFactory::new());
    let engine = Engine::from_config(catalog, factory.as_ref(), settings())
        .await
        .expect("engine builds");
    (engine, factory)
}

const PICK_PLACE: &str = r#"
[[locations]]
name = "a"

[[locations]]
name = "b"

[[equipment]]
name = "arm"
driver = "mock.arm"
options = { positions = ["a", "b"] }

[[pools]]
name = "arms"
members = ["arm"]

[[labware]]
name = "plate"
type = "96_well"

[[methods]]
name = "transfer"

[[methods.actions]]
name = "pick_a"
pool = "arms"
command = "pick"
location = "a"

[[methods.actions]]
name = "place_b"
pool = "arms"
command = "place"
location = "b"

[[workflows]]
name = "wf"

[[workflows.threads]]
name = "t1"
labware = "plate"
start = "a"
methods = ["transfer"]
"#;

#[tokio::test]
async fn test_pick_then_place_moves_labware() {
    let (engine, factory) = engine(PICK_PLACE).await;
    let report = engine.run_workflow("wf").await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed);
    let t1 = report.thread("t1").unwrap();
    assert_eq!(t1.status, LabwareThreadStatus::Completed);
    assert_eq!(t1.position.as_deref(), Some("b"));

    let thread = engine.registry().thread(t1.id).unwrap();
    let lab = engine.lab();
    assert!(lab.location("a").unwrap().is_empty());
    assert!(lab.location("b").unwrap().holds(thread.labware().id));

    let arm = factory.transporter("arm").unwrap();
    assert_eq!(arm.calls(), vec!["pick:a:96_well", "place:b:96_well"]);

    for action in thread.methods()[0].actions() {
        assert_eq!(action.status(), ActionStatus::Completed);
    }
    assert!(engine.reservations().is_idle("arm"));
    assert!(engine.reservations().is_idle("b"));
}

const SHARED_READER: &str = r#"
[[locations]]
name = "h1"

[[locations]]
name = "h2"

[[locations]]
name = "nest"
equipment = "reader"

[[equipment]]
name = "arm"
driver = "mock.arm"
options = { positions = ["h1", "h2", "nest"], delay_ms = 2 }

[[equipment]]
name = "reader"
driver = "mock.device"
locations = ["nest"]
options = { delay_ms = 10 }

[[pools]]
name = "readers"
members = ["reader"]

[[labware]]
name = "plate"
type = "96_well"

[[methods]]
name = "read"

[[methods.actions]]
name = "read_absorbance"
pool = "readers"
command = "read"

[[workflows]]
name = "wf"

[[workflows.threads]]
name = "s1"
labware = "plate"
start = "h1"
end = "h1"
methods = ["read"]

[[workflows.threads]]
name = "s2"
labware = "plate"
start = "h2"
end = "h2"
methods = ["read"]
"#;

#[tokio::test]
async fn test_threads_share_a_location_in_turn() {
    let (engine, factory) = engine(SHARED_READER).await;
    let report = engine.run_workflow("wf").await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed, "{report:?}");
    assert_eq!(report.thread("s1").unwrap().position.as_deref(), Some("h1"));
    assert_eq!(report.thread("s2").unwrap().position.as_deref(), Some("h2"));
    assert!(engine.lab().location("nest").unwrap().is_empty());

    let reader = factory.device("reader").unwrap();
    let executes = reader
        .calls()
        .into_iter()
        .filter(|c| c == "execute:read")
        .count();
    assert_eq!(executes, 2);
    assert_eq!(factory.transporter("arm").unwrap().max_concurrent_motion(), 1);
}

#[tokio::test]
async fn test_status_events_published() {
    let (engine, _factory) = engine(SHARED_READER).await;
    let mut feed = engine.bus().feed();
    let report = engine.run_workflow("wf").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);

    let mut names = Vec::new();
    while let Ok(event) = feed.try_recv() {
        names.push(event.name);
    }
    assert!(names.iter().any(|n| n == "workflow.RUNNING"));
    assert!(names.iter().any(|n| n == "workflow.COMPLETED"));
    assert_eq!(names.iter().filter(|n| *n == "thread.COMPLETED").count(), 2);
    assert_eq!(names.iter().filter(|n| *n == "method.IN_PROGRESS").count(), 2);
    assert!(names.iter().any(|n| n == "action.PERFORMING_ACTION"));

    // Per-entity events fire once per distinct status.
    let s1 = report.thread("s1").unwrap().id;
    let completed = format!("thread.{s1}.COMPLETED");
    assert_eq!(names.iter().filter(|n| **n == completed).count(), 1);
}

const UNREACHABLE_POOL: &str = r#"
[[locations]]
name = "a"

[[locations]]
name = "island"

[[equipment]]
name = "arm"
driver = "mock.arm"
options = { positions = ["a"] }

[[equipment]]
name = "reader"
driver = "mock.device"
locations = ["island"]

[[pools]]
name = "readers"
members = ["reader"]

[[labware]]
name = "plate"
type = "96_well"

[[methods]]
name = "read"

[[methods.actions]]
name = "read_absorbance"
pool = "readers"
command = "read"

[[workflows]]
name = "wf"

[[workflows.threads]]
name = "t1"
labware = "plate"
start = "a"
methods = ["read"]
"#;

#[tokio::test]
async fn test_no_available_member_errors_thread() {
    let (engine, factory) = engine(UNREACHABLE_POOL).await;
    let report = engine.run_workflow("wf").await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Errored);
    assert!(report.has_errors());
    let t1 = report.thread("t1").unwrap();
    assert_eq!(t1.status, LabwareThreadStatus::Errored);
    assert!(t1.error.as_deref().unwrap().contains("readers"));

    let thread = engine.registry().thread(t1.id).unwrap();
    assert!(matches!(
        thread.error(),
        Some(EngineError::NoAvailableMember { .. })
    ));
    assert_eq!(
        thread.methods()[0].actions()[0].status(),
        ActionStatus::Errored
    );
    assert!(factory.device("reader").unwrap().calls().is_empty());
    // Claims are returned when a thread fails.
    assert!(engine.reservations().held_by(t1.id).is_empty());
}

const FAILING_DEVICE: &str = r#"
[[locations]]
name = "h1"

[[locations]]
name = "h2"

[[equipment]]
name = "bad"
driver = "mock.device"
options = { fail_on = "shake" }

[[equipment]]
name = "good"
driver = "mock.device"

[[pools]]
name = "bad_pool"
members = ["bad"]

[[pools]]
name = "good_pool"
members = ["good"]

[[labware]]
name = "plate"
type = "96_well"

[[methods]]
name = "shake"

[[methods.actions]]
name = "shake"
pool = "bad_pool"
command = "shake"

[[methods]]
name = "seal"

[[methods.actions]]
name = "seal"
pool = "good_pool"
command = "seal"

[[workflows]]
name = "wf"

[[workflows.threads]]
name = "failing"
labware = "plate"
start = "h1"
methods = ["shake", "seal"]

[[workflows.threads]]
name = "healthy"
labware = "plate"
start = "h2"
methods = ["seal"]
"#;

#[tokio::test]
async fn test_device_error_fails_only_its_thread() {
    let (engine, factory) = engine(FAILING_DEVICE).await;
    let report = engine.run_workflow("wf").await.unwrap();

    assert_eq!(report.status, WorkflowStatus::Errored);
    let failing = report.thread("failing").unwrap();
    assert_eq!(failing.status, LabwareThreadStatus::Errored);
    assert!(failing.error.as_deref().unwrap().contains("shake failed"));
    assert_eq!(
        report.thread("healthy").unwrap().status,
        LabwareThreadStatus::Completed
    );

    // The failed thread never reached its second method.
    let thread = engine.registry().thread(failing.id).unwrap();
    assert_eq!(thread.methods()[1].status(), MethodStatus::Created);
    assert!(matches!(thread.error(), Some(EngineError::Device(_))));
    assert_eq!(factory.device("good").unwrap().calls(), vec!["execute:seal"]);
}

const SPAWN_AND_JOIN: &str = r#"
[[locations]]
name = "h1"

[[locations]]
name = "h2"

[[equipment]]
name = "lidder"
driver = "mock.device"
options = { delay_ms = 5 }

[[pools]]
name = "lidders"
members = ["lidder"]

[[labware]]
name = "plate"
type = "96_well"

[[labware]]
name = "lid"
type = "lid"

[[methods]]
name = "prepare"

[[methods.actions]]
name = "prepare"
pool = "lidders"
command = "prepare"

[[methods]]
name = "delid"

[[methods.actions]]
name = "delid"
pool = "lidders"
command = "delid"

[[methods]]
name = "await_lid"
junction = true

[[workflows]]
name = "wf"

[[workflows.threads]]
name = "sample"
labware = "plate"
start = "h1"
methods = ["prepare", "await_lid"]

[[workflows.threads]]
name = "lid"
labware = "lid"
start = "h2"
methods = ["delid"]

[[workflows.spawns]]
thread = "sample"
method = "prepare"
spawn = "lid"

[[workflows.joins]]
thread = "lid"
method = "delid"
attach_thread = "sample"
junction = "await_lid"
"#;

#[tokio::test]
async fn test_spawned_thread_joins_back() {
    let (engine, _factory) = engine(SPAWN_AND_JOIN).await;
    let workflow = engine.start_workflow("wf").unwrap();

    // Spawn targets are not created up front.
    assert_eq!(engine.registry().threads_in(workflow.id()).len(), 1);

    let report = labflow_engine::ThreadManager::new(engine.clone())
        .run_until_complete(&workflow)
        .await
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Completed, "{report:?}");
    assert_eq!(report.threads.len(), 2);

    let sample = engine.registry().thread_by_name(None, "sample").unwrap();
    let lid = engine.registry().thread_by_name(None, "lid").unwrap();
    let junction = sample.method("await_lid").unwrap();
    let delid = lid.method("delid").unwrap();
    assert_eq!(junction.status(), MethodStatus::Completed);
    assert_eq!(junction.wrapped(), Some(delid.id()));
    assert_eq!(workflow.junction("sample", "await_lid"), Some(delid.id()));
    assert_eq!(workflow.status(), WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_spawn_fires_once() {
    let (engine, _factory) = engine(SPAWN_AND_JOIN).await;
    let workflow = engine.start_workflow("wf").unwrap();
    let rule = SpawnTemplate {
        thread: "sample".into(),
        method: "prepare".into(),
        spawn: "lid".into(),
    };
    let handler = SpawnHandler::new(workflow.id(), rule, engine.downgrade());

    let sample = engine.registry().thread_by_name(None, "sample").unwrap();
    let prepare = sample.method("prepare").unwrap();
    let context = sample.context().with_method(prepare.id(), "prepare");

    // Other methods and other workflows are ignored.
    let other = sample.context().with_method(prepare.id(), "await_lid");
    assert!(!handler.handle(&other));
    assert!(!handler.handle(&ExecutionContext::new()));
    assert!(!handler.has_fired());

    assert!(handler.handle(&context));
    assert!(!handler.handle(&context));
    assert!(handler.has_fired());

    let lids = engine
        .registry()
        .threads_in(workflow.id())
        .into_iter()
        .filter(|t| t.name() == "lid")
        .count();
    assert_eq!(lids, 1);
}

#[tokio::test]
async fn test_lookup_by_name() {
    let (engine, _factory) = engine(SHARED_READER).await;
    engine.start_workflow("wf").unwrap();
    engine.start_workflow("wf").unwrap();

    let err = engine.registry().thread_by_name(None, "s1").unwrap_err();
    assert!(matches!(err, EngineError::Ambiguous { count: 2, .. }));
    assert!(matches!(
        engine.registry().workflow_by_name("wf"),
        Err(EngineError::Ambiguous { .. })
    ));
    assert!(matches!(
        engine.registry().thread_by_name(None, "nobody"),
        Err(EngineError::NotFound { .. })
    ));
}

const SLOW: &str = r#"
[[locations]]
name = "h1"

[[equipment]]
name = "incubator"
driver = "mock.device"
options = { delay_ms = 100 }

[[pools]]
name = "incubators"
members = ["incubator"]

[[labware]]
name = "plate"
type = "96_well"

[[methods]]
name = "incubate"

[[methods.actions]]
name = "warm"
pool = "incubators"
command = "warm"

[[methods.actions]]
name = "hold"
pool = "incubators"
command = "hold"

[[workflows]]
name = "wf"

[[workflows.threads]]
name = "t1"
labware = "plate"
start = "h1"
methods = ["incubate"]
"#;

#[tokio::test]
async fn test_stop_settles_at_next_checkpoint() {
    let (engine, factory) = engine(SLOW).await;
    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.run_workflow("wf").await });

    let thread = loop {
        if let Ok(thread) = engine.registry().thread_by_name(None, "t1")
            && thread.status() == LabwareThreadStatus::PerformingAction
        {
            break thread;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    };
    engine.stop_thread(thread.id()).unwrap();

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.status, WorkflowStatus::Stopped);
    assert_eq!(thread.status(), LabwareThreadStatus::Stopped);
    assert!(thread.status().has_completed());

    // The in-flight command finished; the next one never started.
    let actions = thread.methods()[0].actions();
    assert_eq!(actions[0].status(), ActionStatus::Completed);
    assert_eq!(actions[1].status(), ActionStatus::Created);
    assert_eq!(factory.device("incubator").unwrap().calls(), vec!["execute:warm"]);
}

const OCCUPIED_NEST: &str = r#"
[[locations]]
name = "h2"

[[locations]]
name = "nest"
equipment = "reader"

[[equipment]]
name = "arm"
driver = "mock.arm"
options = { positions = ["h2", "nest"] }

[[equipment]]
name = "reader"
driver = "mock.device"
locations = ["nest"]
options = { fail_on = "explode" }

[[pools]]
name = "readers"
members = ["reader"]

[[labware]]
name = "plate"
type = "96_well"

[[methods]]
name = "explode"

[[methods.actions]]
name = "explode"
pool = "readers"
command = "explode"

[[methods]]
name = "read"

[[methods.actions]]
name = "read"
pool = "readers"
command = "read"

[[workflows]]
name = "wf"

[[workflows.threads]]
name = "stuck"
labware = "plate"
start = "nest"
methods = ["explode"]

[[workflows.threads]]
name = "waiting"
labware = "plate"
start = "h2"
methods = ["read"]

[[workflows.spawns]]
thread = "stuck"
method = "explode"
spawn = "waiting"
"#;

#[tokio::test]
async fn test_target_held_by_failed_thread_is_reported() {
    let (engine, _factory) = engine(OCCUPIED_NEST).await;
    let report = engine.run_workflow("wf").await.unwrap();

    assert_eq!(report.thread("stuck").unwrap().status, LabwareThreadStatus::Errored);
    let waiting = report.thread("waiting").unwrap();
    assert_eq!(waiting.status, LabwareThreadStatus::Errored);
    let thread = engine.registry().thread(waiting.id).unwrap();
    assert!(
        matches!(thread.error(), Some(EngineError::TargetOccupied { ref location, .. }) if location == "nest"),
        "{:?}",
        thread.error()
    );
    assert_eq!(waiting.position.as_deref(), Some("h2"));
}

#[tokio::test]
async fn test_unknown_workflow() {
    let (engine, _factory) = engine(PICK_PLACE).await;
    assert!(matches!(
        engine.run_workflow("nope").await,
        Err(EngineError::NotFound { .. })
    ));
}

const CRASHING_DEVICE: &str = r#"
[[locations]]
name = "nest"
equipment = "reader"

[[locations]]
name = "h2"

[[equipment]]
name = "reader"
driver = "mock.device"
locations = ["nest"]
options = { panic_on = "read" }

[[equipment]]
name = "sealer"
driver = "mock.device"

[[pools]]
name = "readers"
members = ["reader"]

[[pools]]
name = "sealers"
members = ["sealer"]

[[labware]]
name = "plate"
type = "96_well"

[[methods]]
name = "read"

[[methods.actions]]
name = "read"
pool = "readers"
command = "read"

[[methods]]
name = "seal"

[[methods.actions]]
name = "seal"
pool = "sealers"
command = "seal"

[[workflows]]
name = "wf"

[[workflows.threads]]
name = "crashing"
labware = "plate"
start = "nest"
methods = ["read"]

[[workflows.threads]]
name = "healthy"
labware = "plate"
start = "h2"
methods = ["seal"]
"#;

#[tokio::test]
async fn test_panicking_driver_errors_its_thread() {
    let (engine, _factory) = engine(CRASHING_DEVICE).await;
    let report = tokio::time::timeout(Duration::from_secs(5), engine.run_workflow("wf"))
        .await
        .expect("run finishes after a driver panic")
        .unwrap();

    assert_eq!(report.status, WorkflowStatus::Errored);
    let crashing = report.thread("crashing").unwrap();
    assert_eq!(crashing.status, LabwareThreadStatus::Errored);
    assert!(crashing.error.as_deref().unwrap().contains("panicked"));
    assert_eq!(
        report.thread("healthy").unwrap().status,
        LabwareThreadStatus::Completed
    );

    // Claims held when the task died are returned.
    assert!(engine.reservations().held_by(crashing.id).is_empty());
    assert_eq!(engine.reservations().holder("reader"), None);
    assert_eq!(engine.reservations().holder("nest"), None);
}

#[tokio::test]
async fn test_stop_before_start_passes_through_stopping() {
    let (engine, _factory) = engine(PICK_PLACE).await;
    let mut feed = engine.bus().feed();
    let workflow = engine.start_workflow("wf").unwrap();
    let thread = engine
        .registry()
        .threads_in(workflow.id())
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(thread.status(), LabwareThreadStatus::Created);

    engine.stop_thread(thread.id()).unwrap();
    assert_eq!(thread.status(), LabwareThreadStatus::Stopped);

    let prefix = format!("thread.{}.", thread.id());
    let mut names = Vec::new();
    while let Ok(event) = feed.try_recv() {
        if let Some(status) = event.name.strip_prefix(&prefix) {
            names.push(status.to_string());
        }
    }
    assert_eq!(names, vec!["CREATED", "STOPPING", "STOPPED"]);
}
