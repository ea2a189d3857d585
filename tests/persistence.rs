// tests/persistence.rs

use std::path::Path;
use std::sync::Arc;

use labflow::connector::mock::MockConnector;
use labflow::connector::{ConnectorId, Connectors};
use labflow::errors::StoreError;
use labflow::{Launch, ResourceId, ResourceState, Scheduler, Store};
use labflow_test_utils::{FakeRunner, TestBed, init_tracing, test_options};

fn reopen(path: &Path, connector: &MockConnector) -> TestBed {
    init_tracing();
    let store = Store::open(path).expect("open store snapshot");
    TestBed::build(Arc::new(store), connector.clone(), FakeRunner::new())
}

fn used_tokens(bed: &TestBed, token: ResourceId) -> u32 {
    bed.scheduler
        .resource(token)
        .and_then(|r| r.as_token().map(|t| t.used()))
        .expect("token exists")
}

#[test]
fn running_job_is_recovered_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state/store.json");
    let connector = MockConnector::default();

    let (d, t, a, b) = {
        let bed = reopen(&path, &connector);
        let d = bed.pending_data("data/d");
        let t = bed.token("tokens/gpu", 2);
        let a = bed.job("jobs/a").after(d).submit();
        let b = bed.job("jobs/b").tokens(t, 1).submit();
        assert_eq!(bed.launch(), Launch::Started(b));
        (d, t, a, b)
    };
    assert!(path.exists());

    let bed = reopen(&path, &connector);
    assert_eq!(bed.state(a), ResourceState::Waiting);
    assert_eq!(bed.details(a).nb_unsatisfied, 1);
    assert_eq!(bed.state(b), ResourceState::Running);
    assert_eq!(bed.details(b).pid.as_deref(), Some("fake-1"));
    assert_eq!(used_tokens(&bed, t), 1);
    assert!(bed.scheduler.running_jobs().is_empty());

    // The process finished while no scheduler was watching.
    connector.add_file("jobs/b.code", "0\n");
    connector.add_file("jobs/b.done", "");
    connector.add_file("data/d.done", "");
    bed.scheduler.reconcile().unwrap();

    assert_eq!(bed.state(b), ResourceState::Done);
    assert_eq!(bed.details(b).exit_code, Some(0));
    assert_eq!(used_tokens(&bed, t), 0);
    assert!(connector.file("jobs/b.lock").is_none());
    assert_eq!(bed.state(d), ResourceState::Done);
    assert_eq!(bed.state(a), ResourceState::Ready);
}

#[test]
fn recorded_failure_code_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let connector = MockConnector::default();

    let a = {
        let bed = reopen(&path, &connector);
        let a = bed.job("jobs/a").submit();
        assert_eq!(bed.launch(), Launch::Started(a));
        a
    };

    let bed = reopen(&path, &connector);
    bed.scheduler.reconcile().unwrap();
    assert_eq!(bed.state(a), ResourceState::Running);

    connector.add_file("jobs/a.code", "137");
    bed.scheduler.reconcile().unwrap();
    assert_eq!(bed.state(a), ResourceState::Error);
    assert_eq!(bed.details(a).exit_code, Some(137));
}

#[test]
fn dependency_counts_match_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let connector = MockConnector::default();

    let (x, before) = {
        let bed = reopen(&path, &connector);
        let done = bed.data("data/done");
        let pending = bed.pending_data("data/pending");
        let locked = bed.data("data/locked");
        connector.add_file("data/locked.lock", "other");
        let x = bed
            .job("jobs/x")
            .after(done)
            .after(pending)
            .exclusive(locked)
            .submit();
        (x, bed.details(x))
    };
    assert_eq!((before.nb_unsatisfied, before.nb_holding), (2, 0));

    let bed = reopen(&path, &connector);
    let loaded = bed.details(x);
    assert_eq!(
        (loaded.nb_unsatisfied, loaded.nb_holding),
        (before.nb_unsatisfied, before.nb_holding)
    );

    bed.scheduler.reconcile().unwrap();
    let recounted = bed.details(x);
    assert_eq!(
        (recounted.nb_unsatisfied, recounted.nb_holding),
        (before.nb_unsatisfied, before.nb_holding)
    );
    assert_eq!(bed.state(x), ResourceState::Waiting);
}

#[test]
fn scheduler_open_reuses_the_snapshot() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let connector = MockConnector::default();
    let connectors = || Connectors::new().with(Arc::new(connector.clone()));

    let scheduler = Scheduler::open(&path, connectors(), Arc::new(FakeRunner::new()), test_options())
        .unwrap();
    let d = scheduler
        .submit(labflow::Resource::data(ConnectorId::local(), "data/d"), Vec::new())
        .unwrap();
    drop(scheduler);

    let scheduler = Scheduler::open(&path, connectors(), Arc::new(FakeRunner::new()), test_options())
        .unwrap();
    assert_eq!(
        scheduler.find(&ConnectorId::local(), Path::new("data/d")),
        Some(d)
    );
    assert_eq!(scheduler.store().snapshot_path(), Some(path.as_path()));
}

#[test]
fn corrupt_snapshot_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = Store::open(&path).unwrap_err();
    assert!(matches!(err, StoreError::Load { .. }));
    assert!(Store::in_memory().snapshot_path().is_none());
}
