// tests/local_runner.rs

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use labflow::commands::{Command, Commands};
use labflow::connector::{Connector, ConnectorId, Connectors, LocalConnector};
use labflow::exec::LocalJobRunner;
use labflow::{JobDetails, Resource, ResourceId, ResourceState, Scheduler, Store};
use labflow_test_utils::{init_tracing, test_options, with_timeout};
use tempfile::TempDir;

use common::wait_for_state;

fn local_scheduler() -> (TempDir, Scheduler) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let connector: Arc<dyn Connector> =
        Arc::new(LocalConnector::new(ConnectorId::local(), dir.path()));
    let scheduler = Scheduler::new(
        Arc::new(Store::in_memory()),
        Connectors::new().with(connector),
        Arc::new(LocalJobRunner::default()),
        test_options(),
    )
    .unwrap();
    (dir, scheduler)
}

fn submit(scheduler: &Scheduler, path: &str, command: Command) -> ResourceId {
    let details = JobDetails::new(Commands::single(command));
    scheduler
        .submit(Resource::job(ConnectorId::local(), path, details), Vec::new())
        .unwrap()
}

fn read(dir: &Path, file: &str) -> String {
    fs::read_to_string(dir.join(file)).unwrap_or_default()
}

#[tokio::test]
async fn successful_job_leaves_its_markers() {
    let (dir, scheduler) = local_scheduler();
    let a = submit(&scheduler, "jobs/hello", Command::from_args(["echo", "hello world"]));
    scheduler.start().unwrap();

    with_timeout(wait_for_state(&scheduler, a, ResourceState::Done)).await;
    let root = dir.path();
    assert_eq!(read(root, "jobs/hello.out"), "hello world\n");
    assert_eq!(read(root, "jobs/hello.code").trim(), "0");
    assert!(root.join("jobs/hello.done").exists());
    assert!(root.join("jobs/hello.run").exists());
    assert!(!root.join("jobs/hello.lock").exists());

    let job = scheduler.resource(a).unwrap();
    assert_eq!(job.as_job().unwrap().exit_code, Some(0));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn failing_job_reports_its_code() {
    let (dir, scheduler) = local_scheduler();
    let a = submit(
        &scheduler,
        "jobs/broken",
        Command::from_args(["sh", "-c", "echo oops >&2; exit 3"]),
    );
    scheduler.start().unwrap();

    with_timeout(wait_for_state(&scheduler, a, ResourceState::Error)).await;
    let root = dir.path();
    assert_eq!(read(root, "jobs/broken.err"), "oops\n");
    assert_eq!(read(root, "jobs/broken.code").trim(), "3");
    assert!(!root.join("jobs/broken.done").exists());
    assert_eq!(scheduler.resource(a).unwrap().as_job().unwrap().exit_code, Some(3));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn pipes_and_parameter_files_reach_the_command() {
    let (dir, scheduler) = local_scheduler();
    let piped = submit(
        &scheduler,
        "jobs/piped",
        Command::from_args(["cat"]).pipe(Command::from_args(["echo", "through a pipe"])),
    );
    let params = submit(
        &scheduler,
        "jobs/params",
        Command::from_args(["cat"]).parameter_file("cfg", "lr=0.1"),
    );
    scheduler.start().unwrap();

    with_timeout(async {
        wait_for_state(&scheduler, piped, ResourceState::Done).await;
        wait_for_state(&scheduler, params, ResourceState::Done).await;
    })
    .await;
    let root = dir.path();
    assert_eq!(read(root, "jobs/piped.out"), "through a pipe\n");
    assert!(!root.join("jobs/piped.pipe-0001.fifo").exists());
    assert_eq!(read(root, "jobs/params.out"), "lr=0.1");
    scheduler.shutdown().await;
}

#[tokio::test]
async fn stopping_kills_the_process() {
    let (_dir, scheduler) = local_scheduler();
    let a = submit(&scheduler, "jobs/sleepy", Command::from_args(["sleep", "30"]));
    scheduler.start().unwrap();

    with_timeout(wait_for_state(&scheduler, a, ResourceState::Running)).await;
    assert!(scheduler.stop(a).unwrap());
    assert_eq!(scheduler.state(a), Some(ResourceState::Error));

    with_timeout(async {
        while scheduler.resource(a).and_then(|r| r.as_job().and_then(|j| j.exit_code)).is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(scheduler.running_jobs().is_empty());
    scheduler.shutdown().await;
}
