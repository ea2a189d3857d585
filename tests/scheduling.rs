// tests/scheduling.rs

mod common;

use chrono::{TimeDelta, Utc};
use labflow::{Launch, ResourceState};
use labflow_test_utils::{TestBed, init_tracing, with_timeout};

use common::{bed, wait_for_state};

#[test]
fn highest_priority_starts_first() {
    let bed = bed();
    let low = bed.job("jobs/low").priority(1).submit();
    let high = bed.job("jobs/high").priority(5).submit();
    let mid = bed.job("jobs/mid").priority(3).submit();

    assert_eq!(bed.launch(), Launch::Started(high));
    assert_eq!(bed.launch(), Launch::Started(mid));
    assert_eq!(bed.launch(), Launch::Started(low));
    assert_eq!(bed.launch(), Launch::Idle);
}

#[test]
fn equal_priorities_run_oldest_first() {
    let bed = bed();
    let now = Utc::now();
    let newer = bed.job("jobs/newer").submitted_at(now).submit();
    let older = bed
        .job("jobs/older")
        .submitted_at(now - TimeDelta::minutes(1))
        .submit();
    let tie = bed.job("jobs/tie").submitted_at(now).submit();

    assert!(bed.runner.started().is_empty());
    assert_eq!(bed.launch(), Launch::Started(older));
    assert_eq!(bed.launch(), Launch::Started(newer));
    assert_eq!(bed.launch(), Launch::Started(tie));
}

#[test]
fn chain_runs_in_dependency_order() {
    init_tracing();
    let bed = TestBed::completing_with(0);
    let a = bed.job("jobs/a").submit();
    let b = bed.job("jobs/b").after(a).submit();
    let c = bed.job("jobs/c").after(b).priority(100).submit();

    let launches = bed.run_until_idle();
    assert_eq!(
        launches,
        vec![Launch::Started(a), Launch::Started(b), Launch::Started(c)]
    );
    for id in [a, b, c] {
        assert_eq!(bed.state(id), ResourceState::Done);
    }
}

#[test]
fn failing_chain_stops_at_the_failure() {
    init_tracing();
    let bed = TestBed::completing_with(1);
    let a = bed.job("jobs/a").submit();
    let b = bed.job("jobs/b").after(a).submit();

    assert_eq!(bed.run_until_idle(), vec![Launch::Started(a)]);
    assert_eq!(bed.state(a), ResourceState::Error);
    assert_eq!(bed.state(b), ResourceState::OnHold);
}

#[tokio::test]
async fn background_tasks_drive_jobs_to_completion() {
    init_tracing();
    let bed = TestBed::completing_with(0);
    bed.scheduler.start().unwrap();
    assert!(bed.scheduler.start().is_err());

    let t = bed.token("tokens/slot", 1);
    let a = bed.job("jobs/a").tokens(t, 1).submit();
    let b = bed.job("jobs/b").tokens(t, 1).submit();
    let c = bed.job("jobs/c").after(a).after(b).submit();
    bed.scheduler.notify_runners();

    with_timeout(wait_for_state(&bed.scheduler, c, ResourceState::Done)).await;
    assert_eq!(bed.state(a), ResourceState::Done);
    assert_eq!(bed.state(b), ResourceState::Done);
    assert!(bed.scheduler.is_idle());

    bed.scheduler.shutdown().await;
    assert!(bed.scheduler.is_stopping());
}
