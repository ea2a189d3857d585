#![allow(dead_code)]

use std::time::Duration;

use labflow::{ResourceId, ResourceState, Scheduler};
use labflow_test_utils::{TestBed, init_tracing};

pub fn bed() -> TestBed {
    init_tracing();
    TestBed::new()
}

/// Put the `.done` marker of `path` in place, as a finished producer would.
pub fn mark_done(bed: &TestBed, path: &str) {
    bed.connector.add_file(format!("{path}.done"), "");
}

/// Poll until `id` reaches `state`. For tests that run the background tasks.
pub async fn wait_for_state(scheduler: &Scheduler, id: ResourceId, state: ResourceState) {
    loop {
        if scheduler.state(id) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
