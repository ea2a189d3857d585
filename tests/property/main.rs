// tests/property/main.rs

use std::collections::BTreeSet;

use labflow::commands::Commands;
use labflow::connector::ConnectorId;
use labflow::connector::mock::MockConnector;
use labflow::resource::{DependencyStatus, TokenCounter};
use labflow::{Dependency, DependencyKind, JobDetails, Resource, ResourceId, ResourceState};
use labflow_test_utils::{FakeRunner, TestBed, init_tracing};
use proptest::prelude::*;

fn status_strategy() -> impl Strategy<Value = DependencyStatus> {
    prop_oneof![
        Just(DependencyStatus::Ok),
        Just(DependencyStatus::OkLock),
        Just(DependencyStatus::Wait),
        Just(DependencyStatus::Hold),
        Just(DependencyStatus::Error),
    ]
}

fn state_strategy() -> impl Strategy<Value = ResourceState> {
    prop_oneof![
        Just(ResourceState::Waiting),
        Just(ResourceState::Ready),
        Just(ResourceState::Locking),
        Just(ResourceState::Running),
        Just(ResourceState::OnHold),
        Just(ResourceState::Error),
        Just(ResourceState::Done),
    ]
}

fn kind_strategy() -> impl Strategy<Value = DependencyKind> {
    prop_oneof![
        Just(DependencyKind::ReadWrite),
        Just(DependencyKind::Exclusive),
        (1u32..4).prop_map(|tokens| DependencyKind::CountToken { tokens }),
    ]
}

// Jobs only depend on jobs with a lower index, so the graph is acyclic.
fn dag_strategy(max_jobs: usize) -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
    (1..=max_jobs).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n).prop_map(
            |raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, deps)| {
                        if i == 0 {
                            BTreeSet::new()
                        } else {
                            deps.into_iter().map(|d| d % i).collect()
                        }
                    })
                    .collect()
            },
        )
    })
}

proptest! {
    #[test]
    fn counters_track_dependency_statuses(
        n in 1usize..6,
        updates in proptest::collection::vec((any::<usize>(), status_strategy()), 0..40),
    ) {
        let mut job = JobDetails::new(Commands::default());
        job.nb_unsatisfied = n as u32;
        let mut statuses: Vec<Option<DependencyStatus>> = vec![None; n];

        for (idx, to) in updates {
            let idx = idx % n;
            job.apply_transition(statuses[idx], to);
            statuses[idx] = Some(to);

            let resolved = statuses.iter().map(|s| s.unwrap_or(DependencyStatus::Wait));
            let unsatisfied = resolved.clone().filter(|s| !s.is_ok()).count() as u32;
            let holding = resolved.filter(|s| s.is_blocking()).count() as u32;
            prop_assert_eq!(job.nb_unsatisfied, unsatisfied);
            prop_assert_eq!(job.nb_holding, holding);
            prop_assert!(job.nb_holding <= job.nb_unsatisfied);
            prop_assert_eq!(job.derived_state() == ResourceState::Ready, job.nb_unsatisfied == 0);
        }
    }

    #[test]
    fn dependency_update_is_idempotent(
        kind in kind_strategy(),
        state in state_strategy(),
        locked in any::<bool>(),
    ) {
        let connector = MockConnector::default();
        let from = match kind {
            DependencyKind::CountToken { .. } => Resource::token(ConnectorId::local(), "tokens/t", 2),
            _ => Resource::data(ConnectorId::local(), "data/r"),
        }
        .with_state(state);
        if locked {
            connector.add_file(from.marker(labflow::connector::Marker::Lock), "other");
        }

        let mut dep = Dependency::new(ResourceId(1), ResourceId(2), kind);
        prop_assert!(dep.update(&from, &connector));
        let first = dep.status();
        prop_assert!(!dep.update(&from, &connector));
        prop_assert!(!dep.update(&from, &connector));
        prop_assert_eq!(dep.status(), first);
        prop_assert_eq!(first, Some(dep.accept(&from, &connector)));
    }

    #[test]
    fn tokens_never_exceed_their_limit(
        limit in 1u32..5,
        ops in proptest::collection::vec((any::<bool>(), 1u32..4), 0..50),
    ) {
        let token = ResourceId(1);
        let counter = TokenCounter::new(limit);
        let mut held: Vec<u32> = Vec::new();

        for (acquire, tokens) in ops {
            if acquire {
                let before = counter.usage().used;
                let result = counter.try_acquire(token, tokens);
                prop_assert_eq!(result.is_ok(), before + tokens <= limit);
                if result.is_ok() {
                    held.push(tokens);
                }
                if before == limit {
                    prop_assert!(counter.try_acquire(token, 1).is_err());
                }
            } else if let Some(tokens) = held.pop() {
                counter.release(token, tokens);
            }
            prop_assert!(counter.usage().used <= limit);
            prop_assert_eq!(counter.usage().used, held.iter().sum::<u32>());
        }
    }

    #[test]
    fn failures_hold_exactly_their_descendants(
        deps in dag_strategy(8),
        failing in proptest::collection::btree_set(0usize..8, 0..3),
    ) {
        init_tracing();
        let bed = TestBed::build(
            std::sync::Arc::new(labflow::Store::in_memory()),
            MockConnector::default(),
            FakeRunner::completing_with(0),
        );

        let mut ids = Vec::new();
        for (i, requirements) in deps.iter().enumerate() {
            let mut job = bed.job(&format!("jobs/j{i}"));
            for d in requirements {
                job = job.after(ids[*d]);
            }
            let id = job.submit();
            if failing.contains(&i) {
                bed.runner.fail_start(id);
            }
            ids.push(id);
        }

        bed.run_until_idle();

        let mut expected: Vec<ResourceState> = Vec::new();
        for (i, requirements) in deps.iter().enumerate() {
            let blocked = requirements.iter().any(|d| expected[*d] != ResourceState::Done);
            expected.push(if blocked {
                ResourceState::OnHold
            } else if failing.contains(&i) {
                ResourceState::Error
            } else {
                ResourceState::Done
            });
        }

        for (i, id) in ids.iter().enumerate() {
            prop_assert_eq!(bed.state(*id), expected[i], "job j{}", i);
            let details = bed.details(*id);
            prop_assert!(details.nb_holding <= details.nb_unsatisfied);
        }
    }
}
