// src/scheduler/runner.rs

//! Background tasks spawned by [`Scheduler::start`].

use std::future;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{Launch, Scheduler};
use crate::resource::Message;

/// Start READY jobs one after the other; sleep when none is eligible.
///
/// A successful (or requeued) attempt loops straight back so the next
/// READY job is tried without waiting. The loop only ends on shutdown.
pub(super) async fn run_loop(scheduler: Scheduler, mut shutdown: watch::Receiver<bool>) {
    info!("runner loop started");
    let runners = scheduler.inner.store.runners();
    let poll = scheduler.inner.options.poll_interval;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match scheduler.launch_next() {
            Ok(Launch::Idle) => {}
            Ok(launch) => {
                debug!(?launch, "launch attempt");
                continue;
            }
            Err(e) => {
                error!(error = %e, "runner iteration failed");
            }
        }

        let retry_at = scheduler.inner.backoff().next_expiry();
        let backoff_expired = async {
            match retry_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            _ = runners.notified() => {}
            _ = backoff_expired => debug!("backoff expired"),
            _ = tokio::time::sleep(poll) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!("runner loop finished");
}

/// Feed messages from process monitors into the state machine.
pub(super) async fn pump_messages(
    scheduler: Scheduler,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = inbox.recv() => {
                let Some(message) = message else {
                    debug!("message channel closed");
                    break;
                };
                if let Err(e) = scheduler.notify(message) {
                    warn!(error = %e, "failed to handle message");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("message pump finished");
}

/// Periodically reconcile states with the on-disk markers.
pub(super) async fn reconcile_loop(scheduler: Scheduler, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(scheduler.inner.options.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = scheduler.reconcile() {
                    warn!(error = %e, "reconciliation failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("reconciliation loop finished");
}
