// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Failover arbitration and the session's process-wide latches.
//!
//! The arbiter owns the single-writer booleans that coordinate the
//! checkpoint worker, the event driver, and management:
//!
//! - `failover_requested`: latched once by whoever decides to abandon
//!   replication (management heartbeat loss, or the loop on any failure).
//!   The first latch schedules the deferred failover action; later calls
//!   are no-ops.
//! - `failover_completed`: set by the event driver when the failover action
//!   has run. Draining loops wait on it before releasing their resources.
//! - `vmstate_loading`: true only while the secondary holds the VM lock and
//!   feeds a checkpoint into the loader. The secondary failover action must
//!   observe it false before promoting the proxy.
//! - `shutdown_requested`: guest-initiated shutdown, consumed at the tail
//!   of the next successful checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use slog::{info, warn, Logger};
use tokio::sync::{mpsc, oneshot, watch};

use crate::driver::DeferredTask;

pub struct FailoverArbiter {
    requested: AtomicBool,
    shutdown_requested: AtomicBool,
    incoming_active: AtomicBool,
    completed_tx: watch::Sender<bool>,
    loading_tx: watch::Sender<bool>,
    tasks: mpsc::UnboundedSender<DeferredTask>,
    incoming_resume: Mutex<Option<oneshot::Sender<()>>>,
    log: Logger,
}

impl FailoverArbiter {
    pub(crate) fn new(
        tasks: mpsc::UnboundedSender<DeferredTask>,
        log: Logger,
    ) -> Self {
        Self {
            requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            incoming_active: AtomicBool::new(false),
            completed_tx: watch::channel(false).0,
            loading_tx: watch::channel(false).0,
            tasks,
            incoming_resume: Mutex::new(None),
            log,
        }
    }

    /// Latches the failover request and schedules the deferred failover
    /// action on the event driver. Idempotent: only the first caller
    /// schedules work.
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::AcqRel) {
            info!(self.log, "failover requested");
            let _ = self.tasks.send(DeferredTask::Failover);
        }
    }

    /// Management's heartbeat-loss entrypoint.
    pub fn lost_heartbeat(&self) {
        self.request();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Clears the request latch. Only the draining loop calls this, after
    /// it has observed `failover_completed`.
    pub fn clear(&self) {
        self.requested.store(false, Ordering::Release);
    }

    /// Marks the deferred failover action done and wakes any drainers.
    pub(crate) fn mark_completed(&self) {
        self.completed_tx.send_replace(true);
    }

    pub fn is_completed(&self) -> bool {
        *self.completed_tx.borrow()
    }

    /// Waits until the failover action has run.
    pub async fn await_completed(&self) {
        let mut rx = self.completed_tx.subscribe();
        while !*rx.borrow_and_update() {
            // The sender lives in self, so changed() cannot fail.
            rx.changed().await.unwrap();
        }
    }

    /// Brackets the secondary's loader call. Set only with the VM lock
    /// held.
    pub(crate) fn set_loading(&self, loading: bool) {
        self.loading_tx.send_replace(loading);
    }

    pub fn is_loading(&self) -> bool {
        *self.loading_tx.borrow()
    }

    /// Waits until no checkpoint is being fed into the loader.
    pub(crate) async fn wait_loading_idle(&self) {
        let mut rx = self.loading_tx.subscribe();
        while *rx.borrow_and_update() {
            rx.changed().await.unwrap();
        }
    }

    /// Latches a guest-initiated shutdown for the next checkpoint tail.
    pub fn latch_guest_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    pub(crate) fn clear_guest_shutdown(&self) {
        self.shutdown_requested.store(false, Ordering::Release);
    }

    /// Marks this process as the active incoming-checkpoint context, so
    /// outside code can tell a loading secondary from a primary.
    pub(crate) fn enter_incoming(&self) {
        self.incoming_active.store(true, Ordering::Release);
    }

    pub(crate) fn exit_incoming(&self) {
        self.incoming_active.store(false, Ordering::Release);
    }

    pub fn incoming_active(&self) -> bool {
        self.incoming_active.load(Ordering::Acquire)
    }

    /// Registers the continuation that stands in for the halted incoming
    /// migration. The secondary failover action fires it exactly once to
    /// bring the VM live as if migration had just completed.
    pub(crate) fn register_incoming_resume(&self, tx: oneshot::Sender<()>) {
        let prior = self.incoming_resume.lock().unwrap().replace(tx);
        if prior.is_some() {
            warn!(self.log, "replaced a stale incoming-resume continuation");
        }
    }

    /// Fires the incoming-resume continuation, if one is registered.
    pub(crate) fn resume_incoming(&self) {
        match self.incoming_resume.lock().unwrap().take() {
            Some(tx) => {
                if tx.send(()).is_err() {
                    warn!(
                        self.log,
                        "incoming-resume continuation was dropped \
                         before failover"
                    );
                }
            }
            None => {
                warn!(self.log, "no incoming-resume continuation registered")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arbiter(
    ) -> (FailoverArbiter, mpsc::UnboundedReceiver<DeferredTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Logger::root(slog::Discard, slog::o!());
        (FailoverArbiter::new(tx, log), rx)
    }

    #[tokio::test]
    async fn repeated_requests_schedule_one_action() {
        let (arbiter, mut rx) = test_arbiter();

        arbiter.request();
        arbiter.lost_heartbeat();
        arbiter.request();
        assert!(arbiter.is_requested());

        assert!(matches!(rx.try_recv(), Ok(DeferredTask::Failover)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn request_latches_again_after_clear() {
        let (arbiter, mut rx) = test_arbiter();

        arbiter.request();
        assert!(matches!(rx.try_recv(), Ok(DeferredTask::Failover)));

        arbiter.clear();
        arbiter.request();
        assert!(matches!(rx.try_recv(), Ok(DeferredTask::Failover)));
    }

    #[tokio::test]
    async fn await_completed_wakes_on_mark() {
        let (arbiter, _rx) = test_arbiter();
        let arbiter = std::sync::Arc::new(arbiter);

        let waiter = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move { arbiter.await_completed().await })
        };
        assert!(!waiter.is_finished());

        arbiter.mark_completed();
        waiter.await.unwrap();
        assert!(arbiter.is_completed());
    }

    #[tokio::test]
    async fn loading_wait_blocks_until_idle() {
        let (arbiter, _rx) = test_arbiter();
        let arbiter = std::sync::Arc::new(arbiter);

        arbiter.set_loading(true);
        let waiter = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move { arbiter.wait_loading_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        arbiter.set_loading(false);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_latch_is_consumed_explicitly() {
        let (arbiter, _rx) = test_arbiter();
        assert!(!arbiter.shutdown_requested());

        arbiter.latch_guest_shutdown();
        assert!(arbiter.shutdown_requested());

        arbiter.clear_guest_shutdown();
        assert!(!arbiter.shutdown_requested());
    }

    #[tokio::test]
    async fn incoming_resume_fires_once() {
        let (arbiter, _rx) = test_arbiter();
        let (tx, rx) = oneshot::channel();
        arbiter.register_incoming_resume(tx);

        arbiter.resume_incoming();
        rx.await.unwrap();

        // A second fire is a logged no-op.
        arbiter.resume_incoming();
    }
}
