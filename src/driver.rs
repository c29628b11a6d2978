// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The main event task and the management surface of a session.
//!
//! Deferred work raised by the checkpoint worker or by management (the
//! failover action, migration cleanup) runs here rather than on the worker,
//! so it can take the VM lock without re-entering a worker that may already
//! hold it. The driver task must be running before either checkpoint loop
//! starts; a draining loop blocks on the completion latch the driver sets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use slog::{error, info, o, warn, Logger};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::arbiter::FailoverArbiter;
use crate::machine::{self, MachineControl, RunState, SharedMachine};
use crate::proxy::PacketProxy;
use crate::status::{SessionState, SessionStatus};
use crate::vmstate::DeviceStateEngine;
use crate::{Config, Role};

/// Whether this build carries lock-stepping replication support.
pub fn supported() -> bool {
    true
}

/// What a process is currently doing for the replication pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// No replication session is active here.
    Unprotected,
    /// This process runs the primary checkpoint loop.
    Primary,
    /// This process receives checkpoints as the secondary.
    Secondary,
}

/// Work executed on the event task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeferredTask {
    /// Run the role-specific failover action and set the completion latch.
    Failover,
    /// Tear down the outer migration machinery's half of the session.
    Cleanup,
    /// Stop the event task. Sent by management once the loops are done.
    Retire,
}

/// Shared state bundle handed to the checkpoint loops and the event driver.
pub struct SessionCore<M, E, P> {
    pub(crate) role: Role,
    pub(crate) machine: SharedMachine<M>,
    pub(crate) engine: Arc<E>,
    pub(crate) proxy: Arc<P>,
    pub(crate) arbiter: Arc<FailoverArbiter>,
    pub(crate) status: Arc<SessionStatus>,
    pub(crate) period_ms: Arc<AtomicU64>,
    pub(crate) config: Config,
    pub(crate) log: Logger,
    tasks: mpsc::UnboundedSender<DeferredTask>,
}

impl<M, E, P> SessionCore<M, E, P>
where
    M: MachineControl,
    E: DeviceStateEngine,
    P: PacketProxy,
{
    /// Builds the shared core plus its event driver and management handle.
    ///
    /// The caller spawns [`EventDriver::run`] before starting a checkpoint
    /// loop for `role`.
    pub fn new(
        role: Role,
        machine: M,
        engine: E,
        proxy: P,
        config: Config,
        log: Logger,
    ) -> (Arc<Self>, EventDriver<M, E, P>, ReplicationHandle) {
        let session_id = Uuid::new_v4();
        let log = log.new(o!(
            "session_id" => session_id.to_string(),
            "role" => format!("{role:?}").to_lowercase()
        ));

        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let arbiter = Arc::new(FailoverArbiter::new(
            tasks_tx.clone(),
            log.new(o!("component" => "arbiter")),
        ));
        let core = Arc::new(Self {
            role,
            machine: Arc::new(tokio::sync::Mutex::new(machine)),
            engine: Arc::new(engine),
            proxy: Arc::new(proxy),
            arbiter,
            status: Arc::new(SessionStatus::default()),
            period_ms: Arc::new(AtomicU64::new(config.checkpoint_period_ms)),
            config,
            log,
            tasks: tasks_tx.clone(),
        });

        let driver = EventDriver { core: core.clone(), tasks_rx, cleanup: None };
        let handle = ReplicationHandle {
            arbiter: core.arbiter.clone(),
            status: core.status.clone(),
            period_ms: core.period_ms.clone(),
            tasks: tasks_tx,
        };
        (core, driver, handle)
    }

    pub fn machine(&self) -> &SharedMachine<M> {
        &self.machine
    }

    pub fn arbiter(&self) -> &Arc<FailoverArbiter> {
        &self.arbiter
    }

    pub fn status(&self) -> &Arc<SessionStatus> {
        &self.status
    }

    pub(crate) fn schedule(&self, task: DeferredTask) {
        // The driver may already be retired during teardown races; deferred
        // work is then moot.
        if self.tasks.send(task).is_err() {
            warn!(self.log, "event driver is gone; dropped {task:?}");
        }
    }
}

/// The event task. Owns the deferred-task queue for one session.
pub struct EventDriver<M, E, P> {
    core: Arc<SessionCore<M, E, P>>,
    tasks_rx: mpsc::UnboundedReceiver<DeferredTask>,
    cleanup: Option<Box<dyn FnMut() + Send + Sync>>,
}

impl<M, E, P> EventDriver<M, E, P>
where
    M: MachineControl,
    E: DeviceStateEngine,
    P: PacketProxy,
{
    /// Hooks the outer migration machinery's cleanup into
    /// [`DeferredTask::Cleanup`].
    pub fn on_cleanup(&mut self, cleanup: impl FnMut() + Send + Sync + 'static) {
        self.cleanup = Some(Box::new(cleanup));
    }

    /// Services deferred tasks until retired.
    pub async fn run(mut self) {
        info!(self.core.log, "event driver running");
        while let Some(task) = self.tasks_rx.recv().await {
            info!(self.core.log, "handling deferred task"; "task" => ?task);
            match task {
                DeferredTask::Failover => self.failover().await,
                DeferredTask::Cleanup => {
                    if let Some(cleanup) = self.cleanup.as_mut() {
                        cleanup();
                    }
                }
                DeferredTask::Retire => break,
            }
        }
        info!(self.core.log, "event driver exiting");
    }

    /// The role-specific failover action.
    ///
    /// Runs exactly once per session (the arbiter schedules it on the first
    /// request only). Ends by setting the completion latch the draining
    /// checkpoint loop waits on.
    async fn failover(&self) {
        let core = &self.core;

        // Whatever the guest was doing, hold it still for the transition.
        {
            let mut m = core.machine.lock().await;
            if !machine::lockstep_stopped(&*m) {
                m.stop_force(RunState::Lockstep);
            }
        }

        match core.role {
            Role::Primary => {
                core.proxy.destroy(Role::Primary);
                if core.status.current() != SessionState::Failed {
                    core.status.compare_and_set(
                        SessionState::Colo,
                        SessionState::Completed,
                    );
                }
                core.machine.lock().await.start();
            }
            Role::Secondary => {
                // The loader owns the VM image while vmstate_loading is
                // set; promoting the proxy out from under it would hand
                // the network a half-applied guest.
                core.arbiter.wait_loading_idle().await;
                if let Err(e) = core.proxy.failover() {
                    error!(core.log, "proxy failed to fail over: {e}");
                }
                core.proxy.destroy(Role::Secondary);
                {
                    let mut m = core.machine.lock().await;
                    if !m.set_autostart(true) {
                        warn!(
                            core.log,
                            "overriding paused-start request so \
                             takeover can bring the guest live"
                        );
                    }
                }
                core.arbiter.resume_incoming();
            }
        }

        info!(core.log, "failover action complete");
        core.arbiter.mark_completed();
    }
}

/// Cloneable management surface for one replication session.
#[derive(Clone)]
pub struct ReplicationHandle {
    arbiter: Arc<FailoverArbiter>,
    status: Arc<SessionStatus>,
    period_ms: Arc<AtomicU64>,
    tasks: mpsc::UnboundedSender<DeferredTask>,
}

impl ReplicationHandle {
    /// The peer's heartbeat is gone: abandon replication and take over.
    pub fn lost_heartbeat(&self) {
        self.arbiter.lost_heartbeat();
    }

    /// Adjusts the forced-checkpoint ceiling. No floor is applied here;
    /// the loop still enforces the minimum inter-checkpoint interval.
    pub fn set_checkpoint_period(&self, ms: u64) {
        self.period_ms.store(ms, Ordering::Release);
    }

    pub fn checkpoint_period(&self) -> u64 {
        self.period_ms.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        self.status.current()
    }

    pub fn in_lockstep(&self) -> bool {
        self.status.current() == SessionState::Colo
    }

    /// What this process is doing for the pair right now.
    pub fn mode(&self) -> Mode {
        if self.arbiter.incoming_active() {
            Mode::Secondary
        } else if self.in_lockstep() {
            Mode::Primary
        } else {
            Mode::Unprotected
        }
    }

    /// Records a guest-initiated shutdown for the next checkpoint tail.
    pub fn notify_guest_shutdown(&self) {
        self.arbiter.latch_guest_shutdown();
    }

    /// Outside verdict that replication failed. Returns whether this call
    /// performed the transition.
    pub fn mark_failed(&self) -> bool {
        self.status.compare_and_set(SessionState::Colo, SessionState::Failed)
    }

    /// Stops the event driver. Call once the checkpoint loops have
    /// returned; a retired driver can no longer complete a failover.
    pub fn retire(&self) {
        let _ = self.tasks.send(DeferredTask::Retire);
    }
}
