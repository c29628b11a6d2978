// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The primary's checkpoint loop.
//!
//! After the secondary reports ready, the loop runs the guest and watches
//! the packet proxy. A divergence verdict (or the forced-checkpoint timer)
//! drives one checkpoint transaction: suspend the guest, capture its device
//! state, ship it, and wait for the secondary to confirm the load. Any
//! failure (channel, serializer, proxy, or a failover request landing at a
//! safe point) funnels into one drain path that raises failover and waits
//! for the deferred action to finish before releasing resources.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, error, info, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, Instant};

use crate::codec::{ControlRead, ControlWrite, SyncToken};
use crate::driver::{DeferredTask, SessionCore};
use crate::machine::{MachineControl, RunState};
use crate::proxy::{PacketProxy, TrafficVerdict};
use crate::status::SessionState;
use crate::vmstate::{CheckpointBuffer, DeviceStateEngine, SaveParams};
use crate::{ReplicationError, Role};

/// Checkpoints stop the guest; back-to-back rounds would turn that into a
/// continuous stall. No two checkpoints begin closer together than this.
pub const CHECKPOINT_MIN_PERIOD_MS: u64 = 100;

/// How often the loop re-polls the proxy while no checkpoint is due.
const TRIGGER_POLL_MS: u64 = 100;

/// The primary-side checkpoint worker for one session.
pub struct PrimaryLoop<M, E, P, R, W> {
    core: Arc<SessionCore<M, E, P>>,
    control: ControlRead<R>,
    data: ControlWrite<W>,
    buffer: CheckpointBuffer,
    checkpoint_time: Instant,
    rounds: u64,
    hotplug_prior: Option<bool>,
    log: Logger,
}

impl<M, E, P, R, W> PrimaryLoop<M, E, P, R, W>
where
    M: MachineControl,
    E: DeviceStateEngine,
    P: PacketProxy,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps the two halves of the checkpoint channel: `reader` carries the
    /// secondary's acknowledgements, `writer` our tokens and state.
    pub fn new(core: &Arc<SessionCore<M, E, P>>, reader: R, writer: W) -> Self {
        let log = core.log.clone();
        Self {
            core: core.clone(),
            control: ControlRead::new(reader, log.clone()),
            data: ControlWrite::new(writer),
            buffer: CheckpointBuffer::new(),
            checkpoint_time: Instant::now(),
            rounds: 0,
            hotplug_prior: None,
            log,
        }
    }

    /// Runs checkpoints until replication ends, then drains. The returned
    /// error is the cause of the drain, if any; the drain itself always
    /// completes.
    pub async fn run(mut self) -> Result<(), ReplicationError> {
        let result = self.session().await;
        match &result {
            Ok(()) => info!(self.log, "checkpoint loop left lock-step"),
            Err(e) => error!(self.log, "checkpoint loop failed: {e}"),
        }
        self.drain().await;
        result
    }

    async fn session(&mut self) -> Result<(), ReplicationError> {
        self.core.proxy.init(Role::Primary)?;
        debug!(self.log, "proxy initialized");

        {
            let mut machine = self.core.machine.lock().await;
            self.hotplug_prior = Some(machine.set_hotplug_enabled(false));
        }

        // The secondary announces itself once it has loaded the initial
        // state and stands ready to take checkpoints.
        self.control.expect(SyncToken::Ready).await?;
        info!(self.log, "secondary is ready");

        if !self
            .core
            .status
            .compare_and_set(SessionState::Active, SessionState::Colo)
        {
            return Err(ReplicationError::StartupRace {
                expected: SessionState::Active,
                found: self.core.status.current(),
            });
        }

        self.buffer.reserve_base();

        self.core.machine.lock().await.start();
        debug!(self.log, "guest running in lock-step");
        self.checkpoint_time = Instant::now();

        while self.core.status.current() == SessionState::Colo {
            if self.core.arbiter.is_requested() {
                return Err(ReplicationError::FailoverRequested);
            }

            match self.core.proxy.compare()? {
                TrafficVerdict::Diverged => {
                    let floor =
                        Duration::from_millis(CHECKPOINT_MIN_PERIOD_MS);
                    let elapsed = self.checkpoint_time.elapsed();
                    if elapsed < floor {
                        sleep(floor - elapsed).await;
                    }
                    debug!(self.log, "outbound traffic diverged");
                }
                TrafficVerdict::Consistent => {
                    let period = Duration::from_millis(
                        self.core
                            .period_ms
                            .load(Ordering::Acquire)
                            .max(CHECKPOINT_MIN_PERIOD_MS),
                    );
                    if self.checkpoint_time.elapsed() < period {
                        sleep(Duration::from_millis(TRIGGER_POLL_MS)).await;
                        continue;
                    }
                    debug!(self.log, "forcing time-based checkpoint");
                }
            }

            self.checkpoint().await?;
            self.checkpoint_time = Instant::now();
        }

        Ok(())
    }

    /// One checkpoint transaction, primary side.
    async fn checkpoint(&mut self) -> Result<(), ReplicationError> {
        let round = self.rounds;
        debug!(self.log, "starting checkpoint"; "round" => round);

        self.data.put(SyncToken::CheckpointNew).await?;
        self.control.expect(SyncToken::CheckpointSuspended).await?;

        self.buffer.reset();

        if self.core.arbiter.is_requested() {
            return Err(ReplicationError::FailoverRequested);
        }

        self.core
            .machine
            .lock()
            .await
            .stop_force(RunState::Lockstep);
        debug!(self.log, "guest stopped for checkpoint"; "round" => round);

        // The deferred failover action can fire between our stop and here;
        // re-check so we never ship state the takeover already owns.
        if self.core.arbiter.is_requested() {
            return Err(ReplicationError::FailoverRequested);
        }

        // Checkpoints carry device state only; block migration and
        // shared-storage shortcuts stay off every round.
        let params = SaveParams::default();
        self.core.engine.save_begin(&mut self.buffer.writer(), &params)?;
        {
            let _machine = self.core.machine.lock().await;
            self.core.engine.save_complete(&mut self.buffer.writer())?;
        }

        // Comparison restarts from a clean baseline once both sides are
        // state-equivalent again.
        self.core.proxy.checkpoint()?;

        self.data.put(SyncToken::CheckpointSend).await?;
        self.data.put_buffer(&self.buffer).await?;

        self.control.expect(SyncToken::CheckpointReceived).await?;
        self.control.expect(SyncToken::CheckpointLoaded).await?;

        if self.core.arbiter.shutdown_requested() {
            info!(self.log, "forwarding guest shutdown to the secondary");
            self.data.put(SyncToken::GuestShutdown).await?;
            self.core.machine.lock().await.request_shutdown();
            self.core.arbiter.clear_guest_shutdown();
        }

        self.core.machine.lock().await.start();
        debug!(
            self.log,
            "guest resumed";
            "round" => round,
            "state_bytes" => self.buffer.len()
        );

        self.rounds += 1;
        Ok(())
    }

    /// The single exit path: raise failover if nobody has, wait for the
    /// deferred action, then release everything exactly once.
    async fn drain(mut self) {
        {
            let _machine = self.core.machine.lock().await;
            if !self.core.arbiter.is_requested() {
                info!(self.log, "taking over from the checkpoint channel");
                self.core.arbiter.request();
            }
        }

        self.core.arbiter.await_completed().await;
        self.core.arbiter.clear();

        self.buffer.release();
        drop(self.control);
        drop(self.data);

        self.core.schedule(DeferredTask::Cleanup);

        if let Some(prior) = self.hotplug_prior.take() {
            self.core.machine.lock().await.set_hotplug_enabled(prior);
        }
    }
}
