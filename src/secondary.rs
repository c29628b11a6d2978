// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The secondary's checkpoint loop.
//!
//! The secondary registers itself as the active incoming context, reports
//! ready, and then serves one command at a time: a new-checkpoint token
//! starts a round (suspend, receive state, reset, load, resume), a guest
//! shutdown token ends the session. On failure the loop grants management a
//! short grace window to order a takeover; absent one it presumes the
//! primary alive and abandons, leaving process exit to the embedder.

use std::sync::Arc;
use std::time::Duration;

use slog::{debug, error, info, warn, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::sleep;

use crate::codec::{ControlRead, ControlWrite, SyncToken};
use crate::driver::SessionCore;
use crate::machine::{MachineControl, RunState};
use crate::proxy::PacketProxy;
use crate::vmstate::{CheckpointBuffer, DeviceStateEngine};
use crate::{ReplicationError, Role};

/// How the secondary loop ended. The embedder decides process fate:
/// `PrimaryAlive` conventionally exits with code 1, since the local VM is
/// stale and the primary still serves.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SecondaryExit {
    /// A takeover was ordered and completed; this VM now serves.
    FailedOver,
    /// The session died with no takeover ordered inside the grace window.
    PrimaryAlive,
    /// The primary forwarded a guest shutdown; the platform is going down.
    GuestShutdown,
}

/// The continuation standing in for the halted incoming migration.
///
/// Failover fires it exactly once; the embedder then runs its
/// post-migration resume path to bring the VM live.
pub struct IncomingResume(oneshot::Receiver<()>);

impl IncomingResume {
    /// Waits for failover to hand the VM over. Returns false if the session
    /// ended without one.
    pub async fn wait(self) -> bool {
        self.0.await.is_ok()
    }
}

/// Clean session endings surfaced out of the command pump.
enum SessionEnd {
    GuestShutdown,
}

/// What the next command on the channel asks of us.
enum Command {
    Checkpoint,
    Shutdown,
}

/// The secondary-side checkpoint worker for one session.
pub struct SecondaryLoop<M, E, P, R, W> {
    core: Arc<SessionCore<M, E, P>>,
    control: ControlRead<R>,
    reply: ControlWrite<W>,
    buffer: CheckpointBuffer,
    rounds: u64,
    hotplug_prior: Option<bool>,
    log: Logger,
}

impl<M, E, P, R, W> SecondaryLoop<M, E, P, R, W>
where
    M: MachineControl,
    E: DeviceStateEngine,
    P: PacketProxy,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps the two halves of the incoming channel: `reader` carries the
    /// primary's tokens and state, `writer` our acknowledgements. Also
    /// registers the incoming-resume continuation and returns it for the
    /// embedder to await.
    pub fn new(
        core: &Arc<SessionCore<M, E, P>>,
        reader: R,
        writer: W,
    ) -> (Self, IncomingResume) {
        let log = core.log.clone();
        let (resume_tx, resume_rx) = oneshot::channel();
        core.arbiter.register_incoming_resume(resume_tx);
        let secondary = Self {
            core: core.clone(),
            control: ControlRead::new(reader, log.clone()),
            reply: ControlWrite::new(writer),
            buffer: CheckpointBuffer::new(),
            rounds: 0,
            hotplug_prior: None,
            log,
        };
        (secondary, IncomingResume(resume_rx))
    }

    /// Serves checkpoints until the session ends, then cleans up.
    pub async fn run(mut self) -> SecondaryExit {
        {
            let mut machine = self.core.machine.lock().await;
            self.hotplug_prior = Some(machine.set_hotplug_enabled(false));
        }
        self.core.arbiter.enter_incoming();

        let exit = match self.session().await {
            Ok(SessionEnd::GuestShutdown) => {
                info!(self.log, "guest shutdown; leaving lock-step");
                SecondaryExit::GuestShutdown
            }
            Err(e) => {
                error!(self.log, "incoming checkpoint loop failed: {e}");
                self.settle_takeover().await
            }
        };

        self.buffer.release();
        self.core.engine.release_ram_cache();
        drop(self.control);
        drop(self.reply);
        self.core.arbiter.exit_incoming();
        if let Some(prior) = self.hotplug_prior.take() {
            self.core.machine.lock().await.set_hotplug_enabled(prior);
        }

        exit
    }

    async fn session(&mut self) -> Result<SessionEnd, ReplicationError> {
        self.core.proxy.init(Role::Secondary)?;
        debug!(self.log, "proxy initialized");

        // The RAM cache backs the reset-and-reload each round leans on.
        self.core.engine.create_ram_cache()?;
        self.buffer.reserve_base();

        self.reply.put(SyncToken::Ready).await?;

        self.core.machine.lock().await.start();
        debug!(self.log, "guest running; awaiting checkpoint commands");

        loop {
            match self.wait_handle_cmd().await? {
                Command::Shutdown => return Ok(SessionEnd::GuestShutdown),
                Command::Checkpoint => {}
            }
            if self.core.arbiter.is_requested() {
                return Err(ReplicationError::FailoverRequested);
            }
            self.round().await?;
        }
    }

    /// Blocks for the next command token between rounds.
    async fn wait_handle_cmd(&mut self) -> Result<Command, ReplicationError> {
        match self.control.get_token().await? {
            SyncToken::CheckpointNew => Ok(Command::Checkpoint),
            SyncToken::GuestShutdown => {
                info!(self.log, "primary forwarded a guest shutdown");
                self.core.machine.lock().await.request_shutdown();
                Ok(Command::Shutdown)
            }
            other => Err(ReplicationError::UnexpectedCommand(other)),
        }
    }

    /// One checkpoint transaction, secondary side.
    async fn round(&mut self) -> Result<(), ReplicationError> {
        let round = self.rounds;

        self.core
            .machine
            .lock()
            .await
            .stop_force(RunState::Lockstep);
        debug!(self.log, "guest suspended for checkpoint"; "round" => round);

        self.core.proxy.checkpoint()?;
        self.reply.put(SyncToken::CheckpointSuspended).await?;

        self.control.expect(SyncToken::CheckpointSend).await?;
        let size = self.control.get_value().await?;
        self.control.fill_buffer(&mut self.buffer, size).await?;
        self.reply.put(SyncToken::CheckpointReceived).await?;
        debug!(self.log, "received device state"; "bytes" => size);

        {
            let mut machine = self.core.machine.lock().await;
            machine.reset_silent();
            self.core.arbiter.set_loading(true);
            let loaded = self.core.engine.load(&mut self.buffer.reader());
            self.core.arbiter.set_loading(false);
            loaded?;
        }

        self.reply.put(SyncToken::CheckpointLoaded).await?;

        self.core.machine.lock().await.start();
        debug!(self.log, "guest resumed"; "round" => round);

        self.rounds += 1;
        Ok(())
    }

    /// Decides between takeover and abandonment after a failed session.
    async fn settle_takeover(&mut self) -> SecondaryExit {
        if !self.core.arbiter.is_requested() {
            // Management may still be deciding whether the primary is gone;
            // give it a moment before concluding it isn't.
            sleep(Duration::from_millis(self.core.config.takeover_grace_ms))
                .await;
        }

        if !self.core.arbiter.is_requested() {
            warn!(
                self.log,
                "no takeover ordered; presuming the primary alive"
            );
            self.core.proxy.destroy(Role::Secondary);
            return SecondaryExit::PrimaryAlive;
        }

        self.core.arbiter.await_completed().await;
        self.core.arbiter.clear();
        SecondaryExit::FailedOver
    }
}
