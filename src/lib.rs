// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coarse-grain lock-stepping (COLO) replication for non-stop VM service.
//!
//! A primary VM runs the real workload while a secondary VM shadows it. At
//! every checkpoint the primary captures its full device state and ships it
//! to the secondary, which loads it so that both machines are externally
//! indistinguishable. Between checkpoints an external network proxy mirrors
//! and compares the guests' outbound traffic; divergence forces an early
//! checkpoint. Should the primary die, the secondary takes over with no loss
//! of externally visible state.
//!
//! One checkpoint round is five one-way sync points over a shared byte
//! stream:
//!
//! ```text
//!                  Primary                 Secondary
//!  NEW             @
//!                                          suspend guest
//!  SUSPENDED                               @
//!                  suspend & save state
//!  SEND            @
//!                  send state              receive state
//!  RECEIVED                                @
//!                                          reset & load state
//!  LOADED                                  @
//!                  resume                  resume
//! ```
//!
//! `@` marks the sender of each token. Every sync point is a single
//! one-directional handshake: the receiver knows the named event has
//! completed, and either side may move on before the peer finishes its next
//! local step.
//!
//! The crate provides the checkpoint loops for both roles ([`primary`],
//! [`secondary`]), the wire codec for the sync tokens ([`codec`]), the
//! failover arbiter and its process-wide latches ([`arbiter`]), and the main
//! event task that executes deferred failover and cleanup work ([`driver`]).
//! The hypervisor proper is reached exclusively through the collaborator
//! traits in [`machine`], [`vmstate`], and [`proxy`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod arbiter;
pub mod codec;
pub mod config;
pub mod driver;
pub mod machine;
pub mod primary;
pub mod proxy;
pub mod secondary;
pub mod status;
pub mod vmstate;

pub use config::Config;
pub use driver::{EventDriver, ReplicationHandle, SessionCore};

use codec::SyncToken;
use status::SessionState;

/// The fixed role a replication peer plays for the lifetime of its loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Secondary,
}

/// Errors which may abort a checkpoint round or the loop around it.
///
/// Inside a round any of these aborts the transaction immediately; the loop
/// then raises failover (if nobody else has) and drains before returning.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The control or data channel failed under us.
    #[error("channel I/O error: {0}")]
    Channel(#[from] std::io::Error),

    /// The peer sent a well-formed token we were not expecting.
    #[error("unexpected sync token: expected {expected:?}, received {received:#x}")]
    UnexpectedToken { expected: SyncToken, received: u64 },

    /// The peer sent a value outside the shared token table.
    #[error("unknown sync token {0:#x}")]
    UnknownToken(u64),

    /// A known token arrived where only a command may appear.
    #[error("sync token {0:?} is not valid between checkpoint rounds")]
    UnexpectedCommand(SyncToken),

    /// The device-state transfer ended before the advertised length.
    #[error("device state transfer truncated: wanted {wanted} bytes, got {got}")]
    TruncatedState { wanted: u64, got: u64 },

    /// The device-state engine failed to capture or apply a checkpoint.
    #[error("device state error: {0}")]
    DeviceState(#[from] vmstate::DeviceStateError),

    /// The network proxy failed.
    #[error("packet proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    /// A failover request interrupted the round at one of its safe points.
    #[error("failover requested during checkpoint")]
    FailoverRequested,

    /// The session status moved underneath us during startup.
    #[error("session state changed during startup: expected {expected:?}, found {found:?}")]
    StartupRace { expected: SessionState, found: SessionState },
}
