// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Externally visible status of a replication session.
//!
//! The status cell is shared with the surrounding migration machinery and
//! is only ever moved by compare-and-set, never by blind assignment, so a
//! transition raced from two sides resolves to exactly one winner.
//!
//! ```text
//! Active --(ready handshake)--> Colo --(normal end)----------> Completed
//!                                |  `-(loop error, failover)--> Completed
//!                                `--(external decision)-------> Failed
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Session states relevant to the checkpoint core.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum SessionState {
    /// The outer migration is still streaming initial state.
    Active,
    /// Both sides are lock-stepping through checkpoints.
    Colo,
    /// Replication ended; one side (possibly both) runs standalone.
    Completed,
    /// Replication was marked failed from outside.
    Failed,
}

/// Atomic holder for a [`SessionState`].
#[derive(Debug)]
pub struct SessionStatus(AtomicU8);

impl SessionStatus {
    pub fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state.into()))
    }

    pub fn current(&self) -> SessionState {
        // The cell only ever holds values stored from a SessionState.
        SessionState::try_from(self.0.load(Ordering::Acquire)).unwrap()
    }

    /// Moves `from → to` if the cell still holds `from`. Returns whether
    /// this call performed the transition.
    pub fn compare_and_set(
        &self,
        from: SessionState,
        to: SessionState,
    ) -> bool {
        self.0
            .compare_exchange(
                from.into(),
                to.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new(SessionState::Active)
    }
}
