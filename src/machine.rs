// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM-control seam and the global VM lock.
//!
//! All guest run-state and device mutation funnels through one mutex, the
//! async stand-in for the hypervisor's iothread lock. Checkpoint loops and
//! the event driver take the lock only for the short critical sections the
//! protocol prescribes and never hold it across channel I/O or sleeps.

use std::sync::Arc;

use tokio::sync::Mutex;

/// Guest run states this core cares about.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunState {
    /// The guest executes normally.
    Running,
    /// The guest is held stopped for a checkpoint or takeover.
    Lockstep,
}

/// Control surface the hypervisor exposes to the replication core.
///
/// Implementations are mutated only under the global VM lock (see
/// [`SharedMachine`]); they do not need interior synchronization of their
/// own.
pub trait MachineControl: Send + 'static {
    /// Resumes guest execution.
    fn start(&mut self);

    /// Stops the guest and parks it in `state`, regardless of what it was
    /// doing.
    fn stop_force(&mut self, state: RunState);

    fn is_running(&self) -> bool;

    fn in_state(&self, state: RunState) -> bool;

    /// Resets the platform without announcing it to management.
    fn reset_silent(&mut self);

    /// Asks the platform to begin an orderly process shutdown.
    fn request_shutdown(&mut self);

    /// Enables or disables device hotplug, returning the prior setting.
    fn set_hotplug_enabled(&mut self, enabled: bool) -> bool;

    /// Sets whether the machine starts running as soon as incoming
    /// migration completes, returning the prior setting.
    fn set_autostart(&mut self, autostart: bool) -> bool;
}

/// The global VM lock wrapped around the machine.
pub type SharedMachine<M> = Arc<Mutex<M>>;

/// Whether the guest is already held for a checkpoint: parked in the
/// lockstep run state or not running at all.
pub fn lockstep_stopped<M: MachineControl>(machine: &M) -> bool {
    machine.in_state(RunState::Lockstep) || !machine.is_running()
}
