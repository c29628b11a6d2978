// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The checkpoint buffer and the device-state engine seam.
//!
//! The buffer holds one checkpoint's worth of serialized device state. It is
//! owned by the checkpoint loop, reset at the start of every round, and
//! released when the loop drains. The engine trait is the hypervisor's
//! save/load machinery; its formats and internals are not this crate's
//! business.

use std::io;

use bytes::buf::Writer;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Base capacity reserved for the checkpoint buffer. Device state for a
/// typical guest fits here without reallocation; larger states grow the
/// buffer transparently.
pub const CHECKPOINT_BUFFER_BASE_SIZE: usize = 4 * 1024 * 1024;

/// Growable byte buffer holding one serialized checkpoint.
#[derive(Debug, Default)]
pub struct CheckpointBuffer {
    bytes: BytesMut,
}

impl CheckpointBuffer {
    /// Creates an empty buffer with no backing allocation.
    pub fn new() -> Self {
        Self { bytes: BytesMut::new() }
    }

    /// Reserves the base capacity ahead of the first round.
    pub fn reserve_base(&mut self) {
        self.bytes.reserve(CHECKPOINT_BUFFER_BASE_SIZE);
    }

    /// Drops the contents while keeping the allocation for the next round.
    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    /// Releases the backing allocation at loop teardown.
    pub fn release(&mut self) {
        self.bytes = BytesMut::new();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    /// Grows (or shrinks) the buffer to exactly `len` bytes.
    pub fn resize_zeroed(&mut self, len: usize) {
        self.bytes.resize(len, 0);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Opens a write view appending to the buffer. Dropping the view closes
    /// it; the accumulated bytes stay in the buffer.
    pub fn writer(&mut self) -> Writer<&mut BytesMut> {
        (&mut self.bytes).writer()
    }

    /// Opens a read view over the current contents.
    pub fn reader(&self) -> impl io::Read + '_ {
        (&self.bytes[..]).reader()
    }
}

/// Parameters handed to the engine for one state capture.
///
/// Checkpoints always ship device state only: storage is replicated by its
/// own machinery, so block migration and shared-storage assumptions are
/// forced off for every round.
#[derive(Clone, Copy, Debug, Default)]
pub struct SaveParams {
    pub block_migration: bool,
    pub shared_storage: bool,
}

/// Errors surfaced by the device-state engine.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DeviceStateError {
    /// The engine failed while capturing state on the primary.
    #[error("couldn't capture device state: {0}")]
    Export(String),

    /// The engine failed while applying state on the secondary.
    #[error("couldn't apply device state: {0}")]
    Import(String),

    /// The secondary's RAM cache could not be prepared.
    #[error("couldn't initialize RAM cache: {0}")]
    RamCache(String),
}

/// The hypervisor's VM-state serialization machinery.
///
/// `save_begin` streams the bulk of the state and runs outside the VM lock;
/// `save_complete` finishes the capture and must run with the VM lock held
/// and the guest stopped. `load` applies one complete checkpoint and is
/// atomic from this crate's point of view.
pub trait DeviceStateEngine: Send + Sync + 'static {
    fn save_begin(
        &self,
        w: &mut dyn io::Write,
        params: &SaveParams,
    ) -> Result<(), DeviceStateError>;

    fn save_complete(
        &self,
        w: &mut dyn io::Write,
    ) -> Result<(), DeviceStateError>;

    fn load(&self, r: &mut dyn io::Read) -> Result<(), DeviceStateError>;

    /// Prepares the secondary's RAM cache used for fast reloads.
    fn create_ram_cache(&self) -> Result<(), DeviceStateError>;

    /// Releases the RAM cache at secondary teardown.
    fn release_ram_cache(&self);
}
