// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire codec for the checkpoint control channel.
//!
//! The channel carries fixed-width sync tokens: unsigned 64-bit big-endian
//! values with no framing around them. Once per checkpoint round the data
//! direction additionally carries the serialized device state as one 8-byte
//! length followed by exactly that many raw bytes. Both peers link against
//! the same token table; any other value on the wire is a fatal protocol
//! violation.
//!
//! The underlying socket is modeled as two half-handles over one byte
//! stream: [`ControlRead`] wraps the receive side and [`ControlWrite`] the
//! send side. Writes are flushed before returning so that no token can sit
//! in a buffer while the peer is already being waited on.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use slog::{error, Logger};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::vmstate::CheckpointBuffer;
use crate::ReplicationError;

/// Sync points exchanged between the primary and secondary checkpoint loops.
///
/// `Ready` is sent once per session by the secondary; the checkpoint tokens
/// cycle once per round; `GuestShutdown` may trail a round when the guest
/// asked to power off. The numeric assignments are contiguous after `Ready`
/// and form the shared wire enumeration.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u64)]
pub enum SyncToken {
    Ready = 0x46,
    CheckpointNew,
    CheckpointSuspended,
    CheckpointSend,
    CheckpointReceived,
    CheckpointLoaded,
    GuestShutdown,
}

/// The receive half of a checkpoint channel.
pub struct ControlRead<R> {
    inner: R,
    log: Logger,
}

impl<R: AsyncRead + Unpin + Send> ControlRead<R> {
    pub fn new(inner: R, log: Logger) -> Self {
        Self { inner, log }
    }

    /// Reads one raw 8-byte big-endian value.
    pub async fn get_value(&mut self) -> Result<u64, ReplicationError> {
        Ok(self.inner.read_u64().await?)
    }

    /// Reads one value and maps it through the token table.
    pub async fn get_token(&mut self) -> Result<SyncToken, ReplicationError> {
        let value = self.get_value().await?;
        SyncToken::try_from(value)
            .map_err(|_| ReplicationError::UnknownToken(value))
    }

    /// Reads one value and requires it to be `want`.
    ///
    /// A mismatch is an unrecoverable protocol violation: the transaction
    /// must be abandoned and the loop drained.
    pub async fn expect(
        &mut self,
        want: SyncToken,
    ) -> Result<(), ReplicationError> {
        let received = self.get_value().await?;
        if received != u64::from(want) {
            error!(
                self.log,
                "unexpected sync token: expected {want:?} ({:#x}), \
                 received {received:#x}",
                u64::from(want)
            );
            return Err(ReplicationError::UnexpectedToken {
                expected: want,
                received,
            });
        }
        Ok(())
    }

    /// Reads exactly `len` bytes of device state into `buf`.
    ///
    /// The buffer is reset first. A short stream is fatal; the read never
    /// consumes past `len`, so a token following the payload stays on the
    /// wire for the next `get_value`.
    pub async fn fill_buffer(
        &mut self,
        buf: &mut CheckpointBuffer,
        len: u64,
    ) -> Result<(), ReplicationError> {
        buf.reset();
        buf.resize_zeroed(len as usize);
        let dst = buf.as_mut_slice();
        let mut filled = 0;
        while filled < dst.len() {
            let n = self.inner.read(&mut dst[filled..]).await?;
            if n == 0 {
                return Err(ReplicationError::TruncatedState {
                    wanted: len,
                    got: filled as u64,
                });
            }
            filled += n;
        }
        Ok(())
    }
}

/// The send half of a checkpoint channel.
pub struct ControlWrite<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> ControlWrite<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one sync token and flushes it to the wire.
    pub async fn put(
        &mut self,
        token: SyncToken,
    ) -> Result<(), ReplicationError> {
        self.put_value(token.into()).await
    }

    /// Writes one raw 8-byte big-endian value and flushes it.
    pub async fn put_value(
        &mut self,
        value: u64,
    ) -> Result<(), ReplicationError> {
        self.inner.write_u64(value).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Writes the device-state payload: its length as one 8-byte value,
    /// then the raw bytes, flushing after each unit.
    pub async fn put_buffer(
        &mut self,
        buf: &CheckpointBuffer,
    ) -> Result<(), ReplicationError> {
        self.put_value(buf.len() as u64).await?;
        self.inner.write_all(buf.as_slice()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
