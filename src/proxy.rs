// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Seam to the external network proxy.
//!
//! The proxy mirrors the primary's guest traffic to the secondary and
//! compares the two outbound streams; how it does so is its own affair.
//! This core only consults its verdicts and tells it when a checkpoint has
//! re-synchronized the guests.

use thiserror::Error;

use crate::Role;

/// Errors surfaced by the proxy.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProxyError {
    #[error("proxy initialization failed: {0}")]
    Init(String),

    #[error("packet comparison failed: {0}")]
    Compare(String),

    #[error("queue snapshot failed: {0}")]
    Checkpoint(String),

    #[error("failover promotion failed: {0}")]
    Failover(String),
}

/// Outcome of one comparison pass over the mirrored traffic.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrafficVerdict {
    /// Outbound packets from both guests still agree; no checkpoint needed.
    Consistent,
    /// The guests have visibly diverged; checkpoint as soon as permitted.
    Diverged,
}

/// The packet-mirroring proxy as seen by the checkpoint core.
pub trait PacketProxy: Send + Sync + 'static {
    fn init(&self, role: Role) -> Result<(), ProxyError>;

    fn destroy(&self, role: Role);

    /// Tells the proxy a checkpoint completed: it must snapshot its mirrored
    /// queues so comparison resumes from a clean baseline.
    fn checkpoint(&self) -> Result<(), ProxyError>;

    /// Compares the mirrored outbound streams.
    fn compare(&self) -> Result<TrafficVerdict, ProxyError>;

    /// Promotes the secondary's mirrored network state to authoritative
    /// during takeover.
    fn failover(&self) -> Result<(), ProxyError>;
}
