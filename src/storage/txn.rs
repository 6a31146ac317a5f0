//! Transaction kinds as seen by the storage core.

use serde::Serialize;

/// Which view of the storage a caller operates on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum TxnKind {
    /// Sees the last checkpoint only.
    ReadOnly,
    /// Sees its own uncommitted changes.
    Write,
    /// The checkpoint itself.
    Checkpoint,
    /// WAL replay at open.
    Recovery,
}

impl TxnKind {
    /// Returns true if the view includes changes made since the last
    /// checkpoint.
    pub fn sees_uncommitted(self) -> bool {
        !matches!(self, TxnKind::ReadOnly)
    }
}

/// A running transaction, reduced to what checkpoint gating needs.
#[derive(Clone, Debug)]
pub struct Transaction {
    kind: TxnKind,
    local_wal_bytes: u64,
}

impl Transaction {
    /// Starts a transaction of `kind`.
    pub fn new(kind: TxnKind) -> Self {
        Self {
            kind,
            local_wal_bytes: 0,
        }
    }

    /// Transaction kind.
    pub fn kind(&self) -> TxnKind {
        self.kind
    }

    /// Bytes of log records buffered locally and not yet in the WAL.
    pub fn local_wal_bytes(&self) -> u64 {
        self.local_wal_bytes
    }

    /// Accounts `bytes` more locally buffered log.
    pub fn add_local_wal_bytes(&mut self, bytes: u64) {
        self.local_wal_bytes += bytes;
    }
}
