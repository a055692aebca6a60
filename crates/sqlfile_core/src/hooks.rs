//! Pre-update notification.

use crate::types::RowId;

/// Kind of row change about to happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreUpdateOp {
    /// A new row.
    Insert,
    /// An existing row gets a new payload.
    Update,
    /// A row goes away.
    Delete,
}

/// A row change about to be applied by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreUpdateEvent<'a> {
    /// Kind of change.
    pub op: PreUpdateOp,
    /// Affected row.
    pub rowid: RowId,
    /// Payload before the change, for updates and deletes.
    pub old: Option<&'a [u8]>,
    /// Payload after the change, for inserts and updates.
    pub new: Option<&'a [u8]>,
}

/// Callback run before each row change made through a connection.
///
/// The callback runs while the connection is locked and must not call back
/// into the same connection.
pub type PreUpdateHook = Box<dyn FnMut(&PreUpdateEvent<'_>) + Send>;
