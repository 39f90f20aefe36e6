use std::sync::atomic::{AtomicU64, Ordering};

static TXN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifies a node of the cluster. Node 0 coordinates queries.
pub type NodeId = u32;
/// Position of a column within a tuple or a table schema.
pub type ColId = usize;
/// Byte offset of a record within its partition file.
pub type Address = u64;

/// The node that receives final results.
pub const COORDINATOR: NodeId = 0;

/// Implementation of transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    /// Id of transaction.
    id: u64,
}

impl TransactionId {
    /// Creates a new transaction id.
    pub fn new() -> Self {
        Self {
            id: TXN_COUNTER.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Returns the transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        TransactionId::new()
    }
}
