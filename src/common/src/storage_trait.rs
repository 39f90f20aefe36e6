use crate::ids::{Address, TransactionId};
use crate::Value;

/// Outcome codes of the index store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrCode {
    Success,
    DbDne,
    DbEnd,
    KeyNotFound,
    TxnDne,
    EntryExists,
    EntryDne,
    Failure,
}

/// An index entry: a key and the address of the record holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Value,
    pub address: Address,
}

/// Where the next `get_next` resumes.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexCursor {
    /// Nothing read yet in this transaction.
    Start,
    /// On the `pos`-th duplicate of `key`.
    At(Value, usize),
    /// Before the first key greater than this one.
    After(Value),
}

/// An opened index with its iteration state.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    pub name: String,
    pub cursor: IndexCursor,
    /// Transaction the cursor was positioned in.
    pub txn: Option<TransactionId>,
}

impl IndexHandle {
    pub fn new(name: &str) -> Self {
        IndexHandle {
            name: name.to_string(),
            cursor: IndexCursor::Start,
            txn: None,
        }
    }
}

/// The record index an executing node reads through.
pub trait IndexStore: Send + Sync {
    /// Opens the index registered under `name` (`table.field`).
    fn open_index(&self, name: &str) -> Result<IndexHandle, ErrCode>;

    fn close_index(&self, handle: IndexHandle) -> Result<(), ErrCode>;

    fn begin_transaction(&self) -> Result<TransactionId, ErrCode>;

    fn commit_transaction(&self, txn: TransactionId) -> Result<(), ErrCode>;

    /// Reverts every change made under `txn`.
    fn abort_transaction(&self, txn: TransactionId) -> Result<(), ErrCode>;

    /// Positions the cursor on the first record with `key`. When the key is missing, returns
    /// `KeyNotFound` and leaves the cursor before the next greater key.
    fn get(
        &self,
        handle: &mut IndexHandle,
        txn: TransactionId,
        key: &Value,
    ) -> Result<Record, ErrCode>;

    /// Next record in ascending key order, `DbEnd` past the last one. Starts from the first
    /// record when no `get` happened in `txn`.
    fn get_next(&self, handle: &mut IndexHandle, txn: TransactionId) -> Result<Record, ErrCode>;

    fn insert_record(
        &self,
        handle: &IndexHandle,
        txn: TransactionId,
        key: Value,
        address: Address,
    ) -> Result<(), ErrCode>;

    /// Removes one record. Without an address the first duplicate of `key` goes.
    fn delete_record(
        &self,
        handle: &IndexHandle,
        txn: TransactionId,
        key: &Value,
        address: Option<Address>,
    ) -> Result<(), ErrCode>;
}
