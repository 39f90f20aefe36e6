use common::ids::{Address, TransactionId};
use common::storage_trait::{ErrCode, IndexCursor, IndexHandle, IndexStore, Record};
use common::table::Table;
use common::{DbError, Value};
use parking_lot::{Mutex, RwLock};

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::fs::File;
use std::ops::Bound::{Excluded, Unbounded};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An index: every key with the addresses of its records, duplicates in insertion order.
type IndexMap = Arc<RwLock<BTreeMap<Value, Vec<Address>>>>;

/// On-disk form of the indexes.
type Persisted = Vec<(String, Vec<(Value, Vec<Address>)>)>;

const PERSIST_FILE: &str = "indexes.cbor";

/// Changes to revert when a transaction aborts.
enum Undo {
    Inserted {
        index: String,
        key: Value,
        address: Address,
    },
    Deleted {
        index: String,
        key: Value,
        address: Address,
        pos: usize,
    },
}

/// The MemStore StorageManager. A map of in-memory ordered indexes, the undo log of each
/// running transaction, and where to persist on shutdown/startup.
pub struct StorageManager {
    indexes: Arc<RwLock<HashMap<String, IndexMap>>>,
    active: Mutex<HashMap<TransactionId, Vec<Undo>>>,
    persist_path: PathBuf,
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        info!("Dropping Storage Manager");
    }
}

impl StorageManager {
    /// Create a new SM from scratch or load indexes persisted at `storage_path`.
    pub fn new(storage_path: String) -> Self {
        let sm = StorageManager {
            indexes: Arc::new(RwLock::new(HashMap::new())),
            active: Mutex::new(HashMap::new()),
            persist_path: PathBuf::from(&storage_path),
        };
        if !storage_path.is_empty() && sm.persist_path.join(PERSIST_FILE).exists() {
            info!(
                "Initializing memstore::storage_manager from path: {:?}",
                &storage_path
            );
            if let Err(e) = sm.load() {
                error!("memstore::load failed, starting empty: {}", e);
            }
        } else {
            info!(
                "Creating new memstore::storage_manager with path: {:?}",
                &storage_path
            );
        }
        sm
    }

    /// Create a new SM that will not be persisted
    pub fn new_test_sm() -> Self {
        StorageManager::new(String::from(""))
    }

    /// Registers an empty index. Existing indexes are left alone.
    pub fn create_index(&self, name: &str) {
        let mut indexes = self.indexes.write();
        if indexes.contains_key(name) {
            debug!("memstore::create_index {:?} already exists", name);
            return;
        }
        debug!("memstore::create_index {:?}", name);
        indexes.insert(name.to_string(), Arc::new(RwLock::new(BTreeMap::new())));
    }

    /// Whether an index is registered under `name`.
    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.read().contains_key(name)
    }

    /// Indexes every indexed field of a partition file. Addresses are the byte offsets of the
    /// lines. Returns the number of records read.
    ///
    /// # Arguments
    ///
    /// * `table` - Table the partition belongs to.
    /// * `path` - Flat file of the partition.
    pub fn load_partition(&self, table: &Table, path: &Path) -> Result<usize, DbError> {
        debug!("memstore::load_partition {:?} from {:?}", table.name, path);
        let file = File::open(path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(b'|')
            .quoting(false)
            .flexible(true)
            .from_reader(file);

        let mut targets = Vec::new();
        for (i, attr) in table.schema.attributes().enumerate() {
            if attr.is_indexed() {
                let name = table.index_name(attr.name());
                self.create_index(&name);
                targets.push((i, attr.dtype, self.index(&name)?));
            }
        }

        let mut count = 0;
        let mut record = csv::ByteRecord::new();
        loop {
            match rdr.read_byte_record(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return Err(DbError::IOError(e.to_string())),
            }
            let address = record.position().map(|p| p.byte()).unwrap_or(0);
            for (i, dtype, index) in &targets {
                let col = record.get(*i).ok_or_else(|| {
                    DbError::ValidationError(format!("Record at {} is missing field {}", address, i))
                })?;
                let key = Value::from_column(col, *dtype)?;
                index.write().entry(key).or_default().push(address);
            }
            count += 1;
        }
        info!(
            "memstore::load_partition indexed {} records of {:?}",
            count, table.name
        );
        Ok(count)
    }

    /// Persists every index if a path was given.
    pub fn shutdown(&self) -> Result<(), DbError> {
        if self.persist_path.as_os_str().is_empty() {
            return Ok(());
        }
        info!("Shutting down memstore, persisting to {:?}", self.persist_path);
        fs::create_dir_all(&self.persist_path)?;
        let indexes = self.indexes.read();
        let mut out: Persisted = Vec::new();
        for (name, index) in indexes.iter() {
            let entries = index
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            out.push((name.clone(), entries));
        }
        let file = File::create(self.persist_path.join(PERSIST_FILE))?;
        serde_cbor::to_writer(file, &out)?;
        Ok(())
    }

    fn load(&self) -> Result<(), DbError> {
        let file = File::open(self.persist_path.join(PERSIST_FILE))?;
        let persisted: Persisted = serde_cbor::from_reader(file)?;
        let mut indexes = self.indexes.write();
        for (name, entries) in persisted {
            let map: BTreeMap<Value, Vec<Address>> = entries.into_iter().collect();
            indexes.insert(name, Arc::new(RwLock::new(map)));
        }
        Ok(())
    }

    fn index(&self, name: &str) -> Result<IndexMap, ErrCode> {
        self.indexes.read().get(name).cloned().ok_or(ErrCode::DbDne)
    }

    fn check_txn(&self, txn: TransactionId) -> Result<(), ErrCode> {
        if self.active.lock().contains_key(&txn) {
            Ok(())
        } else {
            Err(ErrCode::TxnDne)
        }
    }

    fn log_undo(&self, txn: TransactionId, undo: Undo) -> Result<(), ErrCode> {
        match self.active.lock().get_mut(&txn) {
            Some(log) => {
                log.push(undo);
                Ok(())
            }
            None => Err(ErrCode::TxnDne),
        }
    }

    /// First record strictly after `key`.
    fn first_after(map: &BTreeMap<Value, Vec<Address>>, key: &Value) -> Option<(Value, Address)> {
        map.range((Excluded(key), Unbounded))
            .find(|(_, addrs)| !addrs.is_empty())
            .map(|(k, addrs)| (k.clone(), addrs[0]))
    }
}

impl IndexStore for StorageManager {
    fn open_index(&self, name: &str) -> Result<IndexHandle, ErrCode> {
        self.index(name)?;
        Ok(IndexHandle::new(name))
    }

    fn close_index(&self, handle: IndexHandle) -> Result<(), ErrCode> {
        self.index(&handle.name).map(|_| ())
    }

    fn begin_transaction(&self) -> Result<TransactionId, ErrCode> {
        let txn = TransactionId::new();
        self.active.lock().insert(txn, Vec::new());
        Ok(txn)
    }

    fn commit_transaction(&self, txn: TransactionId) -> Result<(), ErrCode> {
        self.active
            .lock()
            .remove(&txn)
            .map(|_| ())
            .ok_or(ErrCode::TxnDne)
    }

    fn abort_transaction(&self, txn: TransactionId) -> Result<(), ErrCode> {
        let log = self.active.lock().remove(&txn).ok_or(ErrCode::TxnDne)?;
        debug!("memstore::abort {:?} reverting {} changes", txn, log.len());
        for undo in log.into_iter().rev() {
            match undo {
                Undo::Inserted {
                    index,
                    key,
                    address,
                } => {
                    let index = self.index(&index)?;
                    let mut map = index.write();
                    if let Some(addrs) = map.get_mut(&key) {
                        if let Some(pos) = addrs.iter().rposition(|a| *a == address) {
                            addrs.remove(pos);
                        }
                        if addrs.is_empty() {
                            map.remove(&key);
                        }
                    }
                }
                Undo::Deleted {
                    index,
                    key,
                    address,
                    pos,
                } => {
                    let index = self.index(&index)?;
                    let mut map = index.write();
                    let addrs = map.entry(key).or_default();
                    let pos = pos.min(addrs.len());
                    addrs.insert(pos, address);
                }
            }
        }
        Ok(())
    }

    fn get(
        &self,
        handle: &mut IndexHandle,
        txn: TransactionId,
        key: &Value,
    ) -> Result<Record, ErrCode> {
        self.check_txn(txn)?;
        let index = self.index(&handle.name)?;
        let map = index.read();
        handle.txn = Some(txn);
        match map.get(key) {
            Some(addrs) if !addrs.is_empty() => {
                handle.cursor = IndexCursor::At(key.clone(), 0);
                Ok(Record {
                    key: key.clone(),
                    address: addrs[0],
                })
            }
            _ => {
                handle.cursor = IndexCursor::After(key.clone());
                Err(ErrCode::KeyNotFound)
            }
        }
    }

    fn get_next(&self, handle: &mut IndexHandle, txn: TransactionId) -> Result<Record, ErrCode> {
        self.check_txn(txn)?;
        let index = self.index(&handle.name)?;
        let map = index.read();
        if handle.txn != Some(txn) {
            handle.txn = Some(txn);
            handle.cursor = IndexCursor::Start;
        }
        let next = match &handle.cursor {
            IndexCursor::Start => map
                .iter()
                .find(|(_, addrs)| !addrs.is_empty())
                .map(|(k, addrs)| (k.clone(), 0, addrs[0])),
            IndexCursor::At(key, pos) => match map.get(key) {
                Some(addrs) if pos + 1 < addrs.len() => Some((key.clone(), pos + 1, addrs[pos + 1])),
                _ => Self::first_after(&map, key).map(|(k, a)| (k, 0, a)),
            },
            IndexCursor::After(key) => Self::first_after(&map, key).map(|(k, a)| (k, 0, a)),
        };
        match next {
            Some((key, pos, address)) => {
                handle.cursor = IndexCursor::At(key.clone(), pos);
                Ok(Record { key, address })
            }
            None => Err(ErrCode::DbEnd),
        }
    }

    fn insert_record(
        &self,
        handle: &IndexHandle,
        txn: TransactionId,
        key: Value,
        address: Address,
    ) -> Result<(), ErrCode> {
        self.check_txn(txn)?;
        let index = self.index(&handle.name)?;
        {
            let mut map = index.write();
            let addrs = map.entry(key.clone()).or_default();
            if addrs.contains(&address) {
                return Err(ErrCode::EntryExists);
            }
            addrs.push(address);
        }
        self.log_undo(
            txn,
            Undo::Inserted {
                index: handle.name.clone(),
                key,
                address,
            },
        )
    }

    fn delete_record(
        &self,
        handle: &IndexHandle,
        txn: TransactionId,
        key: &Value,
        address: Option<Address>,
    ) -> Result<(), ErrCode> {
        self.check_txn(txn)?;
        let index = self.index(&handle.name)?;
        let (address, pos) = {
            let mut map = index.write();
            let addrs = map.get_mut(key).ok_or(ErrCode::EntryDne)?;
            let pos = match address {
                Some(a) => addrs.iter().position(|x| *x == a).ok_or(ErrCode::EntryDne)?,
                None if !addrs.is_empty() => 0,
                None => return Err(ErrCode::EntryDne),
            };
            let removed = addrs.remove(pos);
            if addrs.is_empty() {
                map.remove(key);
            }
            (removed, pos)
        };
        self.log_undo(
            txn,
            Undo::Deleted {
                index: handle.name.clone(),
                key: key.clone(),
                address,
                pos,
            },
        )
    }
}
