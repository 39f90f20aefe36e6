use bytes::Bytes;
use common::ids::{Address, ColId, NodeId, TransactionId};
use common::stats::PartStats;
use common::storage_trait::{ErrCode, IndexHandle, IndexStore};
use common::table::Table;
use common::{DataType, DbError, PredicateOp, Query, Tuple, Value};
use std::sync::Arc;

use super::{next_line, ExecState, OpIterator, Scan};
use crate::cost::{mackert_lohman, COST_DISK_READ_PAGE, COST_DISK_SEEK_PAGE, SELECTIVITY_GT};
use crate::io::ExecEnv;

#[derive(Default)]
struct IndexScanState {
    env: Option<Arc<ExecEnv>>,
    file: Option<Bytes>,
    handle: Option<IndexHandle>,
    /// Record addresses of the current lookup, ascending.
    addrs: Vec<Address>,
    pos: usize,
}

/// Looks records up through an index, then reads them from the partition file in address
/// order.
#[derive(Clone, Debug)]
pub struct IndexScan {
    pub(crate) scan: Scan,
    /// Schema position of the indexed column.
    pub(crate) index_col: ColId,
    pub(crate) index_name: String,
    pub(crate) op: PredicateOp,
    /// The indexed column is the primary key.
    pub(crate) unique: bool,
    /// Comparison value. `None` when the value arrives with `open`/`reopen`.
    pub(crate) literal: Option<Value>,
    /// Expected number of probes of a correlated scan; only used while planning.
    pub(crate) outer_cardinality: f64,
    state: ExecState<IndexScanState>,
}

impl IndexScan {
    /// Builds an index scan driven by the first literal predicate on an indexed column. The
    /// predicate is enforced by the lookup and dropped from the residual filter.
    ///
    /// # Arguments
    ///
    /// * `node` - Node holding the partition.
    /// * `alias` - Alias of the table in the query.
    /// * `table` - Scanned table.
    /// * `file` - Flat file of the partition.
    /// * `query` - Query the scan serves.
    /// * `stats` - Statistics of the partition, if collected.
    pub fn new(
        node: NodeId,
        alias: &str,
        table: &Table,
        file: &str,
        query: &Query,
        stats: Option<Arc<PartStats>>,
    ) -> Result<Self, DbError> {
        let mut scan = Scan::new(node, alias, table, file, query, stats)?;
        let pos = scan
            .filters
            .iter()
            .position(|f| {
                let (name, dtype) = &scan.fields[f.col];
                name.starts_with('_') && *dtype == f.value.dtype()
            })
            .ok_or_else(|| {
                DbError::PlanError(format!("no indexed predicate on {} as {}", table.name, alias))
            })?;
        let cond = scan.filters.remove(pos);
        let index_name = table.index_name(&scan.fields[cond.col].0);
        Ok(IndexScan {
            index_col: cond.col,
            index_name,
            op: cond.op,
            unique: cond.col == 0,
            literal: Some(cond.value),
            outer_cardinality: 1.0,
            scan,
            state: ExecState::default(),
        })
    }

    /// Builds the inner side of an index nested-loop join: an equality lookup on `field`
    /// whose value is the correlated key.
    ///
    /// # Arguments
    ///
    /// * `field` - Indexed field of the table, without alias.
    /// * `outer_cardinality` - Expected number of probes.
    #[allow(clippy::too_many_arguments)]
    pub fn correlated(
        node: NodeId,
        alias: &str,
        table: &Table,
        file: &str,
        query: &Query,
        stats: Option<Arc<PartStats>>,
        field: &str,
        outer_cardinality: f64,
    ) -> Result<Self, DbError> {
        let scan = Scan::new(node, alias, table, file, query, stats)?;
        let index_col = scan
            .fields
            .iter()
            .position(|(name, _)| name == field && name.starts_with('_'))
            .ok_or_else(|| {
                DbError::PlanError(format!("{}.{} is not indexed", table.name, field))
            })?;
        Ok(IndexScan {
            index_col,
            index_name: table.index_name(field),
            op: PredicateOp::Equals,
            unique: index_col == 0,
            literal: None,
            outer_cardinality: outer_cardinality.max(1.0),
            scan,
            state: ExecState::default(),
        })
    }

    pub(crate) fn from_parts(
        scan: Scan,
        index_col: ColId,
        index_name: String,
        op: PredicateOp,
        unique: bool,
        literal: Option<Value>,
    ) -> Self {
        IndexScan {
            scan,
            index_col,
            index_name,
            op,
            unique,
            literal,
            outer_cardinality: 1.0,
            state: ExecState::default(),
        }
    }

    /// Whether the comparison value comes from an outer tuple.
    pub fn is_correlated(&self) -> bool {
        self.literal.is_none()
    }

    fn lookup_value(&self, key: Option<&[u8]>) -> Result<Value, DbError> {
        match (&self.literal, key) {
            (Some(v), _) => Ok(v.clone()),
            (None, Some(k)) => Value::from_column(k, self.scan.fields[self.index_col].1),
            (None, None) => Err(DbError::ExecutionError(format!(
                "correlated scan of {} opened without a key",
                self.index_name
            ))),
        }
    }

    /// Runs the lookup and replaces the address list.
    fn lookup(&mut self, key: Option<&[u8]>) -> Result<(), DbError> {
        let value = self.lookup_value(key)?;
        let env = self
            .state
            .env
            .clone()
            .ok_or_else(|| DbError::ExecutionError(String::from("IndexScan is not open")))?;
        let mut handle = self
            .state
            .handle
            .take()
            .ok_or_else(|| DbError::ExecutionError(String::from("IndexScan is not open")))?;
        let store = env.store.as_ref();
        let txn = store.begin_transaction()?;
        let collected = self.collect(store, &mut handle, txn, &value);
        self.state.handle = Some(handle);
        match collected {
            Ok(mut addrs) => {
                store.commit_transaction(txn)?;
                // The index gives no order among duplicates, addresses do.
                addrs.sort();
                self.state.addrs = addrs;
                self.state.pos = 0;
                Ok(())
            }
            Err(e) => {
                let _ = store.abort_transaction(txn);
                Err(e.into())
            }
        }
    }

    fn collect(
        &self,
        store: &dyn IndexStore,
        handle: &mut IndexHandle,
        txn: TransactionId,
        value: &Value,
    ) -> Result<Vec<Address>, ErrCode> {
        let mut addrs = Vec::new();
        match self.op {
            PredicateOp::Equals => {
                match store.get(handle, txn, value) {
                    Ok(rec) => addrs.push(rec.address),
                    Err(ErrCode::KeyNotFound) => return Ok(addrs),
                    Err(e) => return Err(e),
                }
                if self.unique {
                    return Ok(addrs);
                }
                loop {
                    match store.get_next(handle, txn) {
                        Ok(rec) if rec.key == *value => addrs.push(rec.address),
                        Ok(_) | Err(ErrCode::DbEnd) => break,
                        Err(e) => return Err(e),
                    }
                }
            }
            PredicateOp::GreaterThan => {
                match store.get(handle, txn, value) {
                    Ok(_) | Err(ErrCode::KeyNotFound) => {}
                    Err(e) => return Err(e),
                }
                loop {
                    match store.get_next(handle, txn) {
                        Ok(rec) => {
                            if rec.key > *value {
                                addrs.push(rec.address);
                            }
                        }
                        Err(ErrCode::DbEnd) => break,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(addrs)
    }
}

impl OpIterator for IndexScan {
    fn open(&mut self, key: Option<&[u8]>, env: &Arc<ExecEnv>) -> Result<(), DbError> {
        self.state.file = Some(env.io.open_file(&self.scan.file)?);
        self.state.handle = Some(env.store.open_index(&self.index_name)?);
        self.state.env = Some(env.clone());
        self.lookup(key)
    }

    fn reopen(&mut self, key: Option<&[u8]>) -> Result<(), DbError> {
        if key.is_none() && self.literal.is_some() {
            self.state.pos = 0;
            return Ok(());
        }
        self.lookup(key)
    }

    fn next(&mut self) -> Result<Option<Tuple>, DbError> {
        let file = match &self.state.file {
            Some(f) => f.clone(),
            None => {
                return Err(DbError::ExecutionError(String::from(
                    "IndexScan is not open",
                )))
            }
        };
        while self.state.pos < self.state.addrs.len() {
            let addr = self.state.addrs[self.state.pos] as usize;
            self.state.pos += 1;
            let (line, _) = next_line(&file, addr).ok_or_else(|| {
                DbError::StorageError(format!("address {} past the end of {}", addr, self.scan.file))
            })?;
            let tuple = Tuple::parse_line(line, self.scan.fields.len());
            if self.scan.matches(&tuple) {
                return Ok(Some(self.scan.project(&tuple)));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<(), DbError> {
        if let (Some(handle), Some(env)) = (self.state.handle.take(), self.state.env.take()) {
            env.store.close_index(handle)?;
        }
        self.state.file = None;
        self.state.addrs.clear();
        Ok(())
    }

    fn node_id(&self) -> NodeId {
        self.scan.node
    }

    fn has_col(&self, col: &str) -> bool {
        self.scan.has_col(col)
    }

    fn output_col_id(&self, col: &str) -> Option<ColId> {
        self.scan.output_col_id(col)
    }

    fn col_type(&self, col: &str) -> Option<DataType> {
        self.scan.col_type(col)
    }

    fn num_output_cols(&self) -> usize {
        self.scan.num_output_cols()
    }

    /// Cost of one lookup. A correlated scan spreads the page fetches of all probes over
    /// the probes.
    fn est_cost(&self) -> f64 {
        let pages = self.scan.pages();
        let card = self.scan.cardinality();
        let (seq, random) = if self.is_correlated() {
            let per_probe = if self.unique { 1.0 } else { 3.0 };
            let outer = self.outer_cardinality;
            (0.0, mackert_lohman(pages, per_probe, outer) / outer)
        } else {
            match (self.op, self.unique) {
                (PredicateOp::Equals, true) => (mackert_lohman(pages, 1.0, 1.0), 0.0),
                (PredicateOp::Equals, false) => (0.0, mackert_lohman(pages, 3.0, 1.0)),
                (PredicateOp::GreaterThan, true) => (pages * SELECTIVITY_GT, 0.0),
                (PredicateOp::GreaterThan, false) => {
                    (0.0, mackert_lohman(pages, card * SELECTIVITY_GT, 1.0))
                }
            }
        };
        (seq + random) * COST_DISK_READ_PAGE + random * COST_DISK_SEEK_PAGE
    }

    /// Records per lookup.
    fn est_cardinality(&self) -> f64 {
        let card = self.scan.cardinality();
        let indexed = match self.op {
            PredicateOp::Equals if self.unique => card.min(1.0),
            PredicateOp::Equals => card / self.scan.distinct(self.index_col),
            PredicateOp::GreaterThan => card * SELECTIVITY_GT,
        };
        indexed * self.scan.selectivity()
    }

    fn est_col_length(&self, col: ColId) -> f64 {
        self.scan.est_col_length(col)
    }

    fn est_distinct(&self, col: ColId) -> f64 {
        self.scan.est_distinct(col)
    }
}
