use bytes::Bytes;
use common::ids::{ColId, NodeId};
use common::stats::PartStats;
use common::table::Table;
use common::{DataType, DbError, Query, Tuple};
use std::sync::Arc;

use super::{next_line, ExecState, OpIterator, Scan};
use crate::cost::COST_DISK_READ_PAGE;
use crate::io::ExecEnv;

#[derive(Default)]
struct SeqScanState {
    file: Option<Bytes>,
    pos: usize,
}

/// Reads a partition file in storage order.
#[derive(Clone, Debug)]
pub struct SeqScan {
    pub(crate) scan: Scan,
    state: ExecState<SeqScanState>,
}

impl SeqScan {
    /// Builds a sequential scan over one partition.
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
        Ok(Self::from_scan(Scan::new(node, alias, table, file, query, stats)?))
    }

    pub(crate) fn from_scan(scan: Scan) -> Self {
        SeqScan {
            scan,
            state: ExecState::default(),
        }
    }
}

impl OpIterator for SeqScan {
    fn open(&mut self, _key: Option<&[u8]>, env: &Arc<ExecEnv>) -> Result<(), DbError> {
        self.state.file = Some(env.io.open_file(&self.scan.file)?);
        self.state.pos = 0;
        Ok(())
    }

    fn reopen(&mut self, _key: Option<&[u8]>) -> Result<(), DbError> {
        self.state.pos = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>, DbError> {
        let file = match &self.state.file {
            Some(f) => f.clone(),
            None => {
                return Err(DbError::ExecutionError(String::from(
                    "SeqScan is not open",
                )))
            }
        };
        while let Some((line, next)) = next_line(&file, self.state.pos) {
            self.state.pos = next;
            let tuple = Tuple::parse_line(line, self.scan.fields.len());
            if self.scan.matches(&tuple) {
                return Ok(Some(self.scan.project(&tuple)));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<(), DbError> {
        self.state.file = None;
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

    fn est_cost(&self) -> f64 {
        self.scan.pages() * COST_DISK_READ_PAGE
    }

    fn est_cardinality(&self) -> f64 {
        self.scan.cardinality() * self.scan.selectivity()
    }

    fn est_col_length(&self, col: ColId) -> f64 {
        self.scan.est_col_length(col)
    }

    fn est_distinct(&self, col: ColId) -> f64 {
        self.scan.est_distinct(col)
    }
}
