use common::ids::{ColId, NodeId};
use common::{DataType, DbError, Tuple};
use std::sync::Arc;

use super::OpIterator;
use crate::io::ExecEnv;

/// Produces no rows. Stands in for a plan whose partitions were all pruned away.
#[derive(Clone, Debug, PartialEq)]
pub struct Dummy {
    pub(crate) node: NodeId,
}

impl Dummy {
    pub fn new(node: NodeId) -> Self {
        Dummy { node }
    }
}

impl OpIterator for Dummy {
    fn open(&mut self, _key: Option<&[u8]>, _env: &Arc<ExecEnv>) -> Result<(), DbError> {
        Ok(())
    }

    fn reopen(&mut self, _key: Option<&[u8]>) -> Result<(), DbError> {
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>, DbError> {
        Ok(None)
    }

    fn close(&mut self) -> Result<(), DbError> {
        Ok(())
    }

    fn node_id(&self) -> NodeId {
        self.node
    }

    fn has_col(&self, _col: &str) -> bool {
        false
    }

    fn output_col_id(&self, _col: &str) -> Option<ColId> {
        None
    }

    fn col_type(&self, _col: &str) -> Option<DataType> {
        None
    }

    fn num_output_cols(&self) -> usize {
        0
    }

    fn est_cost(&self) -> f64 {
        0.0
    }

    fn est_cardinality(&self) -> f64 {
        0.0
    }

    fn est_col_length(&self, _col: ColId) -> f64 {
        0.0
    }

    fn est_distinct(&self, _col: ColId) -> f64 {
        0.0
    }
}
