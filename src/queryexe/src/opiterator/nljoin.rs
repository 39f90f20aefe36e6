use common::ids::{ColId, NodeId};
use common::{DataType, DbError, Query, Tuple};
use std::sync::Arc;

use super::{ExecState, Join, OpIterator, Operator};
use crate::io::ExecEnv;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    /// The inner child has not been opened yet.
    Open,
    /// Pairing the current outer tuple with inner tuples.
    GetNext,
    /// The inner child is exhausted for the current outer tuple.
    Reopen,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Open
    }
}

#[derive(Default)]
struct NlJoinState {
    env: Option<Arc<ExecEnv>>,
    phase: Phase,
    outer: Option<Tuple>,
    done: bool,
}

/// Tuple-at-a-time nested-loop join. The correlated form pushes a column of every outer
/// tuple into the inner child as its key.
#[derive(Clone, Debug)]
pub struct NlJoin {
    pub(crate) join: Join,
    /// Outer column handed to the inner child.
    pub(crate) index_join_col: Option<ColId>,
    state: ExecState<NlJoinState>,
}

impl NlJoin {
    pub fn new(
        node: NodeId,
        left: Operator,
        right: Operator,
        query: &Query,
    ) -> Result<Self, DbError> {
        Ok(Self::from_join(Join::new(node, left, right, query, None)?, None))
    }

    /// Builds an index nested-loop join whose inner child looks up the other side of
    /// `query.join_fields[cond]`.
    ///
    /// # Arguments
    ///
    /// * `node` - Node executing the join.
    /// * `left` - Outer child.
    /// * `right` - Correlated inner child.
    /// * `query` - Query being planned.
    /// * `cond` - Position of the join condition enforced by the inner lookup.
    pub fn correlated(
        node: NodeId,
        left: Operator,
        right: Operator,
        query: &Query,
        cond: usize,
    ) -> Result<Self, DbError> {
        let (a, b) = query.join_fields.get(cond).ok_or_else(|| {
            DbError::PlanError(format!("no join condition {}", cond))
        })?;
        let outer = if left.has_col(a) && right.has_col(b) {
            a
        } else if left.has_col(b) && right.has_col(a) {
            b
        } else {
            return Err(DbError::PlanError(format!(
                "{} = {} does not connect the join inputs",
                a, b
            )));
        };
        let col = left
            .output_col_id(outer)
            .ok_or_else(|| DbError::ProtocolError(format!("unknown column {}", outer)))?;
        Ok(Self::from_join(
            Join::new(node, left, right, query, Some(cond))?,
            Some(col),
        ))
    }

    pub(crate) fn from_join(join: Join, index_join_col: Option<ColId>) -> Self {
        NlJoin {
            join,
            index_join_col,
            state: ExecState::default(),
        }
    }

    pub fn is_correlated(&self) -> bool {
        self.index_join_col.is_some()
    }

    fn start_inner(&mut self, outer: &Tuple) -> Result<(), DbError> {
        let key = match self.index_join_col {
            Some(col) => Some(outer.get(col).ok_or_else(|| {
                DbError::ExecutionError(format!("outer tuple has no column {}", col))
            })?),
            None => None,
        };
        let key = key.map(|k| &k[..]);
        match self.state.phase {
            Phase::Open => {
                let env = self
                    .state
                    .env
                    .clone()
                    .ok_or_else(|| DbError::ExecutionError(String::from("NlJoin is not open")))?;
                self.join.right.open(key, &env)
            }
            _ => self.join.right.reopen(key),
        }
    }
}

impl OpIterator for NlJoin {
    fn open(&mut self, key: Option<&[u8]>, env: &Arc<ExecEnv>) -> Result<(), DbError> {
        self.join.left.open(key, env)?;
        self.state.env = Some(env.clone());
        self.state.phase = Phase::Open;
        self.state.outer = None;
        self.state.done = false;
        Ok(())
    }

    fn reopen(&mut self, key: Option<&[u8]>) -> Result<(), DbError> {
        self.join.left.reopen(key)?;
        if self.state.phase != Phase::Open {
            self.state.phase = Phase::Reopen;
        }
        self.state.outer = None;
        self.state.done = false;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>, DbError> {
        if self.state.env.is_none() {
            return Err(DbError::ExecutionError(String::from("NlJoin is not open")));
        }
        loop {
            if self.state.done {
                return Ok(None);
            }
            match self.state.phase {
                Phase::Open | Phase::Reopen => {
                    let outer = match self.join.left.next()? {
                        Some(t) => t,
                        None => {
                            self.state.done = true;
                            return Ok(None);
                        }
                    };
                    self.start_inner(&outer)?;
                    self.state.outer = Some(outer);
                    self.state.phase = Phase::GetNext;
                }
                Phase::GetNext => match self.join.right.next()? {
                    Some(inner) => {
                        if let Some(outer) = &self.state.outer {
                            if self.join.matches(outer, &inner) {
                                return Ok(Some(self.join.project(outer, &inner)));
                            }
                        }
                    }
                    None => self.state.phase = Phase::Reopen,
                },
            }
        }
    }

    fn close(&mut self) -> Result<(), DbError> {
        let left = self.join.left.close();
        let right = if self.state.phase != Phase::Open {
            self.join.right.close()
        } else {
            Ok(())
        };
        self.state.env = None;
        self.state.phase = Phase::Open;
        self.state.outer = None;
        left.and(right)
    }

    fn node_id(&self) -> NodeId {
        self.join.node
    }

    fn has_col(&self, col: &str) -> bool {
        self.join.has_col(col)
    }

    fn output_col_id(&self, col: &str) -> Option<ColId> {
        self.join.output_col_id(col)
    }

    fn col_type(&self, col: &str) -> Option<DataType> {
        self.join.col_type(col)
    }

    fn num_output_cols(&self) -> usize {
        self.join.num_output_cols()
    }

    /// The inner child runs once per outer tuple.
    fn est_cost(&self) -> f64 {
        let left = &self.join.left;
        let right = &self.join.right;
        left.est_cost()
            + right.est_cost()
            + (left.est_cardinality() - 1.0) * right.rescan_cost()
    }

    fn est_cardinality(&self) -> f64 {
        self.join.cardinality(
            self.join.left.est_cardinality(),
            self.join.right.est_cardinality(),
        )
    }

    fn est_col_length(&self, col: ColId) -> f64 {
        self.join.est_col_length(col)
    }

    fn est_distinct(&self, col: ColId) -> f64 {
        self.join.est_distinct(col)
    }
}
