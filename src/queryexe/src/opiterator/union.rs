use common::ids::{ColId, NodeId};
use common::{DataType, DbError, Tuple, Value};
use std::sync::Arc;

use super::{ExecState, OpIterator, Operator};
use crate::io::ExecEnv;

/// How a union draws from its children.
#[derive(Clone, Debug, PartialEq)]
pub enum UnionMode {
    /// Every child, round robin.
    Plain,
    /// One child per key: the one whose partition range can hold it. Holds the minimum key
    /// of each child with the child's position, ascending.
    Pivot(Vec<(Value, usize)>),
}

#[derive(Default)]
struct UnionState {
    env: Option<Arc<ExecEnv>>,
    opened: Vec<bool>,
    exhausted: Vec<bool>,
    /// Next child to pull from in plain mode.
    cursor: usize,
    /// Child routed to in pivot mode.
    active: Option<usize>,
}

/// Concatenates children with the same output columns, typically the partitions of one
/// table or the fragments of one plan.
#[derive(Clone, Debug)]
pub struct Union {
    pub(crate) node: NodeId,
    pub(crate) children: Vec<Operator>,
    pub(crate) mode: UnionMode,
    state: ExecState<UnionState>,
}

impl Union {
    pub fn plain(node: NodeId, children: Vec<Operator>) -> Result<Self, DbError> {
        Self::with_mode(node, children, UnionMode::Plain)
    }

    /// Builds a union that routes each correlated key to a single child.
    ///
    /// # Arguments
    ///
    /// * `node` - Node executing the union.
    /// * `children` - One operator per partition.
    /// * `min_keys` - Smallest primary key of each child's partition, parallel to `children`.
    pub fn pivot(
        node: NodeId,
        children: Vec<Operator>,
        min_keys: Vec<Value>,
    ) -> Result<Self, DbError> {
        if min_keys.len() != children.len() {
            return Err(DbError::PlanError(format!(
                "{} pivot keys for {} children",
                min_keys.len(),
                children.len()
            )));
        }
        let mut pivots: Vec<(Value, usize)> = min_keys.into_iter().zip(0..).collect();
        pivots.sort();
        Self::with_mode(node, children, UnionMode::Pivot(pivots))
    }

    pub(crate) fn with_mode(
        node: NodeId,
        children: Vec<Operator>,
        mode: UnionMode,
    ) -> Result<Self, DbError> {
        if children.is_empty() {
            return Err(DbError::PlanError(String::from("union of nothing")));
        }
        if let UnionMode::Pivot(pivots) = &mode {
            if pivots.iter().any(|(_, i)| *i >= children.len()) {
                return Err(DbError::ProtocolError(String::from(
                    "pivot refers to a missing child",
                )));
            }
        }
        Ok(Union {
            node,
            children,
            mode,
            state: ExecState::default(),
        })
    }

    /// Child whose key range can hold `key`.
    fn route(&self, key: &[u8]) -> Result<Option<usize>, DbError> {
        let pivots = match &self.mode {
            UnionMode::Pivot(p) => p,
            UnionMode::Plain => return Ok(None),
        };
        let dtype = match pivots.first() {
            Some((v, _)) => v.dtype(),
            None => return Ok(None),
        };
        let key = Value::from_column(key, dtype)?;
        let idx = pivots.partition_point(|(min, _)| *min <= key);
        Ok(if idx == 0 { None } else { Some(pivots[idx - 1].1) })
    }

    fn open_child(&mut self, i: usize, key: Option<&[u8]>) -> Result<(), DbError> {
        if self.state.opened[i] {
            self.children[i].reopen(key)
        } else {
            let env = self
                .state
                .env
                .clone()
                .ok_or_else(|| DbError::ExecutionError(String::from("Union is not open")))?;
            self.children[i].open(key, &env)?;
            self.state.opened[i] = true;
            Ok(())
        }
    }

    fn start(&mut self, key: Option<&[u8]>) -> Result<(), DbError> {
        let n = self.children.len();
        self.state.exhausted = vec![false; n];
        self.state.cursor = 0;
        self.state.active = None;
        match self.mode {
            UnionMode::Plain => {
                for i in 0..n {
                    self.open_child(i, key)?;
                }
            }
            UnionMode::Pivot(_) => {
                let key = key.ok_or_else(|| {
                    DbError::ExecutionError(String::from("pivot union needs a key"))
                })?;
                if let Some(i) = self.route(key)? {
                    self.open_child(i, Some(key))?;
                    self.state.active = Some(i);
                }
            }
        }
        Ok(())
    }

    fn is_pivot(&self) -> bool {
        matches!(self.mode, UnionMode::Pivot(_))
    }

    fn combine<F: Fn(&Operator) -> f64>(&self, f: F) -> f64 {
        let total: f64 = self.children.iter().map(f).sum();
        if self.is_pivot() {
            total / self.children.len() as f64
        } else {
            total
        }
    }
}

impl OpIterator for Union {
    fn open(&mut self, key: Option<&[u8]>, env: &Arc<ExecEnv>) -> Result<(), DbError> {
        self.state.env = Some(env.clone());
        self.state.opened = vec![false; self.children.len()];
        self.start(key)
    }

    fn reopen(&mut self, key: Option<&[u8]>) -> Result<(), DbError> {
        self.start(key)
    }

    fn next(&mut self) -> Result<Option<Tuple>, DbError> {
        if self.state.env.is_none() {
            return Err(DbError::ExecutionError(String::from("Union is not open")));
        }
        if self.is_pivot() {
            return match self.state.active {
                Some(i) => self.children[i].next(),
                None => Ok(None),
            };
        }
        let n = self.children.len();
        for _ in 0..n {
            let i = self.state.cursor;
            self.state.cursor = (i + 1) % n;
            if self.state.exhausted[i] {
                continue;
            }
            match self.children[i].next()? {
                Some(t) => return Ok(Some(t)),
                None => self.state.exhausted[i] = true,
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<(), DbError> {
        let mut res = Ok(());
        for (i, child) in self.children.iter_mut().enumerate() {
            if self.state.opened.get(i).copied().unwrap_or(false) {
                res = res.and(child.close());
            }
        }
        self.state.env = None;
        self.state.opened.clear();
        self.state.active = None;
        res
    }

    fn node_id(&self) -> NodeId {
        self.node
    }

    fn has_col(&self, col: &str) -> bool {
        self.children[0].has_col(col)
    }

    fn output_col_id(&self, col: &str) -> Option<ColId> {
        self.children[0].output_col_id(col)
    }

    fn col_type(&self, col: &str) -> Option<DataType> {
        self.children[0].col_type(col)
    }

    fn num_output_cols(&self) -> usize {
        self.children[0].num_output_cols()
    }

    fn est_cost(&self) -> f64 {
        self.combine(|c| c.est_cost())
    }

    fn rescan_cost(&self) -> f64 {
        self.combine(|c| c.rescan_cost())
    }

    fn est_cardinality(&self) -> f64 {
        self.combine(|c| c.est_cardinality())
    }

    fn est_col_length(&self, col: ColId) -> f64 {
        self.children[0].est_col_length(col)
    }

    fn est_distinct(&self, col: ColId) -> f64 {
        self.children[0].est_distinct(col)
    }
}
