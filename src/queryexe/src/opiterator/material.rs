use bytes::{Bytes, BytesMut};
use common::ids::{ColId, NodeId};
use common::{DataType, DbError, Tuple};
use std::sync::Arc;

use super::{ExecState, OpIterator, Operator};
use crate::cost::MATERIAL_BUFSIZE;
use crate::io::ExecEnv;

#[derive(Default)]
struct MaterialState {
    open: bool,
    pos: usize,
}

/// Buffers the whole output of its child so later executions replay it without running
/// the child again.
#[derive(Clone, Debug)]
pub struct Material {
    pub(crate) node: NodeId,
    pub(crate) child: Box<Operator>,
    /// Buffered rows, shared by the clones of a built plan.
    pub(crate) rows: Option<Arc<Vec<Tuple>>>,
    state: ExecState<MaterialState>,
}

impl Material {
    /// Buffers the child on its first `open`.
    pub fn new(node: NodeId, child: Operator) -> Self {
        Material {
            node,
            child: Box::new(child),
            rows: None,
            state: ExecState::default(),
        }
    }

    /// Runs `child` now and keeps its rows.
    ///
    /// # Arguments
    ///
    /// * `node` - Node the rows are replayed on.
    /// * `child` - Plan whose output gets buffered.
    /// * `env` - Node running `child`.
    pub fn build(node: NodeId, child: Operator, env: &Arc<ExecEnv>) -> Result<Self, DbError> {
        let mut m = Self::new(node, child);
        m.fill(env)?;
        Ok(m)
    }

    pub(crate) fn from_rows(node: NodeId, child: Operator, rows: Option<Vec<Tuple>>) -> Self {
        Material {
            node,
            child: Box::new(child),
            rows: rows.map(Arc::new),
            state: ExecState::default(),
        }
    }

    pub fn is_built(&self) -> bool {
        self.rows.is_some()
    }

    fn fill(&mut self, env: &Arc<ExecEnv>) -> Result<(), DbError> {
        let mut arena = BytesMut::with_capacity(MATERIAL_BUFSIZE);
        let mut rows = Vec::new();
        let mut used = 0;
        self.child.open(None, env)?;
        let res = loop {
            let tuple = match self.child.next() {
                Ok(Some(t)) => t,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            used += tuple.byte_len();
            if used > MATERIAL_BUFSIZE {
                break Err(DbError::ResourceError(format!(
                    "materialized result exceeds {} bytes",
                    MATERIAL_BUFSIZE
                )));
            }
            let columns: Vec<Bytes> = tuple
                .columns()
                .map(|col| {
                    arena.extend_from_slice(col);
                    arena.split().freeze()
                })
                .collect();
            rows.push(Tuple::new(columns));
        };
        let closed = self.child.close();
        res?;
        closed?;
        debug!("material: buffered {} rows", rows.len());
        self.rows = Some(Arc::new(rows));
        Ok(())
    }
}

impl OpIterator for Material {
    fn open(&mut self, _key: Option<&[u8]>, env: &Arc<ExecEnv>) -> Result<(), DbError> {
        if self.rows.is_none() {
            self.fill(env)?;
        }
        self.state.open = true;
        self.state.pos = 0;
        Ok(())
    }

    fn reopen(&mut self, _key: Option<&[u8]>) -> Result<(), DbError> {
        self.state.pos = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>, DbError> {
        if !self.state.open {
            return Err(DbError::ExecutionError(String::from("Material is not open")));
        }
        let row = self
            .rows
            .as_ref()
            .and_then(|rows| rows.get(self.state.pos))
            .cloned();
        if row.is_some() {
            self.state.pos += 1;
        }
        Ok(row)
    }

    fn close(&mut self) -> Result<(), DbError> {
        self.state.open = false;
        Ok(())
    }

    fn node_id(&self) -> NodeId {
        self.node
    }

    fn has_col(&self, col: &str) -> bool {
        self.child.has_col(col)
    }

    fn output_col_id(&self, col: &str) -> Option<ColId> {
        self.child.output_col_id(col)
    }

    fn col_type(&self, col: &str) -> Option<DataType> {
        self.child.col_type(col)
    }

    fn num_output_cols(&self) -> usize {
        self.child.num_output_cols()
    }

    fn est_cost(&self) -> f64 {
        if self.is_built() {
            0.0
        } else {
            self.child.est_cost()
        }
    }

    fn rescan_cost(&self) -> f64 {
        0.0
    }

    fn est_cardinality(&self) -> f64 {
        match &self.rows {
            Some(rows) => rows.len() as f64,
            None => self.child.est_cardinality(),
        }
    }

    fn est_col_length(&self, col: ColId) -> f64 {
        self.child.est_col_length(col)
    }

    fn est_distinct(&self, col: ColId) -> f64 {
        self.child.est_distinct(col)
    }
}

#[cfg(test)]
mod test {
    use super::super::testutil::*;
    use super::super::SeqScan;
    use super::*;
    use common::catalog::Catalog;
    use common::testutil::*;
    use common::Query;

    #[test]
    fn test_replay_without_child() {
        let fx = fixture(&[("T", &["_id", "v"], vec![vec![1, 10], vec![2, 20]])]);
        let q = Query::new().table("T", "a").output("a.v");
        let table = fx.db.get_table("T").unwrap();
        let scan = SeqScan::new(0, "a", table, "t.0", &q, None).unwrap();
        let m = Material::build(0, Operator::SeqScan(scan), &fx.env).unwrap();
        assert!(m.is_built());
        assert_eq!(2.0, m.est_cardinality());
        assert_eq!(0.0, m.est_cost());

        // The rows stay available once the file is gone.
        std::fs::remove_file(fx.dir.join("t.0")).unwrap();
        let mut op = Operator::Material(m);
        op.open(None, &fx.env).unwrap();
        assert_eq!(vec![10], tuple_to_ints(&op.next().unwrap().unwrap()));
        op.reopen(None).unwrap();
        assert_eq!(vec![10], tuple_to_ints(&op.next().unwrap().unwrap()));
        assert_eq!(vec![20], tuple_to_ints(&op.next().unwrap().unwrap()));
        assert!(op.next().unwrap().is_none());
        op.close().unwrap();
    }

    #[test]
    fn test_deferred_and_budget() {
        let fx = fixture(&[("T", &["_id"], vec![vec![1], vec![2], vec![3]])]);
        let q = Query::new().table("T", "a").output("a._id");
        let table = fx.db.get_table("T").unwrap();
        let scan = SeqScan::new(0, "a", table, "t.0", &q, None).unwrap();
        let mut op = Operator::Material(Material::new(0, Operator::SeqScan(scan)));
        assert_eq!(vec![vec![1], vec![2], vec![3]], run(&mut op, &fx.env));

        let big = "y".repeat(1000);
        let lines: Vec<String> = (0..2200).map(|i| format!("{}|{}", i, big)).collect();
        write_lines(fx.dir.join("w.0"), &lines);
        let wide = common::table::Table::new(
            "W".to_string(),
            common::TableSchema::from_vecs(vec!["_id", "s"], vec![DataType::Int, DataType::String]),
            vec![common::table::Partition::new(0, "w.0")],
        );
        let q = Query::new().table("W", "w").output("w.s");
        let scan = SeqScan::new(0, "w", &wide, "w.0", &q, None).unwrap();
        match Material::build(0, Operator::SeqScan(scan), &fx.env) {
            Err(DbError::ResourceError(_)) => {}
            other => panic!("expected a resource error, got {:?}", other.map(|_| ())),
        }
    }
}
