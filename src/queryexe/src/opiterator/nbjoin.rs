use bytes::{Bytes, BytesMut};
use common::ids::{ColId, NodeId};
use common::{parse_int, DataType, DbError, Query, Tuple};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::{ExecState, Join, OpIterator, Operator};
use crate::cost::{NBJOIN_BUFSIZE, NBJOIN_SLACK};
use crate::io::ExecEnv;

#[derive(Default)]
struct NbJoinState {
    env: Option<Arc<ExecEnv>>,
    /// Outer tuples of the current batch. Their columns live in the batch arena.
    batch: Vec<Tuple>,
    buckets: HashMap<u64, Vec<usize>>,
    loaded: bool,
    left_done: bool,
    right_opened: bool,
    /// Inner tuple being probed and the batch positions still to check, last first.
    probe: Option<Tuple>,
    candidates: Vec<usize>,
    done: bool,
}

/// Block nested-loop join. Buffers a batch of outer tuples in a fixed arena, hashes it on
/// the first join condition and scans the inner child once per batch.
#[derive(Clone, Debug)]
pub struct NbJoin {
    pub(crate) join: Join,
    state: ExecState<NbJoinState>,
}

/// Hash of a join column that agrees with how the condition compares it.
fn hash_column(col: &[u8], dtype: DataType) -> u64 {
    let mut hasher = DefaultHasher::new();
    match (dtype, parse_int(col)) {
        (DataType::Int, Some(i)) => i.hash(&mut hasher),
        _ => col.hash(&mut hasher),
    }
    hasher.finish()
}

impl NbJoin {
    pub fn new(
        node: NodeId,
        left: Operator,
        right: Operator,
        query: &Query,
    ) -> Result<Self, DbError> {
        Ok(Self::from_join(Join::new(node, left, right, query, None)?))
    }

    pub(crate) fn from_join(join: Join) -> Self {
        NbJoin {
            join,
            state: ExecState::default(),
        }
    }

    fn outer_key(&self, tuple: &Tuple) -> u64 {
        match self.join.conds.first() {
            Some(c) => tuple
                .get(c.left)
                .map(|col| hash_column(col, c.dtype))
                .unwrap_or(0),
            None => 0,
        }
    }

    fn inner_key(&self, tuple: &Tuple) -> u64 {
        match self.join.conds.first() {
            Some(c) => tuple
                .get(c.right)
                .map(|col| hash_column(col, c.dtype))
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Buffers the next batch of outer tuples. Returns false when the outer child has
    /// nothing left.
    fn fill_batch(&mut self) -> Result<bool, DbError> {
        self.state.batch.clear();
        self.state.buckets.clear();
        self.state.candidates.clear();
        self.state.probe = None;
        let mut arena = BytesMut::with_capacity(NBJOIN_BUFSIZE);
        let mut used = 0;
        while used < NBJOIN_BUFSIZE - NBJOIN_SLACK {
            let tuple = match self.join.left.next()? {
                Some(t) => t,
                None => {
                    self.state.left_done = true;
                    break;
                }
            };
            let len = tuple.byte_len();
            if len > NBJOIN_BUFSIZE {
                return Err(DbError::ResourceError(format!(
                    "tuple of {} bytes exceeds the join buffer of {} bytes",
                    len, NBJOIN_BUFSIZE
                )));
            }
            let owned = if arena.capacity() - arena.len() >= len {
                copy_into(&mut arena, &tuple)
            } else {
                let mut overflow = BytesMut::with_capacity(len);
                copy_into(&mut overflow, &tuple)
            };
            used += len;
            let key = self.outer_key(&owned);
            let pos = self.state.batch.len();
            self.state.batch.push(owned);
            self.state.buckets.entry(key).or_insert_with(Vec::new).push(pos);
        }
        if self.state.batch.is_empty() {
            return Ok(false);
        }
        debug!("nbjoin: buffered {} outer tuples", self.state.batch.len());
        if self.state.right_opened {
            self.join.right.reopen(None)?;
        } else {
            let env = self
                .state
                .env
                .clone()
                .ok_or_else(|| DbError::ExecutionError(String::from("NbJoin is not open")))?;
            self.join.right.open(None, &env)?;
            self.state.right_opened = true;
        }
        self.state.loaded = true;
        Ok(true)
    }

    fn reset(&mut self) {
        self.state.batch.clear();
        self.state.buckets.clear();
        self.state.candidates.clear();
        self.state.probe = None;
        self.state.loaded = false;
        self.state.left_done = false;
        self.state.done = false;
    }
}

/// Copies the columns of `tuple` into `arena` and returns a tuple viewing the copies.
fn copy_into(arena: &mut BytesMut, tuple: &Tuple) -> Tuple {
    let columns: Vec<Bytes> = tuple
        .columns()
        .map(|col| {
            arena.extend_from_slice(col);
            arena.split().freeze()
        })
        .collect();
    Tuple::new(columns)
}

impl OpIterator for NbJoin {
    fn open(&mut self, key: Option<&[u8]>, env: &Arc<ExecEnv>) -> Result<(), DbError> {
        self.join.left.open(key, env)?;
        self.state.env = Some(env.clone());
        self.reset();
        Ok(())
    }

    fn reopen(&mut self, key: Option<&[u8]>) -> Result<(), DbError> {
        self.join.left.reopen(key)?;
        self.reset();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>, DbError> {
        if self.state.env.is_none() {
            return Err(DbError::ExecutionError(String::from("NbJoin is not open")));
        }
        loop {
            if self.state.done {
                return Ok(None);
            }
            if let Some(inner) = self.state.probe.clone() {
                while let Some(pos) = self.state.candidates.pop() {
                    let outer = &self.state.batch[pos];
                    if self.join.matches(outer, &inner) {
                        return Ok(Some(self.join.project(outer, &inner)));
                    }
                }
                self.state.probe = None;
            }
            if !self.state.loaded {
                if self.state.left_done || !self.fill_batch()? {
                    self.state.done = true;
                    return Ok(None);
                }
            }
            match self.join.right.next()? {
                Some(inner) => {
                    let key = self.inner_key(&inner);
                    let candidates: Vec<usize> = self
                        .state
                        .buckets
                        .get(&key)
                        .map(|b| b.iter().rev().copied().collect())
                        .unwrap_or_default();
                    self.state.candidates = candidates;
                    self.state.probe = Some(inner);
                }
                None => {
                    // Inner exhausted for this batch.
                    self.state.loaded = false;
                }
            }
        }
    }

    fn close(&mut self) -> Result<(), DbError> {
        let left = self.join.left.close();
        let right = if self.state.right_opened {
            self.join.right.close()
        } else {
            Ok(())
        };
        self.reset();
        self.state.right_opened = false;
        self.state.env = None;
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

    /// The inner child runs once per batch of outer tuples.
    fn est_cost(&self) -> f64 {
        let left = &self.join.left;
        let right = &self.join.right;
        let bytes = left.est_cardinality() * left.est_tuple_length();
        let batches = (bytes / NBJOIN_BUFSIZE as f64).ceil().max(1.0);
        left.est_cost() + right.est_cost() + (batches - 1.0) * right.rescan_cost()
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

#[cfg(test)]
mod test {
    use super::super::testutil::*;
    use super::super::{NlJoin, SeqScan};
    use super::*;
    use common::catalog::Catalog;
    use common::testutil::*;

    fn seq(fx: &Fixture, table: &str, alias: &str, q: &Query) -> Operator {
        let t = fx.db.get_table(table).unwrap();
        let file = format!("{}.0", table.to_lowercase());
        Operator::SeqScan(SeqScan::new(0, alias, t, &file, q, None).unwrap())
    }

    fn both(fx: &Fixture, q: &Query) -> (Vec<Vec<i64>>, Vec<Vec<i64>>) {
        let mut nl = Operator::NlJoin(
            NlJoin::new(0, seq(fx, "R", "r", q), seq(fx, "S", "s", q), q).unwrap(),
        );
        let mut nb = Operator::NbJoin(
            NbJoin::new(0, seq(fx, "R", "r", q), seq(fx, "S", "s", q), q).unwrap(),
        );
        (run(&mut nl, &fx.env), run(&mut nb, &fx.env))
    }

    #[test]
    fn test_matches_nljoin() {
        let r: Vec<Vec<i64>> = (0..40).map(|i| vec![i, i % 7]).collect();
        let s: Vec<Vec<i64>> = (0..20).map(|i| vec![i % 9, i]).collect();
        let fx = fixture(&[("R", &["_id", "fk"], r), ("S", &["_id", "v"], s)]);
        let q = Query::new()
            .table("R", "r")
            .table("S", "s")
            .output("r._id")
            .output("s.v")
            .join("r.fk", "s._id");
        let (nl, nb) = both(&fx, &q);
        assert!(!nl.is_empty());
        assert!(compare_unordered(&nl, nb));
    }

    #[test]
    fn test_many_batches() {
        // Wide enough rows to need several batches.
        let r: Vec<Vec<i64>> = (0..6000)
            .map(|i| vec![i, i % 50, 1_000_000_000 + i])
            .collect();
        let s: Vec<Vec<i64>> = (0..50).map(|i| vec![i, i * 2]).collect();
        let fx = fixture(&[("R", &["_id", "fk", "pad"], r), ("S", &["_id", "v"], s)]);
        let q = Query::new()
            .table("R", "r")
            .table("S", "s")
            .output("r._id")
            .output("r.pad")
            .output("s.v")
            .join("r.fk", "s._id");
        let mut nb = Operator::NbJoin(
            NbJoin::new(0, seq(&fx, "R", "r", &q), seq(&fx, "S", "s", &q), &q).unwrap(),
        );
        let rows = run(&mut nb, &fx.env);
        assert_eq!(6000, rows.len());
        for row in rows {
            assert_eq!((row[0] % 50) * 2, row[2]);
        }
    }

    #[test]
    fn test_cross_product() {
        let fx = fixture(&[
            ("R", &["_id"], vec![vec![1], vec![2]]),
            ("S", &["_id"], vec![vec![7], vec![8], vec![9]]),
        ]);
        let q = Query::new()
            .table("R", "r")
            .table("S", "s")
            .output("r._id")
            .output("s._id");
        let (nl, nb) = both(&fx, &q);
        assert_eq!(6, nb.len());
        assert!(compare_unordered(&nl, nb));
    }

    #[test]
    fn test_oversized_tuple() {
        init();
        let dir = gen_random_dir();
        let wide = "x".repeat(NBJOIN_BUFSIZE + 10);
        write_lines(dir.join("r.0"), &[format!("1|{}", wide)]);
        write_int_file(dir.join("s.0"), &[vec![1]]);
        let r = common::table::Table::new(
            "R".to_string(),
            common::TableSchema::from_vecs(vec!["_id", "w"], vec![DataType::Int, DataType::String]),
            vec![common::table::Partition::new(0, "r.0")],
        );
        let s = common::table::Table::new(
            "S".to_string(),
            common::TableSchema::from_vecs(vec!["_id"], vec![DataType::Int]),
            vec![common::table::Partition::new(0, "s.0")],
        );
        let q = Query::new()
            .table("R", "r")
            .table("S", "s")
            .output("r.w")
            .join("r._id", "s._id");
        let left = SeqScan::new(0, "r", &r, "r.0", &q, None).unwrap();
        let right = SeqScan::new(0, "s", &s, "s.0", &q, None).unwrap();
        let mut op = NbJoin::new(0, Operator::SeqScan(left), Operator::SeqScan(right), &q).unwrap();
        let store = memstore::storage_manager::StorageManager::new_test_sm();
        let env = ExecEnv::new(0, &dir, Arc::new(store));
        op.open(None, &env).unwrap();
        match op.next() {
            Err(DbError::ResourceError(_)) => {}
            other => panic!("expected a resource error, got {:?}", other),
        }
        op.close().unwrap();
        std::fs::remove_dir_all(dir).unwrap();
    }
}
