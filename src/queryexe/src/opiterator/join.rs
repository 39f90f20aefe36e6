use bytes::Bytes;
use common::ids::{ColId, NodeId};
use common::stats::DEFAULT_DISTINCT;
use common::{compare_columns, DataType, DbError, Query, Tuple};
use std::cmp::Ordering;

use super::{project_cols, OpIterator, Operator};

/// An equality between a left output column and a right output column.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JoinCond {
    pub left: ColId,
    pub right: ColId,
    pub dtype: DataType,
}

/// What both join operators share: the children, the conditions checked on each pair and
/// the projection over the concatenated left and right columns.
#[derive(Clone, Debug)]
pub struct Join {
    pub(crate) node: NodeId,
    pub(crate) left: Box<Operator>,
    pub(crate) right: Box<Operator>,
    /// Output columns as positions in left ‖ right.
    pub(crate) selected: Vec<ColId>,
    pub(crate) conds: Vec<JoinCond>,
}

impl Join {
    /// Resolves the join conditions of `query` that connect the two children.
    ///
    /// # Arguments
    ///
    /// * `node` - Node executing the join.
    /// * `left` - Outer child.
    /// * `right` - Inner child.
    /// * `query` - Query being planned.
    /// * `skip` - Position in `query.join_fields` of a condition the inner child already
    ///   enforces.
    pub fn new(
        node: NodeId,
        left: Operator,
        right: Operator,
        query: &Query,
        skip: Option<usize>,
    ) -> Result<Self, DbError> {
        let mut join = Join {
            node,
            left: Box::new(left),
            right: Box::new(right),
            selected: Vec::new(),
            conds: Vec::new(),
        };
        for (i, (a, b)) in query.join_fields.iter().enumerate() {
            if Some(i) == skip {
                continue;
            }
            let (l, r) = if join.left.has_col(a) && join.right.has_col(b) {
                (a, b)
            } else if join.left.has_col(b) && join.right.has_col(a) {
                (b, a)
            } else {
                continue;
            };
            let cond = JoinCond {
                left: join.left.output_col_id(l).ok_or_else(|| unknown(l))?,
                right: join.right.output_col_id(r).ok_or_else(|| unknown(r))?,
                dtype: join.left.col_type(l).ok_or_else(|| unknown(l))?,
            };
            join.conds.push(cond);
        }
        join.selected = project_cols(query, |c| join.has_col(c), |c| join.input_col_id(c))?;
        Ok(join)
    }

    pub(crate) fn from_parts(
        node: NodeId,
        left: Operator,
        right: Operator,
        selected: Vec<ColId>,
        conds: Vec<JoinCond>,
    ) -> Self {
        Join {
            node,
            left: Box::new(left),
            right: Box::new(right),
            selected,
            conds,
        }
    }

    pub fn has_col(&self, col: &str) -> bool {
        self.left.has_col(col) || self.right.has_col(col)
    }

    /// Position of `col` in left ‖ right.
    pub fn input_col_id(&self, col: &str) -> Option<ColId> {
        if self.left.has_col(col) {
            self.left.output_col_id(col)
        } else {
            self.right
                .output_col_id(col)
                .map(|c| c + self.left.num_output_cols())
        }
    }

    pub fn output_col_id(&self, col: &str) -> Option<ColId> {
        let id = self.input_col_id(col)?;
        self.selected.iter().position(|s| *s == id)
    }

    pub fn col_type(&self, col: &str) -> Option<DataType> {
        if self.left.has_col(col) {
            self.left.col_type(col)
        } else {
            self.right.col_type(col)
        }
    }

    /// Whether a pair satisfies every condition.
    pub fn matches(&self, left: &Tuple, right: &Tuple) -> bool {
        self.conds.iter().all(|c| match (left.get(c.left), right.get(c.right)) {
            (Some(l), Some(r)) => compare_columns(l, r, c.dtype) == Some(Ordering::Equal),
            _ => false,
        })
    }

    pub fn project(&self, left: &Tuple, right: &Tuple) -> Tuple {
        let arity = left.size();
        let columns: Vec<Bytes> = self
            .selected
            .iter()
            .filter_map(|id| {
                if *id < arity {
                    left.get(*id).cloned()
                } else {
                    right.get(*id - arity).cloned()
                }
            })
            .collect();
        Tuple::new(columns)
    }

    /// Output size of joining `left` records with `right` records.
    pub fn cardinality(&self, left: f64, right: f64) -> f64 {
        self.conds.iter().fold(left * right, |card, c| {
            let d = self
                .left
                .est_distinct(c.left)
                .max(self.right.est_distinct(c.right));
            card / d.max(1.0)
        })
    }

    fn side(&self, col: ColId) -> (&Operator, ColId) {
        let id = self.selected.get(col).copied().unwrap_or(usize::MAX);
        let arity = self.left.num_output_cols();
        if id < arity {
            (self.left.as_ref(), id)
        } else {
            (self.right.as_ref(), id.saturating_sub(arity))
        }
    }

    pub fn est_col_length(&self, col: ColId) -> f64 {
        let (op, id) = self.side(col);
        if id < op.num_output_cols() {
            op.est_col_length(id)
        } else {
            0.0
        }
    }

    pub fn est_distinct(&self, col: ColId) -> f64 {
        let (op, id) = self.side(col);
        if id < op.num_output_cols() {
            op.est_distinct(id)
        } else {
            DEFAULT_DISTINCT
        }
    }

    pub fn num_output_cols(&self) -> usize {
        self.selected.len()
    }
}

fn unknown(col: &str) -> DbError {
    DbError::ProtocolError(format!("unknown column {}", col))
}

#[cfg(test)]
mod test {
    use super::super::testutil::*;
    use super::super::SeqScan;
    use super::*;
    use common::catalog::Catalog;
    use common::testutil::int_vec_to_tuple;

    #[test]
    fn test_conditions_and_projection() {
        let fx = fixture(&[
            ("R", &["_id", "fk"], vec![vec![1, 2]]),
            ("S", &["_id", "v"], vec![vec![2, 7]]),
        ]);
        let q = Query::new()
            .table("R", "r")
            .table("S", "s")
            .output("s.v")
            .output("r._id")
            .join("s._id", "r.fk");
        let r = SeqScan::new(0, "r", fx.db.get_table("R").unwrap(), "r.0", &q, None).unwrap();
        let s = SeqScan::new(0, "s", fx.db.get_table("S").unwrap(), "s.0", &q, None).unwrap();
        let join = Join::new(0, Operator::SeqScan(r), Operator::SeqScan(s), &q, None).unwrap();
        assert_eq!(
            vec![JoinCond {
                left: 1,
                right: 1,
                dtype: DataType::Int
            }],
            join.conds
        );
        assert_eq!(vec![2, 0], join.selected);
        assert_eq!(Some(0), join.output_col_id("s.v"));
        assert_eq!(None, join.output_col_id("r.fk"));

        let left = int_vec_to_tuple(vec![1, 2]);
        // The inner scan outputs s.v, then the join field s._id.
        let right = int_vec_to_tuple(vec![7, 2]);
        assert!(join.matches(&left, &right));
        assert!(!join.matches(&left, &int_vec_to_tuple(vec![7, 3])));
        assert_eq!(int_vec_to_tuple(vec![7, 1]), join.project(&left, &right));

        let skipped =
            Join::new(0, *join.left.clone(), *join.right.clone(), &q, Some(0)).unwrap();
        assert!(skipped.conds.is_empty());
    }
}
