use bytes::Bytes;
use common::ids::{ColId, NodeId};
use common::{DataType, DbError, Query, Tuple, ROW_DELIM};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::io::ExecEnv;

pub use self::dummy::Dummy;
pub use self::indexscan::IndexScan;
pub use self::join::{Join, JoinCond};
pub use self::material::Material;
pub use self::nbjoin::NbJoin;
pub use self::nljoin::NlJoin;
pub use self::remote::{fire_and_forget, Remote};
pub use self::scan::{Restriction, Scan};
pub use self::seqscan::SeqScan;
pub use self::union::{Union, UnionMode};

mod dummy;
mod indexscan;
mod join;
mod material;
mod nbjoin;
mod nljoin;
mod remote;
mod scan;
mod seqscan;
mod union;

/// Iterator protocol every physical operator follows.
///
/// `open` is paired with exactly one `close`. `reopen` restarts iteration, optionally with a
/// new correlated key, without acquiring resources again. `next` may be called until it
/// returns `None`.
pub trait OpIterator {
    /// Acquires per-execution resources.
    ///
    /// # Arguments
    ///
    /// * `key` - Correlated key pushed down by an index nested-loop join.
    /// * `env` - The executing node.
    fn open(&mut self, key: Option<&[u8]>, env: &Arc<ExecEnv>) -> Result<(), DbError>;

    fn reopen(&mut self, key: Option<&[u8]>) -> Result<(), DbError>;

    /// Returns the next tuple, or `None` at the end of the input.
    fn next(&mut self) -> Result<Option<Tuple>, DbError>;

    fn close(&mut self) -> Result<(), DbError>;

    /// Node that must execute this operator.
    fn node_id(&self) -> NodeId;

    /// Whether the operator outputs `col` (`alias.field`) or any field of alias `col`.
    fn has_col(&self, col: &str) -> bool;

    /// Position of `col` in the output tuples.
    fn output_col_id(&self, col: &str) -> Option<ColId>;

    fn col_type(&self, col: &str) -> Option<DataType>;

    fn num_output_cols(&self) -> usize;

    fn est_cost(&self) -> f64;

    /// Cost of each execution after the first.
    fn rescan_cost(&self) -> f64 {
        self.est_cost()
    }

    fn est_cardinality(&self) -> f64;

    /// Average bytes of an output column, delimiter included.
    fn est_col_length(&self, col: ColId) -> f64;

    fn est_tuple_length(&self) -> f64 {
        (0..self.num_output_cols())
            .map(|c| self.est_col_length(c))
            .sum()
    }

    /// Distinct values of an output column.
    fn est_distinct(&self, col: ColId) -> f64;
}

/// State that only lives during one execution. Cloning a plan never copies it, so a cloned
/// plan starts fresh and shares nothing mutable with the original.
#[derive(Default)]
pub struct ExecState<T: Default>(T);

impl<T: Default> fmt::Debug for ExecState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExecState")
    }
}

impl<T: Default> Clone for ExecState<T> {
    fn clone(&self) -> Self {
        ExecState(T::default())
    }
}

impl<T: Default> Deref for ExecState<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: Default> DerefMut for ExecState<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// A physical plan node.
#[derive(Clone, Debug)]
pub enum Operator {
    SeqScan(SeqScan),
    IndexScan(IndexScan),
    NlJoin(NlJoin),
    NbJoin(NbJoin),
    Union(Union),
    Remote(Remote),
    Material(Material),
    Dummy(Dummy),
}

macro_rules! dispatch {
    ($self:expr, $op:ident => $e:expr) => {
        match $self {
            Operator::SeqScan($op) => $e,
            Operator::IndexScan($op) => $e,
            Operator::NlJoin($op) => $e,
            Operator::NbJoin($op) => $e,
            Operator::Union($op) => $e,
            Operator::Remote($op) => $e,
            Operator::Material($op) => $e,
            Operator::Dummy($op) => $e,
        }
    };
}

impl OpIterator for Operator {
    fn open(&mut self, key: Option<&[u8]>, env: &Arc<ExecEnv>) -> Result<(), DbError> {
        dispatch!(self, op => op.open(key, env))
    }

    fn reopen(&mut self, key: Option<&[u8]>) -> Result<(), DbError> {
        dispatch!(self, op => op.reopen(key))
    }

    fn next(&mut self) -> Result<Option<Tuple>, DbError> {
        dispatch!(self, op => op.next())
    }

    fn close(&mut self) -> Result<(), DbError> {
        dispatch!(self, op => op.close())
    }

    fn node_id(&self) -> NodeId {
        dispatch!(self, op => op.node_id())
    }

    fn has_col(&self, col: &str) -> bool {
        dispatch!(self, op => op.has_col(col))
    }

    fn output_col_id(&self, col: &str) -> Option<ColId> {
        dispatch!(self, op => op.output_col_id(col))
    }

    fn col_type(&self, col: &str) -> Option<DataType> {
        dispatch!(self, op => op.col_type(col))
    }

    fn num_output_cols(&self) -> usize {
        dispatch!(self, op => op.num_output_cols())
    }

    fn est_cost(&self) -> f64 {
        dispatch!(self, op => op.est_cost())
    }

    fn rescan_cost(&self) -> f64 {
        dispatch!(self, op => op.rescan_cost())
    }

    fn est_cardinality(&self) -> f64 {
        dispatch!(self, op => op.est_cardinality())
    }

    fn est_col_length(&self, col: ColId) -> f64 {
        dispatch!(self, op => op.est_col_length(col))
    }

    fn est_tuple_length(&self) -> f64 {
        dispatch!(self, op => op.est_tuple_length())
    }

    fn est_distinct(&self, col: ColId) -> f64 {
        dispatch!(self, op => op.est_distinct(col))
    }
}

impl Operator {
    fn kind(&self) -> &'static str {
        match self {
            Operator::SeqScan(_) => "SeqScan",
            Operator::IndexScan(_) => "IndexScan",
            Operator::NlJoin(_) => "NLJoin",
            Operator::NbJoin(_) => "NBJoin",
            Operator::Union(_) => "Union",
            Operator::Remote(_) => "Remote",
            Operator::Material(_) => "Material",
            Operator::Dummy(_) => "Dummy",
        }
    }

    /// Direct children, outer side first.
    pub fn children(&self) -> Vec<&Operator> {
        match self {
            Operator::NlJoin(j) => vec![j.join.left.as_ref(), j.join.right.as_ref()],
            Operator::NbJoin(j) => vec![j.join.left.as_ref(), j.join.right.as_ref()],
            Operator::Union(u) => u.children.iter().collect(),
            Operator::Remote(r) => vec![r.child.as_ref()],
            Operator::Material(m) => vec![m.child.as_ref()],
            _ => Vec::new(),
        }
    }

    fn fmt_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let detail = match self {
            Operator::SeqScan(s) => {
                format!(" {} as {} [{}]", s.scan.table, s.scan.alias, s.scan.file)
            }
            Operator::IndexScan(s) => format!(
                " {} as {} [{}] on {}{}",
                s.scan.table,
                s.scan.alias,
                s.scan.file,
                s.index_name,
                if s.literal.is_none() { " (correlated)" } else { "" }
            ),
            Operator::Union(u) => match u.mode {
                UnionMode::Plain => String::new(),
                UnionMode::Pivot(_) => String::from(" (pivot)"),
            },
            Operator::Remote(r) => format!(" from {}", r.addr),
            _ => String::new(),
        };
        writeln!(
            f,
            "{:indent$}{}@{}{} cost={:.2} card={:.2}",
            "",
            self.kind(),
            self.node_id(),
            detail,
            self.est_cost(),
            self.est_cardinality(),
            indent = depth * 2
        )?;
        for child in self.children() {
            child.fmt_tree(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_tree(f, 0)
    }
}

/// Input columns an operator outputs for `query`: the requested fields it has, then the
/// join fields whose other side lives outside the operator. Duplicates are dropped.
///
/// # Arguments
///
/// * `query` - Query being planned.
/// * `has_col` - Whether the operator sees a column.
/// * `input_col_id` - Position of a column in the operator's input.
pub(crate) fn project_cols<H, I>(
    query: &Query,
    has_col: H,
    input_col_id: I,
) -> Result<Vec<ColId>, DbError>
where
    H: Fn(&str) -> bool,
    I: Fn(&str) -> Option<ColId>,
{
    let mut selected = Vec::new();
    let mut add = |col: &str| -> Result<(), DbError> {
        let id = input_col_id(col)
            .ok_or_else(|| DbError::ProtocolError(format!("unknown column {}", col)))?;
        if !selected.contains(&id) {
            selected.push(id);
        }
        Ok(())
    };
    for col in &query.output_fields {
        if has_col(col) {
            add(col)?;
        }
    }
    for (l, r) in &query.join_fields {
        if has_col(l) && !has_col(r) {
            add(l)?;
        } else if has_col(r) && !has_col(l) {
            add(r)?;
        }
    }
    Ok(selected)
}

/// The line starting at `pos` and the position after its terminator.
pub(crate) fn next_line(buf: &Bytes, pos: usize) -> Option<(Bytes, usize)> {
    if pos >= buf.len() {
        return None;
    }
    match buf[pos..].iter().position(|b| *b == ROW_DELIM) {
        Some(end) => Some((buf.slice(pos..pos + end), pos + end + 1)),
        None => Some((buf.slice(pos..), buf.len())),
    }
}

/// Picks output columns out of a tuple.
pub(crate) fn project(tuple: &Tuple, selected: &[ColId]) -> Tuple {
    Tuple::new(
        selected
            .iter()
            .filter_map(|i| tuple.get(*i).cloned())
            .collect(),
    )
}
