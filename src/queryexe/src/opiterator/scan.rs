use common::ids::{ColId, NodeId};
use common::query::belongs_to;
use common::stats::{PartStats, DEFAULT_DISTINCT};
use common::table::Table;
use common::{compare_columns, DataType, DbError, PredicateOp, Query, Tuple, Value};
use std::cmp::Ordering;
use std::sync::Arc;

use super::project_cols;
use crate::cost::{SELECTIVITY_EQ, SELECTIVITY_GT};

/// A literal predicate on one column of a scanned table.
#[derive(Clone, Debug, PartialEq)]
pub struct Restriction {
    pub col: ColId,
    pub op: PredicateOp,
    pub value: Value,
}

impl Restriction {
    /// Whether the column satisfies the predicate.
    pub fn matches(&self, col: &[u8]) -> bool {
        match (self.op, self.value.cmp_column(col)) {
            (PredicateOp::Equals, Some(Ordering::Equal)) => true,
            (PredicateOp::GreaterThan, Some(Ordering::Greater)) => true,
            _ => false,
        }
    }
}

/// What sequential and index scans share: the partition, its schema, the pushed-down
/// predicates and the projection.
#[derive(Clone, Debug)]
pub struct Scan {
    pub(crate) node: NodeId,
    pub(crate) alias: String,
    pub(crate) table: String,
    pub(crate) file: String,
    /// Table schema as (field, type).
    pub(crate) fields: Vec<(String, DataType)>,
    /// Schema positions of the output columns.
    pub(crate) selected: Vec<ColId>,
    pub(crate) filters: Vec<Restriction>,
    /// Equalities between two columns of the same record.
    pub(crate) self_joins: Vec<(ColId, ColId, DataType)>,
    /// Only known while planning.
    pub(crate) stats: Option<Arc<PartStats>>,
}

impl Scan {
    /// Builds the scan of one partition for `query`.
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
        let mut scan = Scan {
            node,
            alias: alias.to_string(),
            table: table.name.clone(),
            file: file.to_string(),
            fields: table
                .schema
                .attributes()
                .map(|a| (a.name().to_string(), a.dtype))
                .collect(),
            selected: Vec::new(),
            filters: Vec::new(),
            self_joins: Vec::new(),
            stats,
        };
        for (col, value, op) in query.restrictions() {
            if scan.has_col(col) {
                let id = scan.require(col)?;
                scan.filters.push(Restriction {
                    col: id,
                    op,
                    value: value.clone(),
                });
            }
        }
        for (l, r) in &query.join_fields {
            if scan.has_col(l) && scan.has_col(r) {
                let (lid, rid) = (scan.require(l)?, scan.require(r)?);
                scan.self_joins.push((lid, rid, scan.fields[lid].1));
            }
        }
        scan.selected = project_cols(query, |c| scan.has_col(c), |c| scan.input_col_id(c))?;
        Ok(scan)
    }

    fn require(&self, col: &str) -> Result<ColId, DbError> {
        self.input_col_id(col)
            .ok_or_else(|| DbError::ProtocolError(format!("unknown column {}", col)))
    }

    pub fn has_col(&self, col: &str) -> bool {
        belongs_to(col, &self.alias)
    }

    /// Position of `col` in the table schema.
    pub fn input_col_id(&self, col: &str) -> Option<ColId> {
        if !self.has_col(col) {
            return None;
        }
        let field = Query::field_of(col);
        self.fields.iter().position(|(name, _)| name == field)
    }

    pub fn output_col_id(&self, col: &str) -> Option<ColId> {
        let id = self.input_col_id(col)?;
        self.selected.iter().position(|s| *s == id)
    }

    pub fn col_type(&self, col: &str) -> Option<DataType> {
        self.input_col_id(col).map(|id| self.fields[id].1)
    }

    pub fn num_output_cols(&self) -> usize {
        self.selected.len()
    }

    /// Whether a record passes every pushed-down predicate. Records with the wrong arity
    /// never do.
    pub fn matches(&self, tuple: &Tuple) -> bool {
        if tuple.size() != self.fields.len() {
            return false;
        }
        let filters_ok = self.filters.iter().all(|f| match tuple.get(f.col) {
            Some(col) => f.matches(col),
            None => false,
        });
        filters_ok
            && self.self_joins.iter().all(|(l, r, t)| {
                match (tuple.get(*l), tuple.get(*r)) {
                    (Some(a), Some(b)) => compare_columns(a, b, *t) == Some(Ordering::Equal),
                    _ => false,
                }
            })
    }

    pub fn project(&self, tuple: &Tuple) -> Tuple {
        super::project(tuple, &self.selected)
    }

    pub fn pages(&self) -> f64 {
        self.stats.as_ref().map(|s| s.num_pages as f64).unwrap_or(0.0)
    }

    pub fn cardinality(&self) -> f64 {
        self.stats.as_ref().map(|s| s.cardinality).unwrap_or(0.0)
    }

    /// Distinct values of a schema column.
    pub fn distinct(&self, col: ColId) -> f64 {
        self.stats
            .as_ref()
            .map(|s| s.distinct(col))
            .unwrap_or(DEFAULT_DISTINCT)
    }

    /// Fraction of records surviving the pushed-down predicates.
    pub fn selectivity(&self) -> f64 {
        let mut sel = 1.0;
        for f in &self.filters {
            sel *= match f.op {
                PredicateOp::Equals => 1.0 / self.distinct(f.col),
                PredicateOp::GreaterThan => SELECTIVITY_GT,
            };
        }
        for _ in &self.self_joins {
            sel *= SELECTIVITY_EQ;
        }
        sel
    }

    pub fn est_col_length(&self, col: ColId) -> f64 {
        match (self.selected.get(col), &self.stats) {
            (Some(id), Some(stats)) => stats.col_length(*id),
            _ => 0.0,
        }
    }

    pub fn est_distinct(&self, col: ColId) -> f64 {
        match self.selected.get(col) {
            Some(id) => self.distinct(*id),
            None => DEFAULT_DISTINCT,
        }
    }
}
