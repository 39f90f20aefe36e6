use crate::io::ExecEnv;
use crate::opiterator::{OpIterator, Operator};
use common::ids::ColId;
use common::{DataType, DbError, QueryResult, Tuple, Value};
use std::sync::Arc;

/// Drives one query's physical plan on the coordinating node and maps its output columns
/// back to the fields the caller asked for.
pub struct Executor {
    /// Executor state
    pub plan: Option<Operator>,
    env: Arc<ExecEnv>,
    /// Requested field, its column in the plan output and its type.
    fields: Vec<(String, ColId, DataType)>,
    open: bool,
}

impl Executor {
    /// Initializes an executor bound to the node it runs on.
    ///
    /// # Arguments
    ///
    /// * `env` - The coordinating node.
    pub fn new_ref(env: Arc<ExecEnv>) -> Self {
        Self {
            plan: None,
            env,
            fields: Vec::new(),
            open: false,
        }
    }

    /// Installs the plan to run and resolves the output fields against it.
    ///
    /// # Arguments
    ///
    /// * `physical_plan` - Root of the plan. It must run on this executor's node.
    /// * `output_fields` - Requested columns (`alias.field`), in output order.
    pub fn configure_query(
        &mut self,
        physical_plan: Operator,
        output_fields: &[String],
    ) -> Result<(), DbError> {
        if physical_plan.node_id() != self.env.node {
            return Err(DbError::ExecutionError(format!(
                "plan runs on node {}, executor on node {}",
                physical_plan.node_id(),
                self.env.node
            )));
        }
        let mut fields = Vec::with_capacity(output_fields.len());
        if !matches!(physical_plan, Operator::Dummy(_)) {
            for f in output_fields {
                let col = physical_plan.output_col_id(f).ok_or_else(|| {
                    DbError::ExecutionError(format!("plan does not output {}", f))
                })?;
                let dtype = physical_plan.col_type(f).ok_or_else(|| {
                    DbError::ExecutionError(format!("plan does not type {}", f))
                })?;
                fields.push((f.clone(), col, dtype));
            }
        }
        self.fields = fields;
        self.plan = Some(physical_plan);
        self.open = false;
        Ok(())
    }

    fn plan_mut(&mut self) -> Result<&mut Operator, DbError> {
        self.plan
            .as_mut()
            .ok_or_else(|| DbError::ExecutionError(String::from("No plan configured")))
    }

    /// Opens the physical plan to begin execution.
    pub fn start(&mut self) -> Result<(), DbError> {
        let env = self.env.clone();
        self.plan_mut()?.open(None, &env)?;
        self.open = true;
        Ok(())
    }

    /// Returns the next tuple of the plan output or None if there is no such tuple.
    pub fn next(&mut self) -> Result<Option<Tuple>, DbError> {
        if !self.open {
            return Err(DbError::ExecutionError(String::from("Executor not started")));
        }
        self.plan_mut()?.next()
    }

    /// Returns the requested fields of the next row as typed values.
    pub fn fetch_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        let tuple = match self.next()? {
            Some(t) => t,
            None => return Ok(None),
        };
        self.fields
            .iter()
            .map(|(name, col, dtype)| {
                let raw = tuple.get(*col).ok_or_else(|| {
                    DbError::ExecutionError(format!("row is missing {}", name))
                })?;
                Value::from_column(raw, *dtype)
            })
            .collect::<Result<Vec<Value>, DbError>>()
            .map(Some)
    }

    /// Closes the physical plan.
    pub fn close(&mut self) -> Result<(), DbError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.plan_mut()?.close()
    }

    /// Runs the plan to completion and stores the result in a QueryResult.
    pub fn execute(&mut self) -> Result<QueryResult, DbError> {
        let width = self
            .fields
            .iter()
            .map(|(name, _, _)| name.len())
            .max()
            .unwrap_or(10)
            + 2;
        let mut res = String::new();
        for (name, _, _) in &self.fields {
            res += &format!("{:width$}", name, width = width);
        }
        res += "\n";

        self.start()?;
        let mut rows = 0;
        let outcome = loop {
            match self.fetch_row() {
                Ok(Some(row)) => {
                    for v in row {
                        res += &format!("{:width$}", v.to_string(), width = width);
                    }
                    res += "\n";
                    rows += 1;
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let closed = self.close();
        outcome?;
        closed?;
        debug!("executor: {} rows", rows);
        Ok(QueryResult::new(&res))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::opiterator::testutil::*;
    use crate::opiterator::{Dummy, NlJoin, SeqScan};
    use common::catalog::Catalog;
    use common::Query;

    #[test]
    fn test_fetch_row_maps_fields() {
        let fx = fixture(&[
            ("R", &["_id", "fk"], vec![vec![1, 10], vec![2, 20]]),
            ("S", &["_id", "v"], vec![vec![10, 100], vec![20, 200]]),
        ]);
        let q = Query::new()
            .table("R", "r")
            .table("S", "s")
            .output("s.v")
            .output("r._id")
            .join("r.fk", "s._id");
        let r = SeqScan::new(0, "r", fx.db.get_table("R").unwrap(), "r.0", &q, None).unwrap();
        let s = SeqScan::new(0, "s", fx.db.get_table("S").unwrap(), "s.0", &q, None).unwrap();
        let plan = NlJoin::new(0, Operator::SeqScan(r), Operator::SeqScan(s), &q).unwrap();

        let mut exec = Executor::new_ref(fx.env.clone());
        assert!(exec.start().is_err());
        exec.configure_query(Operator::NlJoin(plan), &q.output_fields)
            .unwrap();
        exec.start().unwrap();
        let mut rows = Vec::new();
        while let Some(row) = exec.fetch_row().unwrap() {
            rows.push(row);
        }
        exec.close().unwrap();
        rows.sort();
        assert_eq!(
            vec![
                vec![Value::Int(100), Value::Int(1)],
                vec![Value::Int(200), Value::Int(2)]
            ],
            rows
        );
        assert!(exec.next().is_err());

        let result = exec.execute().unwrap();
        let lines: Vec<&str> = result.result().lines().collect();
        assert_eq!(3, lines.len());
        assert!(lines[0].starts_with("s.v"));
    }

    #[test]
    fn test_dummy_and_wrong_node() {
        let fx = fixture(&[("T", &["_id"], vec![vec![1]])]);
        let mut exec = Executor::new_ref(fx.env.clone());
        let fields = vec!["t._id".to_string()];
        exec.configure_query(Operator::Dummy(Dummy::new(0)), &fields)
            .unwrap();
        exec.start().unwrap();
        assert!(exec.fetch_row().unwrap().is_none());
        exec.close().unwrap();
        assert!(exec
            .configure_query(Operator::Dummy(Dummy::new(3)), &fields)
            .is_err());
    }
}
