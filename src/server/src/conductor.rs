use crate::server_state::ServerState;
use common::catalog::Catalog;
use common::ids::{NodeId, COORDINATOR};
use common::{DbError, Query, QueryResult, Value};
use optimizer::{Planner, StatsCatalog};
use queryexe::opiterator::fire_and_forget;
use queryexe::query::Executor;
use queryexe::Operator;
use std::sync::Arc;

/// Turns queries into distributed plans and runs them from the coordinator.
pub struct Conductor {
    state: Arc<ServerState>,
    executor: Executor,
}

impl Conductor {
    /// # Arguments
    ///
    /// * `state` - The coordinating node.
    pub fn new(state: Arc<ServerState>) -> Result<Self, DbError> {
        if state.node() != COORDINATOR {
            return Err(DbError::ExecutionError(format!(
                "queries are coordinated by node {}, not node {}",
                COORDINATOR,
                state.node()
            )));
        }
        let executor = Executor::new_ref(state.env.clone());
        Ok(Conductor { state, executor })
    }

    /// Statistics the planner works from, gathered from every node on first use.
    pub fn pretreat(&self) -> Result<Arc<StatsCatalog>, DbError> {
        self.state.stats()
    }

    /// Picks the cheapest plan for `query`.
    pub fn plan(&self, query: &Query) -> Result<Operator, DbError> {
        let stats = self.pretreat()?;
        Planner::new(&self.state.db, &stats, query).plan()
    }

    /// Plans `query` and starts it. Rows are then pulled with `fetch_row`.
    pub fn run_query(&mut self, query: &Query) -> Result<(), DbError> {
        self.executor.close()?;
        let plan = self.plan(query)?;
        self.executor.configure_query(plan, &query.output_fields)?;
        self.executor.start()
    }

    /// Next row of the running query. The query is closed once its rows run out or it fails.
    pub fn fetch_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        match self.executor.fetch_row() {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                self.executor.close()?;
                Ok(None)
            }
            Err(e) => {
                if let Err(close_err) = self.executor.close() {
                    debug!("conductor: close after failure: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Runs `query` to completion and formats its rows.
    pub fn execute(&mut self, query: &Query) -> Result<QueryResult, DbError> {
        self.executor.close()?;
        let plan = self.plan(query)?;
        self.executor.configure_query(plan, &query.output_fields)?;
        self.executor.execute()
    }

    /// Has `node` run `plan` without sending back its rows.
    pub fn fire(&self, node: NodeId, plan: &Operator) -> Result<(), DbError> {
        fire_and_forget(&self.state.env, node, &self.state.db.node_addr(node)?, plan)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::*;
    use common::table::Table;
    use common::testutil::*;
    use common::{DataType, TableSchema};

    fn ints(rows: Vec<Vec<Value>>) -> Vec<Vec<i64>> {
        rows.into_iter()
            .map(|r| r.iter().map(|v| v.as_int().unwrap()).collect())
            .collect()
    }

    fn drain(conductor: &mut Conductor, query: &Query) -> Vec<Vec<i64>> {
        conductor.run_query(query).unwrap();
        let mut rows = Vec::new();
        while let Some(row) = conductor.fetch_row().unwrap() {
            rows.push(row);
        }
        ints(rows)
    }

    /// R(_id, fk) lives on node 1. S(_id, v) is split by key over nodes 0 and 1.
    fn two_node_cluster() -> TestCluster {
        let r = Table::new(
            "R".to_string(),
            TableSchema::from_vecs(vec!["_id", "fk"], vec![DataType::Int, DataType::Int]),
            vec![],
        );
        let s = Table::new(
            "S".to_string(),
            TableSchema::from_vecs(vec!["_id", "v"], vec![DataType::Int, DataType::Int]),
            vec![],
        );
        TestCluster::start(
            2,
            vec![
                (r, vec![(1, "r.1", vec![vec![1, 10], vec![2, 21], vec![3, 11], vec![4, 99]])]),
                (
                    s,
                    vec![
                        (0, "s.0", vec![vec![10, 100], vec![11, 110], vec![12, 120]]),
                        (1, "s.1", vec![vec![20, 200], vec![21, 210]]),
                    ],
                ),
            ],
        )
    }

    #[test]
    fn test_distributed_join() {
        init();
        let cluster = two_node_cluster();
        let mut conductor = Conductor::new(cluster.coordinator()).unwrap();
        let q = Query::new()
            .table("R", "r")
            .table("S", "s")
            .output("r._id")
            .output("s.v")
            .join("r.fk", "s._id");
        let rows = drain(&mut conductor, &q);
        assert!(compare_unordered(
            &rows,
            vec![vec![1, 100], vec![2, 210], vec![3, 110]]
        ));
        // Statistics of node 1's partitions were fetched over the network.
        let stats = conductor.pretreat().unwrap();
        assert_eq!(2, stats.partitions("S").len());
        assert_eq!(1, stats.partitions("R")[0][0].node);
    }

    #[test]
    fn test_restrictions_reach_remote_partitions() {
        init();
        let cluster = two_node_cluster();
        let mut conductor = Conductor::new(cluster.coordinator()).unwrap();

        let q = Query::new().table("S", "s").output("s.v").eq("s._id", Value::Int(21));
        assert_eq!(vec![vec![210]], drain(&mut conductor, &q));

        let q = Query::new().table("S", "s").output("s._id").gt("s._id", Value::Int(11));
        assert!(compare_unordered(
            &drain(&mut conductor, &q),
            vec![vec![12], vec![20], vec![21]]
        ));

        // Pruned to nothing.
        let q = Query::new().table("S", "s").output("s._id").eq("s._id", Value::Int(15));
        assert!(drain(&mut conductor, &q).is_empty());

        let result = conductor
            .execute(&Query::new().table("R", "r").output("r.fk").gt("r._id", Value::Int(3)))
            .unwrap();
        let lines: Vec<&str> = result.result().lines().collect();
        assert_eq!(2, lines.len());
        assert_eq!("99", lines[1].trim());
    }

    #[test]
    fn test_replicas_are_read_once() {
        init();
        let t = Table::new(
            "T".to_string(),
            TableSchema::from_vecs(vec!["_id", "v"], vec![DataType::Int, DataType::Int]),
            vec![],
        );
        let rows = vec![vec![1, 5], vec![2, 6], vec![3, 7]];
        let cluster = TestCluster::start(
            2,
            vec![(t, vec![(0, "t.a", rows.clone()), (1, "t.b", rows.clone())])],
        );
        let mut conductor = Conductor::new(cluster.coordinator()).unwrap();
        let q = Query::new()
            .table("T", "t")
            .output("t._id")
            .output("t.v");
        assert!(compare_unordered(&drain(&mut conductor, &q), rows));
    }

    #[test]
    fn test_only_coordinator_conducts() {
        init();
        let cluster = two_node_cluster();
        assert!(Conductor::new(cluster.states[1].clone()).is_err());
        let mut conductor = Conductor::new(cluster.coordinator()).unwrap();
        let bad = Query::new().table("Nope", "n").output("n._id");
        assert!(conductor.run_query(&bad).is_err());
        assert!(conductor.fetch_row().is_err());
    }
}
