use rand::prelude::*;
use rand::rngs::StdRng;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use common::database::{Database, Node};
use common::ids::NodeId;
use common::DbError;
use server::{serve_forever, Conductor, ServerState};

use crate::datagen::{write_partition, TableTemplate};

/// A cluster whose nodes run as threads of this process, each on its own loopback port
/// and data directory.
pub struct LocalCluster {
    pub db: Database,
    pub states: Vec<Arc<ServerState>>,
    dir: PathBuf,
}

impl LocalCluster {
    /// Generates the tables and starts `nodes` nodes serving them.
    ///
    /// # Arguments
    ///
    /// * `nodes` - Cluster size.
    /// * `tables` - Tables to generate.
    /// * `seed` - Seed of the data generator.
    pub fn start(nodes: usize, tables: &[TableTemplate], seed: u64) -> Result<Self, DbError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let dir = std::env::temp_dir().join(format!("sharddb-{}", rng.gen::<u32>()));
        let listeners = (0..nodes)
            .map(|_| TcpListener::bind("127.0.0.1:0"))
            .collect::<Result<Vec<TcpListener>, _>>()?;

        let mut db = Database::new("local".to_string());
        for (i, l) in listeners.iter().enumerate() {
            db.add_node(Node::new(i as NodeId, "127.0.0.1", l.local_addr()?.port()));
        }
        for template in tables {
            let (table, parts) = template.generate(nodes, &mut rng)?;
            for part in parts {
                write_partition(&Self::node_dir(&dir, part.node).join(&part.file), &part.rows)?;
            }
            db.add_table(table);
        }

        let mut states = Vec::with_capacity(nodes);
        for (i, listener) in listeners.into_iter().enumerate() {
            let node = i as NodeId;
            let node_dir = Self::node_dir(&dir, node);
            fs::create_dir_all(&node_dir)?;
            let state = Arc::new(ServerState::new(node, db.clone(), node_dir, String::new())?);
            let serving = state.clone();
            thread::spawn(move || serve_forever(listener, serving));
            states.push(state);
        }
        info!("Local cluster of {} nodes under {:?}", nodes, dir);
        Ok(LocalCluster { db, states, dir })
    }

    fn node_dir(dir: &Path, node: NodeId) -> PathBuf {
        dir.join(format!("node{}", node))
    }

    pub fn coordinator(&self) -> Arc<ServerState> {
        self.states[0].clone()
    }

    /// A conductor on the coordinating node.
    pub fn conductor(&self) -> Result<Conductor, DbError> {
        Conductor::new(self.coordinator())
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            debug!("cluster: cannot remove {:?}: {}", self.dir, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use common::testutil::init;
    use common::{Query, Value};

    #[test]
    fn test_join_across_generated_tables() {
        init();
        let cluster = LocalCluster::start(
            3,
            &[
                TableTemplate::new("Orders", &["_id", "cust"], 60).value_range(20),
                TableTemplate::new("Customers", &["_id", "region"], 20)
                    .parts(2)
                    .value_range(4),
            ],
            42,
        )
        .unwrap();
        let mut conductor = cluster.conductor().unwrap();
        let q = Query::new()
            .table("Orders", "o")
            .table("Customers", "c")
            .output("o._id")
            .output("c.region")
            .join("o.cust", "c._id");
        conductor.run_query(&q).unwrap();
        let mut rows = 0;
        while let Some(row) = conductor.fetch_row().unwrap() {
            assert!(matches!(row[1], Value::Int(r) if (0..4).contains(&r)));
            rows += 1;
        }
        // Every order refers to an existing customer.
        assert_eq!(60, rows);
    }
}
