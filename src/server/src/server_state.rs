use common::catalog::Catalog;
use common::database::Database;
use common::ids::NodeId;
use common::DbError;
use memstore::storage_manager::StorageManager;
use optimizer::StatsCatalog;
use parking_lot::RwLock;
use queryexe::ExecEnv;
use std::path::Path;
use std::sync::Arc;

/// What every connection of a node shares.
pub struct ServerState {
    /// Cluster description.
    pub db: Database,
    pub env: Arc<ExecEnv>,
    storage_manager: Arc<StorageManager>,
    /// Statistics of every partition, gathered on first use.
    stats: RwLock<Option<Arc<StatsCatalog>>>,
}

impl ServerState {
    /// Sets up a node and indexes the partitions it stores.
    ///
    /// # Arguments
    ///
    /// * `node` - Id of this node in `db`.
    /// * `db` - Cluster description.
    /// * `data_dir` - Directory relative partition paths resolve against.
    /// * `storage_path` - Where indexes persist, empty to keep them in memory only.
    pub fn new<P: AsRef<Path>>(
        node: NodeId,
        db: Database,
        data_dir: P,
        storage_path: String,
    ) -> Result<Self, DbError> {
        db.get_node(node)?;
        let storage_manager = Arc::new(StorageManager::new(storage_path));
        let env = ExecEnv::new(node, data_dir, storage_manager.clone());
        let state = ServerState {
            db,
            env,
            storage_manager,
            stats: RwLock::new(None),
        };
        state.load_local_partitions()?;
        Ok(state)
    }

    /// Indexes every partition stored on this node whose indexes were not restored.
    fn load_local_partitions(&self) -> Result<usize, DbError> {
        let mut loaded = 0;
        for table in self.db.tables.values() {
            let local: Vec<_> = table
                .partitions
                .iter()
                .filter(|p| p.node == self.node())
                .collect();
            if local.len() > 1 {
                return Err(DbError::ValidationError(format!(
                    "node {} stores {} partitions of {}, at most one is supported",
                    self.node(),
                    local.len(),
                    table.name
                )));
            }
            for partition in local {
                let restored = table
                    .indexed_fields()
                    .iter()
                    .all(|f| self.storage_manager.has_index(&table.index_name(f)));
                if restored {
                    debug!("server_state: indexes of {} already loaded", table.name);
                    continue;
                }
                let path = self.env.io.resolve(&partition.file);
                self.storage_manager.load_partition(table, &path)?;
                loaded += 1;
            }
        }
        info!("Node {} loaded {} partitions", self.node(), loaded);
        Ok(loaded)
    }

    pub fn node(&self) -> NodeId {
        self.env.node
    }

    /// Statistics of every partition in the cluster. The first call gathers them.
    pub fn stats(&self) -> Result<Arc<StatsCatalog>, DbError> {
        if let Some(stats) = self.stats.read().as_ref() {
            return Ok(stats.clone());
        }
        let stats = Arc::new(StatsCatalog::collect(&self.env, &self.db)?);
        *self.stats.write() = Some(stats.clone());
        Ok(stats)
    }

    /// Persists the indexes.
    pub fn shutdown(&self) -> Result<(), DbError> {
        info!("Shutting down node {}", self.node());
        self.storage_manager.shutdown()
    }
}
