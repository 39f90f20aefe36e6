use crate::catalog::Catalog;
use crate::ids::NodeId;
use crate::table::*;
use crate::DbError;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// A member of the cluster.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(id: NodeId, host: &str, port: u16) -> Self {
        Node {
            id,
            host: host.to_string(),
            port,
        }
    }

    /// Address the node listens on.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The cluster description shared by every node: members and table layout.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Database {
    /// Name of the database.
    pub name: String,
    pub nodes: Vec<Node>,
    pub tables: HashMap<String, Table>,
}

impl Database {
    /// Initialize a new database with a given name.
    ///
    /// # Arguments
    ///
    /// * `name` - Name for the new database.
    pub fn new(name: String) -> Self {
        Database {
            name,
            nodes: Vec::new(),
            tables: HashMap::new(),
        }
    }

    /// Reads a cluster description from a json file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| DbError::ValidationError(e.to_string()))
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }
}

impl Catalog for Database {
    fn get_tables(&self) -> &HashMap<String, Table> {
        &self.tables
    }

    fn get_nodes(&self) -> &[Node] {
        &self.nodes
    }
}
