use crate::ids::NodeId;
use crate::{DataType, TableSchema};

/// A horizontal slice of a table stored as a flat file on one node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Partition {
    /// Node holding the file.
    pub node: NodeId,
    /// Path of the flat file, relative paths resolve against the node's data dir.
    pub file: String,
}

impl Partition {
    pub fn new(node: NodeId, file: &str) -> Self {
        Partition {
            node,
            file: file.to_string(),
        }
    }
}

/// Table implementation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// Table schema. The first attribute is the primary key.
    pub schema: TableSchema,
    /// Every stored partition, replicas included.
    pub partitions: Vec<Partition>,
}

impl Table {
    /// Creates a new table.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of table.
    /// * `schema` - Schema of the table.
    /// * `partitions` - Where the rows live.
    pub fn new(name: String, schema: TableSchema, partitions: Vec<Partition>) -> Self {
        Table {
            name,
            schema,
            partitions,
        }
    }

    /// Name under which the index over `field` is registered.
    pub fn index_name(&self, field: &str) -> String {
        format!("{}.{}", self.name, field)
    }

    /// Declared type of `field`, if the table has it.
    pub fn field_type(&self, field: &str) -> Option<DataType> {
        self.schema
            .get_field_index(field)
            .and_then(|i| self.schema.get_attribute(*i))
            .map(|a| a.dtype)
    }

    /// Names of the indexed fields, in schema order.
    pub fn indexed_fields(&self) -> Vec<&str> {
        self.schema
            .attributes()
            .filter(|a| a.is_indexed())
            .map(|a| a.name())
            .collect()
    }
}
