use crate::database::Node;
use crate::ids::NodeId;
use crate::query::Query;
use crate::table::*;
use crate::{DbError, TableSchema};
use std::collections::HashMap;

/// Functions needed to implement a catalog. It keeps track of the cluster members and of every
/// table with its schema and partitions.
pub trait Catalog {
    /// Get tables from catalog.
    fn get_tables(&self) -> &HashMap<String, Table>;

    /// Get the members of the cluster.
    fn get_nodes(&self) -> &[Node];

    /// Get the table with the given name.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the table.
    fn get_table(&self, name: &str) -> Result<&Table, DbError> {
        self.get_tables()
            .get(name)
            .ok_or_else(|| DbError::ValidationError(format!("Table {} not found", name)))
    }

    /// Checks if the table name is valid in the catalog.
    fn is_valid_table(&self, name: &str) -> bool {
        self.get_tables().contains_key(name)
    }

    /// Checks if the column is valid for the given table.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of table to look for the column name in.
    /// * `col_name` - Name of column to look for in the table.
    fn is_valid_column(&self, name: &str, col_name: &str) -> bool {
        match self.get_tables().get(name) {
            Some(table) => table.schema.contains(col_name),
            None => false,
        }
    }

    /// Gets the table schema from the catalog.
    fn get_table_schema(&self, name: &str) -> Result<TableSchema, DbError> {
        Ok(self.get_table(name)?.schema.clone())
    }

    /// Looks up a node by id.
    fn get_node(&self, id: NodeId) -> Result<&Node, DbError> {
        self.get_nodes()
            .iter()
            .find(|n| n.id == id)
            .ok_or_else(|| DbError::ValidationError(format!("Node {} not found", id)))
    }

    /// Address of a node.
    fn node_addr(&self, id: NodeId) -> Result<String, DbError> {
        Ok(self.get_node(id)?.addr())
    }

    /// Checks that every table, alias and column a query references exists.
    ///
    /// # Arguments
    ///
    /// * `query` - Query to check.
    fn validate_query(&self, query: &Query) -> Result<(), DbError> {
        if query.tables.len() != query.aliases.len() || query.tables.is_empty() {
            return Err(DbError::ValidationError(String::from(
                "Every table needs exactly one alias",
            )));
        }
        for name in &query.tables {
            self.get_table(name)?;
        }
        let cols = query
            .output_fields
            .iter()
            .map(|c| c.as_str())
            .chain(query.restrictions().map(|(c, _, _)| c))
            .chain(
                query
                    .join_fields
                    .iter()
                    .flat_map(|(l, r)| vec![l.as_str(), r.as_str()]),
            );
        for col in cols {
            let alias = Query::alias_of(col);
            let pos = query
                .aliases
                .iter()
                .position(|a| a == alias)
                .ok_or_else(|| DbError::ValidationError(format!("Unknown alias in {}", col)))?;
            if !self.is_valid_column(&query.tables[pos], Query::field_of(col)) {
                return Err(DbError::ValidationError(format!("Unknown column {}", col)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::database::Database;
    use crate::{DataType, Value};

    fn db() -> Database {
        let mut db = Database::new("db".to_string());
        db.add_table(Table::new(
            "T".to_string(),
            TableSchema::from_vecs(vec!["_id", "v"], vec![DataType::Int, DataType::Int]),
            vec![Partition::new(0, "t.0")],
        ));
        db
    }

    #[test]
    fn test_validate_query() {
        let db = db();
        let q = Query::new()
            .table("T", "a")
            .output("a._id")
            .gt("a.v", Value::Int(15));
        assert!(db.validate_query(&q).is_ok());
        let bad = q.clone().output("a.w");
        assert!(db.validate_query(&bad).is_err());
        let bad_alias = q.output("b._id");
        assert!(db.validate_query(&bad_alias).is_err());
        assert!(db.get_node(3).is_err());
    }
}
