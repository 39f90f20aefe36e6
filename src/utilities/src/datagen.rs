use rand::prelude::*;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use common::ids::NodeId;
use common::table::{Partition, Table};
use common::{DataType, DbError, TableSchema};

/// One generated partition: where it goes and its rows.
pub struct GeneratedPartition {
    pub node: NodeId,
    pub file: String,
    pub rows: Vec<Vec<i64>>,
}

/// Shape of an integer table to generate. Keys run from `first_key` upwards and are
/// split into `parts` contiguous ranges. Range `i` is stored on node `i`, its replicas on
/// the nodes after it.
#[derive(Clone, Debug)]
pub struct TableTemplate {
    pub name: String,
    /// Field names; the first is the key. Names starting with `_` get an index.
    pub fields: Vec<String>,
    pub rows: usize,
    pub first_key: i64,
    pub parts: usize,
    pub replicas: usize,
    /// Non-key values are drawn from `0..value_range`.
    pub value_range: i64,
}

impl TableTemplate {
    pub fn new(name: &str, fields: &[&str], rows: usize) -> Self {
        TableTemplate {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            rows,
            first_key: 0,
            parts: 1,
            replicas: 1,
            value_range: rows.max(1) as i64,
        }
    }

    pub fn parts(mut self, parts: usize) -> Self {
        self.parts = parts.max(1);
        self
    }

    pub fn replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas.max(1);
        self
    }

    pub fn value_range(mut self, range: i64) -> Self {
        self.value_range = range.max(1);
        self
    }

    pub fn first_key(mut self, key: i64) -> Self {
        self.first_key = key;
        self
    }

    /// Draws the rows and lays them out over `nodes` nodes.
    pub fn generate<R: Rng>(
        &self,
        nodes: usize,
        rng: &mut R,
    ) -> Result<(Table, Vec<GeneratedPartition>), DbError> {
        if self.parts * self.replicas > nodes {
            return Err(DbError::ValidationError(format!(
                "{} needs {} nodes to hold one partition per node, cluster has {}",
                self.name,
                self.parts * self.replicas,
                nodes
            )));
        }
        let per_part = (self.rows + self.parts - 1) / self.parts;
        let mut partitions = Vec::new();
        let mut generated = Vec::new();
        for part in 0..self.parts {
            let start = part * per_part;
            let end = ((part + 1) * per_part).min(self.rows);
            let rows: Vec<Vec<i64>> = (start..end)
                .map(|i| {
                    let mut row = vec![self.first_key + i as i64];
                    row.extend((1..self.fields.len()).map(|_| rng.gen_range(0..self.value_range)));
                    row
                })
                .collect();
            for replica in 0..self.replicas {
                let node = (part + replica * self.parts) as NodeId;
                let file = format!("{}.{}", self.name.to_lowercase(), node);
                partitions.push(Partition::new(node, &file));
                generated.push(GeneratedPartition {
                    node,
                    file,
                    rows: rows.clone(),
                });
            }
        }
        let fields: Vec<&str> = self.fields.iter().map(|f| f.as_str()).collect();
        let dtypes = vec![DataType::Int; fields.len()];
        let table = Table::new(
            self.name.clone(),
            TableSchema::from_vecs(fields, dtypes),
            partitions,
        );
        debug!(
            "datagen: {} with {} rows in {} partitions",
            self.name,
            self.rows,
            generated.len()
        );
        Ok((table, generated))
    }
}

/// Writes rows as a flat partition file, creating its directory.
pub fn write_partition(path: &Path, rows: &[Vec<i64>]) -> Result<(), DbError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    for row in rows {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(out, "{}", line.join("|"))?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;

    #[test]
    fn test_partitions_split_key_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let template = TableTemplate::new("T", &["_id", "v"], 10)
            .parts(3)
            .value_range(5)
            .first_key(100);
        let (table, parts) = template.generate(3, &mut rng).unwrap();
        assert_eq!(3, table.partitions.len());
        let sizes: Vec<usize> = parts.iter().map(|p| p.rows.len()).collect();
        assert_eq!(vec![4, 4, 2], sizes);
        assert_eq!(100, parts[0].rows[0][0]);
        assert_eq!(109, parts[2].rows[1][0]);
        assert!(parts
            .iter()
            .flat_map(|p| p.rows.iter())
            .all(|r| r[1] >= 0 && r[1] < 5));
        assert_eq!("t.2", parts[2].file);
    }

    #[test]
    fn test_replicas_land_on_distinct_nodes() {
        let mut rng = StdRng::seed_from_u64(1);
        let template = TableTemplate::new("R", &["_id", "x"], 6).parts(2).replicas(2);
        assert!(template.generate(3, &mut rng).is_err());
        let (_, parts) = template.generate(4, &mut rng).unwrap();
        let nodes: Vec<NodeId> = parts.iter().map(|p| p.node).collect();
        assert_eq!(vec![0, 2, 1, 3], nodes);
        assert_eq!(parts[0].rows, parts[1].rows);
    }
}
