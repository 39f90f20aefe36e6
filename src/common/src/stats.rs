use crate::ids::NodeId;
use crate::table::Partition;
use crate::Value;

/// Distinct-value estimate used when nothing better is known.
pub const DEFAULT_DISTINCT: f64 = 10.0;

/// Statistics of one stored partition, computed once before queries run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartStats {
    /// Node holding the partition.
    pub node: NodeId,
    /// Flat file of the partition.
    pub file: String,
    pub file_size: u64,
    pub num_pages: u64,
    pub cardinality: f64,
    /// Average bytes per column, delimiter included.
    pub col_lengths: Vec<f64>,
    /// Distinct-value estimate per column.
    pub distinct: Vec<f64>,
    /// Smallest primary key, read from the first record.
    pub min_key: Option<Value>,
    /// Largest primary key, read from the last record.
    pub max_key: Option<Value>,
}

impl PartStats {
    /// Average bytes per record.
    pub fn tuple_length(&self) -> f64 {
        self.col_lengths.iter().sum()
    }

    pub fn col_length(&self, col: usize) -> f64 {
        self.col_lengths.get(col).copied().unwrap_or(0.0)
    }

    pub fn distinct(&self, col: usize) -> f64 {
        match self.distinct.get(col) {
            Some(d) if *d >= 1.0 => *d,
            _ => DEFAULT_DISTINCT,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_key.is_none()
    }

    /// Whether a primary key could be stored in this partition.
    pub fn may_contain(&self, key: &Value) -> bool {
        match (&self.min_key, &self.max_key) {
            (Some(min), Some(max)) => min <= key && key <= max,
            _ => false,
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.node, &self.file)
    }
}

/// Asks a node for the statistics of one of its partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRequest {
    pub table: String,
    pub partition: Partition,
}
