use common::catalog::Catalog;
use common::stats::{PartStats, StatsRequest, DEFAULT_DISTINCT};
use common::storage_trait::{ErrCode, IndexStore};
use common::table::{Partition, Table};
use common::{DbError, TableSchema, Value, COL_DELIM, PAGE_SIZE, ROW_DELIM};
use queryexe::io::{ExecEnv, IoManager};
use queryexe::protocol::{self, Opcode};
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;

/// First column of a line, read as a primary key.
fn key_of(line: &[u8], schema: &TableSchema) -> Option<Value> {
    let col = line.split(|b| *b == COL_DELIM).next()?;
    Value::from_column(col, schema.pkey_type()).ok()
}

/// Adds the length of each column of a line, delimiter included.
fn add_lengths(line: &[u8], lengths: &mut [f64]) {
    let num_cols = lengths.len();
    for (i, col) in line.splitn(num_cols, |b| *b == COL_DELIM).enumerate() {
        lengths[i] += (col.len() + 1) as f64;
    }
}

/// Computes the statistics of a partition from its file image. Column lengths are averaged
/// over a sample at the head of the file, one page per four columns.
///
/// # Arguments
///
/// * `data` - Content of the partition file.
/// * `schema` - Schema of the partition's table.
/// * `partition` - The partition.
pub fn compute_part_stats(data: &[u8], schema: &TableSchema, partition: &Partition) -> PartStats {
    let num_cols = schema.size();
    let file_size = data.len() as u64;
    let page = PAGE_SIZE as u64;
    let mut stats = PartStats {
        node: partition.node,
        file: partition.file.clone(),
        file_size,
        num_pages: (file_size + page - 1) / page,
        cardinality: 0.0,
        col_lengths: vec![0.0; num_cols],
        distinct: vec![DEFAULT_DISTINCT; num_cols],
        min_key: None,
        max_key: None,
    };
    if data.is_empty() || num_cols == 0 {
        return stats;
    }

    let sample = &data[..(((num_cols + 3) / 4) * PAGE_SIZE).min(data.len())];
    let mut sampled = 0usize;
    let mut pos = 0;
    while let Some(end) = sample[pos..].iter().position(|b| *b == ROW_DELIM) {
        add_lengths(&sample[pos..pos + end], &mut stats.col_lengths);
        sampled += 1;
        pos += end + 1;
    }
    if sampled == 0 {
        // The first record is longer than the sample.
        let end = data
            .iter()
            .position(|b| *b == ROW_DELIM)
            .unwrap_or_else(|| data.len());
        add_lengths(&data[..end], &mut stats.col_lengths);
        sampled = 1;
    }
    for len in stats.col_lengths.iter_mut() {
        *len /= sampled as f64;
    }

    let tuple_length = stats.tuple_length();
    if tuple_length > 0.0 {
        stats.cardinality = file_size as f64 / tuple_length;
    }
    stats.distinct[0] = stats.cardinality;

    stats.min_key = key_of(data, schema);
    let body = match data.last() {
        Some(&ROW_DELIM) => &data[..data.len() - 1],
        _ => data,
    };
    let last = body
        .iter()
        .rposition(|b| *b == ROW_DELIM)
        .map(|p| p + 1)
        .unwrap_or(0);
    stats.max_key = key_of(&body[last..], schema);
    stats
}

/// Counts the values and distinct values of every indexed non-key column through its index.
///
/// # Arguments
///
/// * `stats` - Statistics to refine.
/// * `table` - Table of the partition.
/// * `store` - Index store of the node holding the partition.
pub fn refine_distinct(
    stats: &mut PartStats,
    table: &Table,
    store: &dyn IndexStore,
) -> Result<(), DbError> {
    for (i, attr) in table.schema.attributes().enumerate().skip(1) {
        if !attr.is_indexed() {
            continue;
        }
        let mut handle = match store.open_index(&table.index_name(attr.name())) {
            Ok(h) => h,
            Err(ErrCode::DbDne) => continue,
            Err(e) => return Err(e.into()),
        };
        let txn = store.begin_transaction()?;
        let mut values = 0usize;
        let mut distinct = 0usize;
        let mut last: Option<Value> = None;
        let res = loop {
            match store.get_next(&mut handle, txn) {
                Ok(record) => {
                    values += 1;
                    if last.as_ref() != Some(&record.key) {
                        distinct += 1;
                        last = Some(record.key);
                    }
                }
                Err(ErrCode::DbEnd) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        match res {
            Ok(()) => store.commit_transaction(txn)?,
            Err(e) => {
                let _ = store.abort_transaction(txn);
                let _ = store.close_index(handle);
                return Err(e.into());
            }
        }
        store.close_index(handle)?;
        if values > 0 {
            stats.distinct[i] = distinct as f64;
            stats.distinct[0] = values as f64;
        }
    }
    Ok(())
}

/// Statistics of a partition stored on the local node.
pub fn local_part_stats(
    env: &ExecEnv,
    table: &Table,
    partition: &Partition,
) -> Result<PartStats, DbError> {
    let data = env.io.open_file(&partition.file)?;
    let mut stats = compute_part_stats(&data, &table.schema, partition);
    refine_distinct(&mut stats, table, env.store.as_ref())?;
    debug!(
        "stats: {} [{}] card={:.1} pages={}",
        table.name, partition.file, stats.cardinality, stats.num_pages
    );
    Ok(stats)
}

fn exchange(stream: &mut TcpStream, msg: &[u8]) -> Result<PartStats, DbError> {
    stream
        .write_all(msg)
        .and_then(|_| stream.flush())
        .map_err(|e| DbError::TransportError(e.to_string()))?;
    let frame = protocol::read_frame(stream)?;
    Ok(serde_cbor::from_slice(&frame)?)
}

/// Asks the node holding a partition for its statistics.
///
/// # Arguments
///
/// * `env` - The asking node.
/// * `addr` - Address of the node holding the partition.
/// * `req` - Table and partition.
pub fn request_stats(env: &ExecEnv, addr: &str, req: &StatsRequest) -> Result<PartStats, DbError> {
    let node = req.partition.node;
    let mut msg = Vec::new();
    protocol::write_request(&mut msg, Opcode::Stats, &serde_cbor::to_vec(req)?)
        .map_err(|e| DbError::ProtocolError(e.to_string()))?;
    let (mut stream, reused) = env.io.connect(node, addr)?;
    let stats = match exchange(&mut stream, &msg) {
        Ok(s) => s,
        Err(e) if reused => {
            debug!("stats: pooled socket to node {} failed ({}), dialing", node, e);
            stream = IoManager::dial(addr)?;
            exchange(&mut stream, &msg)?
        }
        Err(e) => return Err(e),
    };
    env.io.release(node, stream);
    Ok(stats)
}

/// Statistics of every stored partition, grouped per table into logical partitions sorted by
/// minimum key. The replicas of a logical partition share their key range. Empty partitions
/// are left out.
#[derive(Debug, Clone, Default)]
pub struct StatsCatalog {
    tables: HashMap<String, Vec<Vec<Arc<PartStats>>>>,
}

impl StatsCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the statistics of one stored partition of `table`.
    pub fn add(&mut self, table: &str, stats: PartStats) {
        if stats.is_empty() {
            debug!("stats: {} [{}] is empty", table, stats.file);
            self.tables.entry(table.to_string()).or_insert_with(Vec::new);
            return;
        }
        let groups = self.tables.entry(table.to_string()).or_insert_with(Vec::new);
        match groups.iter_mut().find(|g| g[0].min_key == stats.min_key) {
            Some(group) => group.push(Arc::new(stats)),
            None => {
                let pos = groups.partition_point(|g| g[0].min_key < stats.min_key);
                groups.insert(pos, vec![Arc::new(stats)]);
            }
        }
    }

    /// Logical partitions of a table, ascending by key range.
    pub fn partitions(&self, table: &str) -> &[Vec<Arc<PartStats>>] {
        self.tables.get(table).map(|g| &g[..]).unwrap_or(&[])
    }

    /// Gathers the statistics of every partition in the catalog. Local partitions are
    /// computed in place, the others are asked for over the network.
    ///
    /// # Arguments
    ///
    /// * `env` - The coordinating node.
    /// * `catalog` - Cluster description.
    pub fn collect<C: Catalog>(env: &ExecEnv, catalog: &C) -> Result<Self, DbError> {
        let mut out = StatsCatalog::new();
        let mut names: Vec<&String> = catalog.get_tables().keys().collect();
        names.sort();
        for name in names {
            let table = catalog.get_table(name)?;
            for partition in &table.partitions {
                let stats = if partition.node == env.node {
                    local_part_stats(env, table, partition)?
                } else {
                    let req = StatsRequest {
                        table: table.name.clone(),
                        partition: partition.clone(),
                    };
                    request_stats(env, &catalog.node_addr(partition.node)?, &req)?
                };
                out.add(&table.name, stats);
            }
        }
        info!(
            "stats: collected {} logical partitions over {} tables",
            out.tables.values().map(|g| g.len()).sum::<usize>(),
            out.tables.len()
        );
        Ok(out)
    }
}
