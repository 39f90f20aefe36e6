use common::catalog::Catalog;
use common::ids::{NodeId, COORDINATOR};
use common::query::belongs_to;
use common::stats::PartStats;
use common::table::Table;
use common::{DbError, PredicateOp, Query, Value};
use queryexe::cost::MATERIAL_BUFSIZE;
use queryexe::opiterator::{Dummy, IndexScan, Material, NbJoin, NlJoin, Remote, SeqScan, Union};
use queryexe::{OpIterator, Operator};
use std::cmp::Ordering;
use std::sync::Arc;

/// A replica set: copies of one key range on different nodes.
type Replicas = Vec<Arc<PartStats>>;

/// A table of the query with the logical partitions that survived pruning.
struct Relation<'a> {
    alias: &'a str,
    table: &'a Table,
    parts: Vec<Replicas>,
}

/// Replica on `prefer` if there is one, else the first.
fn replica(group: &[Arc<PartStats>], prefer: NodeId) -> &Arc<PartStats> {
    group
        .iter()
        .find(|s| s.node == prefer)
        .unwrap_or(&group[0])
}

fn by_cost(a: &Operator, b: &Operator) -> Ordering {
    a.est_cost()
        .partial_cmp(&b.est_cost())
        .unwrap_or(Ordering::Equal)
}

/// Cheapest plan of a non-empty list.
fn cheapest(plans: Vec<Operator>) -> Result<Operator, DbError> {
    plans
        .into_iter()
        .min_by(by_cost)
        .ok_or_else(|| DbError::PlanError(String::from("no candidate plan")))
}

fn total_cost(plans: &[Operator]) -> f64 {
    plans.iter().map(|p| p.est_cost()).sum()
}

/// Every ordering of `0..n`.
fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for rest in permutations(n - 1) {
        for pos in 0..=rest.len() {
            let mut p = rest.clone();
            p.insert(pos, n - 1);
            out.push(p);
        }
    }
    out
}

/// Drops the logical partitions that cannot hold a row matching the primary-key
/// restrictions of `alias`. `parts` is sorted by key range.
fn prune(mut parts: Vec<Replicas>, alias: &str, table: &Table, query: &Query) -> Vec<Replicas> {
    let pkey = match table.schema.get_attribute(0) {
        Some(a) => a.name(),
        None => return parts,
    };
    for (col, value, op) in query.restrictions() {
        if !belongs_to(col, alias)
            || Query::field_of(col) != pkey
            || value.dtype() != table.schema.pkey_type()
        {
            continue;
        }
        match op {
            PredicateOp::Equals => {
                let idx = parts
                    .partition_point(|g| g[0].min_key.as_ref().map_or(true, |m| m <= value));
                parts = if idx > 0 && parts[idx - 1][0].may_contain(value) {
                    vec![parts.swap_remove(idx - 1)]
                } else {
                    Vec::new()
                };
            }
            PredicateOp::GreaterThan => {
                let start = parts
                    .partition_point(|g| g[0].max_key.as_ref().map_or(true, |m| m <= value));
                parts = parts.split_off(start);
            }
        }
    }
    parts
}

/// Builds the physical plan of a query from the catalog and the collected statistics. Every
/// plan it returns is rooted on the coordinator.
pub struct Planner<'a, C: Catalog> {
    catalog: &'a C,
    stats: &'a crate::StatsCatalog,
    query: &'a Query,
}

impl<'a, C: Catalog> Planner<'a, C> {
    /// # Arguments
    ///
    /// * `catalog` - Cluster description.
    /// * `stats` - Statistics of every partition.
    /// * `query` - Query to plan.
    pub fn new(catalog: &'a C, stats: &'a crate::StatsCatalog, query: &'a Query) -> Self {
        Planner {
            catalog,
            stats,
            query,
        }
    }

    /// Returns the cheapest plan found for the query.
    pub fn plan(&self) -> Result<Operator, DbError> {
        self.catalog.validate_query(self.query)?;
        let rels = self.relations()?;
        let best = if rels.iter().any(|r| r.parts.is_empty()) {
            info!("optimizer: no partition can hold a result row");
            Operator::Dummy(Dummy::new(COORDINATOR))
        } else if rels.iter().all(|r| r.parts.len() == 1) {
            cheapest(self.enumerate_relations(&rels)?)?
        } else {
            self.plan_partitioned(&rels)?
        };
        info!(
            "optimizer: chose plan with cost {:.2}\n{}",
            best.est_cost(),
            best
        );
        Ok(best)
    }

    /// Every plan considered for a query whose tables each keep a single logical partition
    /// after pruning: all join orders, scan methods and join methods.
    pub fn enumerate(&self) -> Result<Vec<Operator>, DbError> {
        let rels = self.relations()?;
        if rels.iter().any(|r| r.parts.len() != 1) {
            return Err(DbError::PlanError(String::from(
                "enumeration needs exactly one logical partition per table",
            )));
        }
        self.enumerate_relations(&rels)
    }

    fn relations(&self) -> Result<Vec<Relation<'a>>, DbError> {
        let query = self.query;
        query
            .tables
            .iter()
            .zip(query.aliases.iter())
            .map(|(name, alias)| {
                let table = self.catalog.get_table(name)?;
                let parts = prune(self.stats.partitions(name).to_vec(), alias, table, query);
                debug!("optimizer: {} as {} keeps {} partitions", name, alias, parts.len());
                Ok(Relation {
                    alias: alias.as_str(),
                    table,
                    parts,
                })
            })
            .collect()
    }

    fn addr(&self, node: NodeId) -> Result<String, DbError> {
        self.catalog.node_addr(node)
    }

    /// Moves `op` to `node` behind a Remote unless it already runs there.
    fn remote_to(&self, node: NodeId, op: Operator) -> Result<Operator, DbError> {
        if op.node_id() == node {
            return Ok(op);
        }
        let addr = self.addr(op.node_id())?;
        Ok(Operator::Remote(Remote::new(node, &addr, op)))
    }

    /// Unions `children` on `node`.
    fn gather(&self, node: NodeId, children: Vec<Operator>) -> Result<Operator, DbError> {
        let mut children = children
            .into_iter()
            .map(|c| self.remote_to(node, c))
            .collect::<Result<Vec<Operator>, DbError>>()?;
        if children.len() == 1 {
            if let Some(only) = children.pop() {
                return Ok(only);
            }
        }
        Ok(Operator::Union(Union::plain(node, children)?))
    }

    /// Sequential scan of a partition, plus an index scan when a restriction allows one.
    fn scans(&self, rel: &Relation, part: &Arc<PartStats>) -> Result<Vec<Operator>, DbError> {
        let (alias, table, q) = (rel.alias, rel.table, self.query);
        let mut out = vec![Operator::SeqScan(SeqScan::new(
            part.node,
            alias,
            table,
            &part.file,
            q,
            Some(part.clone()),
        )?)];
        match IndexScan::new(part.node, alias, table, &part.file, q, Some(part.clone())) {
            Ok(scan) => out.push(Operator::IndexScan(scan)),
            Err(DbError::PlanError(e)) => debug!("optimizer: {}", e),
            Err(e) => return Err(e),
        }
        Ok(out)
    }

    fn best_scan(&self, rel: &Relation, part: &Arc<PartStats>) -> Result<Operator, DbError> {
        cheapest(self.scans(rel, part)?)
    }

    /// A join condition the index of an indexed field of `rel` can answer with a column of
    /// `outer`: its position in the query and the field.
    fn index_join(&self, rel: &Relation, outer: &Operator) -> Option<(usize, String)> {
        for (j, (a, b)) in self.query.join_fields.iter().enumerate() {
            for (inner, other) in &[(a, b), (b, a)] {
                let field = Query::field_of(inner);
                if belongs_to(inner, rel.alias) && field.starts_with('_') && outer.has_col(other) {
                    return Some((j, field.to_string()));
                }
            }
        }
        None
    }

    /// Correlated lookup of `field` in one partition.
    fn probe(
        &self,
        rel: &Relation,
        part: &Arc<PartStats>,
        field: &str,
        outer_cardinality: f64,
    ) -> Result<Operator, DbError> {
        Ok(Operator::IndexScan(IndexScan::correlated(
            part.node,
            rel.alias,
            rel.table,
            &part.file,
            self.query,
            Some(part.clone()),
            field,
            outer_cardinality,
        )?))
    }

    /// Ways to join `outer` with one logical partition of `rel`. Joins run on the node of the
    /// chosen replica, except the block join over a materialized remote inner, which stays
    /// on the outer's node.
    fn join_alternatives(
        &self,
        outer: &Operator,
        rel: &Relation,
        group: &[Arc<PartStats>],
    ) -> Result<Vec<Operator>, DbError> {
        let q = self.query;
        let part = replica(group, outer.node_id());
        let node = part.node;
        let moved = self.remote_to(node, outer.clone())?;
        let mut plans = Vec::new();

        if let Some((cond, field)) = self.index_join(rel, &moved) {
            let inner = self.probe(rel, part, &field, moved.est_cardinality())?;
            plans.push(Operator::NlJoin(NlJoin::correlated(
                node,
                moved.clone(),
                inner,
                q,
                cond,
            )?));
        }
        for inner in self.scans(rel, part)? {
            plans.push(Operator::NbJoin(NbJoin::new(node, moved.clone(), inner, q)?));
        }

        let here = outer.node_id();
        if here != node {
            let inner = self.remote_to(here, self.best_scan(rel, part)?)?;
            if inner.est_cardinality() * inner.est_tuple_length() <= MATERIAL_BUFSIZE as f64 {
                let inner = Operator::Material(Material::new(here, inner));
                plans.push(Operator::NbJoin(NbJoin::new(here, outer.clone(), inner, q)?));
            }
        }
        Ok(plans)
    }

    fn enumerate_relations(&self, rels: &[Relation]) -> Result<Vec<Operator>, DbError> {
        let mut plans = Vec::new();
        for rel in rels {
            for part in &rel.parts[0] {
                plans.extend(self.scans(rel, part)?);
            }
        }
        for _ in 1..rels.len() {
            let mut next = Vec::new();
            for outer in &plans {
                for rel in rels {
                    if outer.has_col(rel.alias) {
                        continue;
                    }
                    next.extend(self.join_alternatives(outer, rel, &rel.parts[0])?);
                }
            }
            plans = next;
        }
        debug!("optimizer: enumerated {} plans", plans.len());
        plans
            .into_iter()
            .map(|p| self.remote_to(COORDINATOR, p))
            .collect()
    }

    fn plan_partitioned(&self, rels: &[Relation]) -> Result<Operator, DbError> {
        let mut best: Option<Operator> = None;
        for order in permutations(rels.len()) {
            let plan = self.plan_order(rels, &order)?;
            debug!("optimizer: order {:?} costs {:.2}", order, plan.est_cost());
            if best.as_ref().map_or(true, |b| plan.est_cost() < b.est_cost()) {
                best = Some(plan);
            }
        }
        best.ok_or_else(|| DbError::PlanError(String::from("query has no tables")))
    }

    /// Plan joining the tables in the given order. The running result is a list of
    /// fragments whose union is the join so far.
    fn plan_order(&self, rels: &[Relation], order: &[usize]) -> Result<Operator, DbError> {
        let first = &rels[order[0]];
        let mut frags = first
            .parts
            .iter()
            .map(|g| self.best_scan(first, replica(g, COORDINATOR)))
            .collect::<Result<Vec<Operator>, DbError>>()?;
        for i in &order[1..] {
            let rel = &rels[*i];
            let before = self.union_before(&frags, rel)?;
            let after = self.union_after(&frags, rel)?;
            frags = if total_cost(&before) <= total_cost(&after) {
                before
            } else {
                after
            };
        }
        self.gather(COORDINATOR, frags)
    }

    /// Unions the fragments once per partition of `rel`, next to that partition, and joins.
    fn union_before(&self, frags: &[Operator], rel: &Relation) -> Result<Vec<Operator>, DbError> {
        let prefer = frags[0].node_id();
        rel.parts
            .iter()
            .map(|group| {
                let outer = self.gather(replica(group, prefer).node, frags.to_vec())?;
                cheapest(self.join_alternatives(&outer, rel, group)?)
            })
            .collect()
    }

    /// Joins every fragment, on its node, with the union of the partitions of `rel`. An
    /// index join on the primary key probes only the partition whose range holds the key.
    fn union_after(&self, frags: &[Operator], rel: &Relation) -> Result<Vec<Operator>, DbError> {
        let q = self.query;
        let pkey = rel.table.schema.get_attribute(0).map(|a| a.name());
        frags
            .iter()
            .map(|frag| {
                let node = frag.node_id();
                let mut plans = Vec::new();

                if let Some((cond, field)) = self.index_join(rel, frag) {
                    let card = frag.est_cardinality();
                    let mut probes = Vec::with_capacity(rel.parts.len());
                    let mut keys = Vec::with_capacity(rel.parts.len());
                    for group in &rel.parts {
                        let part = replica(group, node);
                        probes.push(self.remote_to(node, self.probe(rel, part, &field, card)?)?);
                        keys.push(part.min_key.clone().unwrap_or(Value::Int(i64::MIN)));
                    }
                    let inner = if probes.len() == 1 {
                        probes.remove(0)
                    } else if pkey == Some(field.as_str()) {
                        Operator::Union(Union::pivot(node, probes, keys)?)
                    } else {
                        Operator::Union(Union::plain(node, probes)?)
                    };
                    plans.push(Operator::NlJoin(NlJoin::correlated(
                        node,
                        frag.clone(),
                        inner,
                        q,
                        cond,
                    )?));
                }

                let scans = rel
                    .parts
                    .iter()
                    .map(|group| self.best_scan(rel, replica(group, node)))
                    .collect::<Result<Vec<Operator>, DbError>>()?;
                let inner = self.gather(node, scans)?;
                plans.push(Operator::NbJoin(NbJoin::new(node, frag.clone(), inner, q)?));
                cheapest(plans)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::StatsCatalog;
    use common::database::{Database, Node};
    use common::table::Partition;
    use common::testutil::*;
    use common::{DataType, TableSchema};
    use memstore::storage_manager::StorageManager;
    use queryexe::query::Executor;
    use queryexe::ExecEnv;

    fn int_table(name: &str, fields: Vec<&str>, parts: Vec<Partition>) -> Table {
        let n = fields.len();
        Table::new(
            name.to_string(),
            TableSchema::from_vecs(fields, vec![DataType::Int; n]),
            parts,
        )
    }

    fn part_stats(node: NodeId, file: &str, card: f64, min: i64, max: i64) -> PartStats {
        PartStats {
            node,
            file: file.to_string(),
            file_size: (card * 10.0) as u64,
            num_pages: ((card * 10.0) / 4096.0).ceil() as u64,
            cardinality: card,
            col_lengths: vec![5.0, 5.0],
            distinct: vec![card, 10.0],
            min_key: Some(Value::Int(min)),
            max_key: Some(Value::Int(max)),
        }
    }

    fn cluster() -> Database {
        let mut db = Database::new("test".to_string());
        db.add_node(Node::new(0, "127.0.0.1", 17000));
        db.add_node(Node::new(1, "127.0.0.1", 17001));
        db
    }

    #[test]
    fn test_chosen_plan_is_cheapest() {
        let mut db = cluster();
        db.add_table(int_table("R", vec!["_id", "fk"], vec![Partition::new(0, "r.0")]));
        db.add_table(int_table("S", vec!["_id", "v"], vec![Partition::new(1, "s.0")]));
        let mut stats = StatsCatalog::new();
        stats.add("R", part_stats(0, "r.0", 1000.0, 1, 1000));
        stats.add("S", part_stats(1, "s.0", 200.0, 1, 200));
        let q = Query::new()
            .table("R", "r")
            .table("S", "s")
            .output("r._id")
            .output("s.v")
            .join("r.fk", "s._id");

        let planner = Planner::new(&db, &stats, &q);
        let plan = planner.plan().unwrap();
        let all = planner.enumerate().unwrap();
        assert_eq!(COORDINATOR, plan.node_id());
        assert!(all.iter().all(|p| p.node_id() == COORDINATOR));
        assert!(all.iter().all(|p| plan.est_cost() <= p.est_cost()));
        let shapes: Vec<String> = all.iter().map(|p| p.to_string()).collect();
        assert!(shapes.iter().any(|s| s.contains("(correlated)")));
        assert!(shapes.iter().any(|s| s.contains("Material")));
        assert!(shapes.iter().any(|s| s.contains("Remote")));
    }

    fn partitioned() -> (Database, StatsCatalog) {
        let mut db = cluster();
        let parts = vec![
            Partition::new(0, "t.0"),
            Partition::new(1, "t.1"),
            Partition::new(0, "t.2"),
            Partition::new(1, "t.2r"),
        ];
        db.add_table(int_table("T", vec!["_id", "v"], parts));
        let mut stats = StatsCatalog::new();
        stats.add("T", part_stats(0, "t.0", 100_000.0, 1, 9));
        stats.add("T", part_stats(1, "t.1", 100_000.0, 10, 19));
        stats.add("T", part_stats(0, "t.2", 100_000.0, 20, 29));
        stats.add("T", part_stats(1, "t.2r", 100_000.0, 20, 29));
        (db, stats)
    }

    #[test]
    fn test_pruning_on_primary_key() {
        let (db, stats) = partitioned();
        let q = Query::new()
            .table("T", "a")
            .output("a.v")
            .eq("a._id", Value::Int(15));
        let plan = Planner::new(&db, &stats, &q).plan().unwrap().to_string();
        assert!(plan.contains("[t.1]"));
        assert!(!plan.contains("[t.0]") && !plan.contains("[t.2]"));

        let q = Query::new()
            .table("T", "a")
            .output("a.v")
            .gt("a._id", Value::Int(12));
        let plan = Planner::new(&db, &stats, &q).plan().unwrap().to_string();
        assert!(plan.contains("Union"));
        assert!(plan.contains("[t.1]"));
        // The replica on the coordinator wins.
        assert!(plan.contains("[t.2]") && !plan.contains("[t.2r]"));
        assert!(!plan.contains("[t.0]"));

        let q = Query::new()
            .table("T", "a")
            .output("a.v")
            .eq("a._id", Value::Int(40));
        let plan = Planner::new(&db, &stats, &q).plan().unwrap();
        assert!(matches!(plan, Operator::Dummy(_)));
    }

    #[test]
    fn test_partitioned_join() {
        let (mut db, mut stats) = partitioned();
        db.add_table(int_table("R", vec!["_id", "fk"], vec![Partition::new(0, "r.0")]));
        stats.add("R", part_stats(0, "r.0", 20.0, 1, 20));
        let q = Query::new()
            .table("R", "r")
            .table("T", "t")
            .output("r._id")
            .output("t.v")
            .join("r.fk", "t._id");
        let planner = Planner::new(&db, &stats, &q);
        let rels = planner.relations().unwrap();

        // Probing the key ranges of T from R goes through a pivot union.
        let r_scan = planner.best_scan(&rels[0], &rels[0].parts[0][0]).unwrap();
        let after = planner.union_after(&[r_scan], &rels[1]).unwrap();
        assert_eq!(1, after.len());
        assert!(after[0].to_string().contains("(pivot)"));

        let plan = planner.plan().unwrap();
        assert_eq!(COORDINATOR, plan.node_id());
        for order in permutations(2) {
            let alt = planner.plan_order(&rels, &order).unwrap();
            assert!(plan.est_cost() <= alt.est_cost());
        }
    }

    #[test]
    fn test_permutations() {
        let mut p = permutations(3);
        p.sort();
        assert_eq!(6, p.len());
        assert_eq!(vec![0, 1, 2], p[0]);
        assert_eq!(vec![2, 1, 0], p[5]);
    }

    #[test]
    fn test_plan_and_execute_locally() {
        let dir = gen_random_dir();
        let mut db = Database::new("local".to_string());
        db.add_node(Node::new(0, "127.0.0.1", 17000));
        let r = int_table("R", vec!["_id", "fk"], vec![Partition::new(0, "r.0")]);
        let s = int_table("S", vec!["_id", "v"], vec![Partition::new(0, "s.0")]);
        let sm = Arc::new(StorageManager::new_test_sm());
        let path = write_int_file(dir.join("r.0"), &[vec![1, 10], vec![2, 20], vec![3, 10]]);
        sm.load_partition(&r, &path).unwrap();
        let path = write_int_file(dir.join("s.0"), &[vec![10, 100], vec![20, 200]]);
        sm.load_partition(&s, &path).unwrap();
        db.add_table(r);
        db.add_table(s);

        let env = ExecEnv::new(0, &dir, sm);
        let stats = StatsCatalog::collect(&env, &db).unwrap();
        let q = Query::new()
            .table("R", "r")
            .table("S", "s")
            .output("r._id")
            .output("s.v")
            .join("r.fk", "s._id");
        let plan = Planner::new(&db, &stats, &q).plan().unwrap();

        let mut exec = Executor::new_ref(env.clone());
        exec.configure_query(plan, &q.output_fields).unwrap();
        exec.start().unwrap();
        let mut rows = Vec::new();
        while let Some(row) = exec.fetch_row().unwrap() {
            rows.push(row.iter().filter_map(|v| v.as_int()).collect::<Vec<i64>>());
        }
        exec.close().unwrap();
        assert!(compare_unordered(
            &[vec![1, 100], vec![2, 200], vec![3, 100]],
            rows
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
