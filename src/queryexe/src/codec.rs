//! Binary encoding of plans shipped between nodes.
//!
//! Every operator starts with a varint tag and its node id, then its own fields, then its
//! children. Integers are LEB128 varints, signed ones zigzag-mapped first. Strings and raw
//! columns are prefixed with their length. Statistics never travel: a decoded plan only
//! carries what is needed to execute it.

use bytes::{Bytes, BytesMut};
use common::ids::ColId;
use common::{DataType, DbError, PredicateOp, Tuple, Value};

use crate::opiterator::{
    Dummy, IndexScan, Join, JoinCond, Material, NbJoin, NlJoin, OpIterator, Operator, Remote,
    Restriction, Scan, SeqScan, Union, UnionMode,
};

const TAG_SEQSCAN: u64 = 1;
const TAG_INDEXSCAN: u64 = 2;
const TAG_NLJOIN: u64 = 3;
const TAG_NBJOIN: u64 = 4;
const TAG_REMOTE: u64 = 5;
const TAG_UNION: u64 = 6;
const TAG_MATERIAL: u64 = 7;
const TAG_DUMMY: u64 = 8;

/// Deepest operator nesting a decoder accepts.
const MAX_DEPTH: usize = 256;

/// Where encoded bytes go. Encoding runs twice, once to size the buffer and once to fill it.
trait Sink {
    fn put(&mut self, bytes: &[u8]);
}

impl Sink for BytesMut {
    fn put(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

#[derive(Default)]
struct SizeCounter(usize);

impl Sink for SizeCounter {
    fn put(&mut self, bytes: &[u8]) {
        self.0 += bytes.len();
    }
}

/// Encodes a plan into a buffer of exactly the right size.
pub fn encode(op: &Operator) -> Bytes {
    let len = encoded_len(op);
    let mut buf = BytesMut::with_capacity(len);
    put_op(&mut buf, op);
    debug_assert_eq!(len, buf.len());
    buf.freeze()
}

/// Size of the encoding of `op`.
pub fn encoded_len(op: &Operator) -> usize {
    let mut counter = SizeCounter::default();
    put_op(&mut counter, op);
    counter.0
}

fn put_varint<S: Sink>(s: &mut S, mut v: u64) {
    let mut buf = [0u8; 10];
    let mut n = 0;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf[n] = byte;
            n += 1;
            break;
        }
        buf[n] = byte | 0x80;
        n += 1;
    }
    s.put(&buf[..n]);
}

fn put_signed<S: Sink>(s: &mut S, v: i64) {
    put_varint(s, ((v << 1) ^ (v >> 63)) as u64);
}

fn put_usize<S: Sink>(s: &mut S, v: usize) {
    put_varint(s, v as u64);
}

fn put_bytes<S: Sink>(s: &mut S, b: &[u8]) {
    put_usize(s, b.len());
    s.put(b);
}

fn put_flag<S: Sink>(s: &mut S, f: bool) {
    s.put(&[f as u8]);
}

fn put_value<S: Sink>(s: &mut S, v: &Value) {
    match v {
        Value::Int(i) => {
            put_varint(s, 0);
            put_signed(s, *i);
        }
        Value::Str(b) => {
            put_varint(s, 1);
            put_bytes(s, b);
        }
    }
}

fn put_dtype<S: Sink>(s: &mut S, t: DataType) {
    put_varint(
        s,
        match t {
            DataType::Int => 0,
            DataType::String => 1,
        },
    );
}

fn put_pred<S: Sink>(s: &mut S, op: PredicateOp) {
    put_varint(
        s,
        match op {
            PredicateOp::Equals => 0,
            PredicateOp::GreaterThan => 1,
        },
    );
}

fn put_cols<S: Sink>(s: &mut S, cols: &[ColId]) {
    put_usize(s, cols.len());
    for c in cols {
        put_usize(s, *c);
    }
}

fn put_scan<S: Sink>(s: &mut S, scan: &Scan) {
    put_varint(s, scan.node as u64);
    put_bytes(s, scan.alias.as_bytes());
    put_bytes(s, scan.table.as_bytes());
    put_bytes(s, scan.file.as_bytes());
    put_usize(s, scan.fields.len());
    for (name, dtype) in &scan.fields {
        put_bytes(s, name.as_bytes());
        put_dtype(s, *dtype);
    }
    put_cols(s, &scan.selected);
    put_usize(s, scan.filters.len());
    for f in &scan.filters {
        put_usize(s, f.col);
        put_pred(s, f.op);
        put_value(s, &f.value);
    }
    put_usize(s, scan.self_joins.len());
    for (l, r, t) in &scan.self_joins {
        put_usize(s, *l);
        put_usize(s, *r);
        put_dtype(s, *t);
    }
}

/// Everything of a join but its children.
fn put_join_head<S: Sink>(s: &mut S, join: &Join) {
    put_varint(s, join.node as u64);
    put_cols(s, &join.selected);
    put_usize(s, join.conds.len());
    for c in &join.conds {
        put_usize(s, c.left);
        put_usize(s, c.right);
        put_dtype(s, c.dtype);
    }
}

fn put_op<S: Sink>(s: &mut S, op: &Operator) {
    match op {
        Operator::SeqScan(scan) => {
            put_varint(s, TAG_SEQSCAN);
            put_scan(s, &scan.scan);
        }
        Operator::IndexScan(scan) => {
            put_varint(s, TAG_INDEXSCAN);
            put_scan(s, &scan.scan);
            put_usize(s, scan.index_col);
            put_bytes(s, scan.index_name.as_bytes());
            put_pred(s, scan.op);
            put_flag(s, scan.unique);
            put_flag(s, scan.literal.is_some());
            if let Some(v) = &scan.literal {
                put_value(s, v);
            }
        }
        Operator::NlJoin(j) => {
            put_varint(s, TAG_NLJOIN);
            put_join_head(s, &j.join);
            put_flag(s, j.index_join_col.is_some());
            if let Some(c) = j.index_join_col {
                put_usize(s, c);
            }
            put_op(s, &j.join.left);
            put_op(s, &j.join.right);
        }
        Operator::NbJoin(j) => {
            put_varint(s, TAG_NBJOIN);
            put_join_head(s, &j.join);
            put_op(s, &j.join.left);
            put_op(s, &j.join.right);
        }
        Operator::Remote(r) => {
            put_varint(s, TAG_REMOTE);
            put_varint(s, r.node as u64);
            put_bytes(s, r.addr.as_bytes());
            put_op(s, &r.child);
        }
        Operator::Union(u) => {
            put_varint(s, TAG_UNION);
            put_varint(s, u.node as u64);
            match &u.mode {
                UnionMode::Plain => put_varint(s, 0),
                UnionMode::Pivot(pivots) => {
                    put_varint(s, 1);
                    put_usize(s, pivots.len());
                    for (v, i) in pivots {
                        put_value(s, v);
                        put_usize(s, *i);
                    }
                }
            }
            put_usize(s, u.children.len());
            for child in &u.children {
                put_op(s, child);
            }
        }
        Operator::Material(m) => {
            put_varint(s, TAG_MATERIAL);
            put_varint(s, m.node as u64);
            put_flag(s, m.rows.is_some());
            if let Some(rows) = &m.rows {
                put_usize(s, rows.len());
                for row in rows.iter() {
                    put_usize(s, row.size());
                    for col in row.columns() {
                        put_bytes(s, col);
                    }
                }
            }
            put_op(s, &m.child);
        }
        Operator::Dummy(d) => {
            put_varint(s, TAG_DUMMY);
            put_varint(s, d.node as u64);
        }
    }
}

/// Decodes a whole buffer into a plan. Columns of buffered rows stay views into `buf`.
pub fn decode(buf: Bytes) -> Result<Operator, DbError> {
    let mut d = Decoder {
        buf,
        pos: 0,
        depth: 0,
    };
    let op = d.op()?;
    if d.pos != d.buf.len() {
        return Err(DbError::ProtocolError(format!(
            "{} trailing bytes after plan",
            d.buf.len() - d.pos
        )));
    }
    Ok(op)
}

struct Decoder {
    buf: Bytes,
    pos: usize,
    depth: usize,
}

fn malformed(what: &str) -> DbError {
    DbError::ProtocolError(format!("malformed plan: {}", what))
}

impl Decoder {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn byte(&mut self) -> Result<u8, DbError> {
        let b = *self.buf.get(self.pos).ok_or_else(|| malformed("truncated"))?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u64, DbError> {
        let mut v = 0u64;
        for shift in (0..64).step_by(7) {
            let b = self.byte()?;
            if shift == 63 && b > 1 {
                return Err(malformed("varint overflow"));
            }
            v |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
        }
        Err(malformed("varint too long"))
    }

    fn signed(&mut self) -> Result<i64, DbError> {
        let v = self.varint()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    fn usize(&mut self) -> Result<usize, DbError> {
        let v = self.varint()?;
        if v > usize::MAX as u64 {
            return Err(malformed("length out of range"));
        }
        Ok(v as usize)
    }

    fn node(&mut self) -> Result<u32, DbError> {
        let v = self.varint()?;
        if v > u32::MAX as u64 {
            return Err(malformed("node id out of range"));
        }
        Ok(v as u32)
    }

    /// A count of items that take at least one byte each.
    fn count(&mut self) -> Result<usize, DbError> {
        let n = self.usize()?;
        if n > self.remaining() {
            return Err(malformed("count past the end"));
        }
        Ok(n)
    }

    fn flag(&mut self) -> Result<bool, DbError> {
        match self.byte()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(malformed("bad flag")),
        }
    }

    fn bytes(&mut self) -> Result<Bytes, DbError> {
        let len = self.usize()?;
        if len > self.remaining() {
            return Err(malformed("length past the end"));
        }
        let b = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(b)
    }

    fn string(&mut self) -> Result<String, DbError> {
        let b = self.bytes()?;
        String::from_utf8(b.to_vec()).map_err(|_| malformed("string is not utf-8"))
    }

    fn value(&mut self) -> Result<Value, DbError> {
        match self.varint()? {
            0 => Ok(Value::Int(self.signed()?)),
            1 => Ok(Value::Str(self.bytes()?.to_vec())),
            t => Err(malformed(&format!("value tag {}", t))),
        }
    }

    fn dtype(&mut self) -> Result<DataType, DbError> {
        match self.varint()? {
            0 => Ok(DataType::Int),
            1 => Ok(DataType::String),
            t => Err(malformed(&format!("type tag {}", t))),
        }
    }

    fn pred(&mut self) -> Result<PredicateOp, DbError> {
        match self.varint()? {
            0 => Ok(PredicateOp::Equals),
            1 => Ok(PredicateOp::GreaterThan),
            t => Err(malformed(&format!("predicate tag {}", t))),
        }
    }

    fn cols(&mut self) -> Result<Vec<ColId>, DbError> {
        let n = self.count()?;
        (0..n).map(|_| self.usize()).collect()
    }

    fn scan(&mut self) -> Result<Scan, DbError> {
        let node = self.node()?;
        let alias = self.string()?;
        let table = self.string()?;
        let file = self.string()?;
        let n = self.count()?;
        let mut fields = Vec::with_capacity(n);
        for _ in 0..n {
            fields.push((self.string()?, self.dtype()?));
        }
        let selected = self.cols()?;
        let n = self.count()?;
        let mut filters = Vec::with_capacity(n);
        for _ in 0..n {
            filters.push(Restriction {
                col: self.usize()?,
                op: self.pred()?,
                value: self.value()?,
            });
        }
        let n = self.count()?;
        let mut self_joins = Vec::with_capacity(n);
        for _ in 0..n {
            self_joins.push((self.usize()?, self.usize()?, self.dtype()?));
        }
        let arity = fields.len();
        let in_range = selected.iter().all(|c| *c < arity)
            && filters.iter().all(|f| f.col < arity)
            && self_joins.iter().all(|(l, r, _)| *l < arity && *r < arity);
        if !in_range {
            return Err(malformed("scan column out of range"));
        }
        Ok(Scan {
            node,
            alias,
            table,
            file,
            fields,
            selected,
            filters,
            self_joins,
            stats: None,
        })
    }

    fn join(&mut self) -> Result<(u32, Vec<ColId>, Vec<JoinCond>), DbError> {
        let node = self.node()?;
        let selected = self.cols()?;
        let n = self.count()?;
        let mut conds = Vec::with_capacity(n);
        for _ in 0..n {
            conds.push(JoinCond {
                left: self.usize()?,
                right: self.usize()?,
                dtype: self.dtype()?,
            });
        }
        Ok((node, selected, conds))
    }

    fn op(&mut self) -> Result<Operator, DbError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(malformed("plan too deep"));
        }
        let op = match self.varint()? {
            TAG_SEQSCAN => Operator::SeqScan(SeqScan::from_scan(self.scan()?)),
            TAG_INDEXSCAN => {
                let scan = self.scan()?;
                let index_col = self.usize()?;
                let index_name = self.string()?;
                let op = self.pred()?;
                let unique = self.flag()?;
                let literal = if self.flag()? {
                    Some(self.value()?)
                } else {
                    None
                };
                if index_col >= scan.fields.len() {
                    return Err(malformed("index column out of range"));
                }
                Operator::IndexScan(IndexScan::from_parts(
                    scan, index_col, index_name, op, unique, literal,
                ))
            }
            TAG_NLJOIN => {
                let (node, selected, conds) = self.join()?;
                let index_join_col = if self.flag()? {
                    Some(self.usize()?)
                } else {
                    None
                };
                let left = self.op()?;
                let right = self.op()?;
                let join = checked_join(node, left, right, selected, conds)?;
                if let Some(c) = index_join_col {
                    if c >= join.left.num_output_cols() {
                        return Err(malformed("join key column out of range"));
                    }
                }
                Operator::NlJoin(NlJoin::from_join(join, index_join_col))
            }
            TAG_NBJOIN => {
                let (node, selected, conds) = self.join()?;
                let left = self.op()?;
                let right = self.op()?;
                Operator::NbJoin(NbJoin::from_join(checked_join(
                    node, left, right, selected, conds,
                )?))
            }
            TAG_REMOTE => {
                let node = self.node()?;
                let addr = self.string()?;
                let child = self.op()?;
                Operator::Remote(Remote::new(node, &addr, child))
            }
            TAG_UNION => {
                let node = self.node()?;
                let mode = match self.varint()? {
                    0 => UnionMode::Plain,
                    1 => {
                        let n = self.count()?;
                        let mut pivots = Vec::with_capacity(n);
                        for _ in 0..n {
                            pivots.push((self.value()?, self.usize()?));
                        }
                        UnionMode::Pivot(pivots)
                    }
                    t => return Err(malformed(&format!("union mode {}", t))),
                };
                let n = self.count()?;
                let mut children = Vec::with_capacity(n);
                for _ in 0..n {
                    children.push(self.op()?);
                }
                Operator::Union(
                    Union::with_mode(node, children, mode)
                        .map_err(|e| malformed(&e.to_string()))?,
                )
            }
            TAG_MATERIAL => {
                let node = self.node()?;
                let rows = if self.flag()? {
                    let n = self.count()?;
                    let mut rows = Vec::with_capacity(n);
                    for _ in 0..n {
                        let arity = self.count()?;
                        let mut columns = Vec::with_capacity(arity);
                        for _ in 0..arity {
                            columns.push(self.bytes()?);
                        }
                        rows.push(Tuple::new(columns));
                    }
                    Some(rows)
                } else {
                    None
                };
                let child = self.op()?;
                Operator::Material(Material::from_rows(node, child, rows))
            }
            TAG_DUMMY => Operator::Dummy(Dummy::new(self.node()?)),
            tag => return Err(malformed(&format!("unknown operator tag {}", tag))),
        };
        self.depth -= 1;
        Ok(op)
    }
}

fn checked_join(
    node: u32,
    left: Operator,
    right: Operator,
    selected: Vec<ColId>,
    conds: Vec<JoinCond>,
) -> Result<Join, DbError> {
    let (l, r) = (left.num_output_cols(), right.num_output_cols());
    let in_range = selected.iter().all(|c| *c < l + r)
        && conds.iter().all(|c| c.left < l && c.right < r);
    if !in_range {
        return Err(malformed("join column out of range"));
    }
    Ok(Join::from_parts(node, left, right, selected, conds))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::ExecEnv;
    use crate::opiterator::testutil::*;
    use common::catalog::Catalog;
    use std::sync::Arc;
    use common::Query;

    fn collect(op: &mut Operator, env: &Arc<ExecEnv>) -> Vec<Tuple> {
        op.open(None, env).unwrap();
        let mut rows = Vec::new();
        while let Some(t) = op.next().unwrap() {
            rows.push(t);
        }
        op.close().unwrap();
        rows
    }

    /// One plan per operator kind that can run on a single node.
    fn plans(fx: &Fixture) -> Vec<Operator> {
        let q = Query::new()
            .table("R", "r")
            .table("S", "s")
            .output("r._id")
            .output("s.v")
            .join("r.fk", "s._id")
            .gt("s.v", Value::Int(-5));
        let r = fx.db.get_table("R").unwrap();
        let s = fx.db.get_table("S").unwrap();
        let rs = || Operator::SeqScan(SeqScan::new(0, "r", r, "r.0", &q, None).unwrap());
        let ss = || Operator::SeqScan(SeqScan::new(0, "s", s, "s.0", &q, None).unwrap());
        let ridx = Query::new()
            .table("R", "r")
            .output("r.fk")
            .gt("r._id", Value::Int(1))
            .eq("r.name", Value::str("b"));
        let idx = IndexScan::new(0, "r", r, "r.0", &ridx, None).unwrap();
        let corr = IndexScan::correlated(0, "s", s, "s.0", &q, None, "_id", 4.0).unwrap();
        let built = Material::build(0, rs(), &fx.env).unwrap();
        vec![
            rs(),
            Operator::IndexScan(idx),
            Operator::NlJoin(NlJoin::new(0, rs(), ss(), &q).unwrap()),
            Operator::NlJoin(
                NlJoin::correlated(0, rs(), Operator::IndexScan(corr), &q, 0).unwrap(),
            ),
            Operator::NbJoin(NbJoin::new(0, rs(), ss(), &q).unwrap()),
            Operator::Union(Union::plain(0, vec![rs(), rs()]).unwrap()),
            Operator::Material(built),
            Operator::Material(Material::new(0, rs())),
            Operator::Dummy(Dummy::new(0)),
        ]
    }

    fn fx() -> Fixture {
        let mut fx = fixture(&[("S", &["_id", "v"], vec![vec![10, -1], vec![20, 2]])]);
        let table = common::table::Table::new(
            "R".to_string(),
            common::TableSchema::from_vecs(
                vec!["_id", "fk", "name"],
                vec![DataType::Int, DataType::Int, DataType::String],
            ),
            vec![common::table::Partition::new(0, "r.0")],
        );
        let lines = ["1|10|a", "2|20|b", "3|10|b"];
        fx.add_table(table, &lines.iter().map(|l| l.to_string()).collect::<Vec<_>>());
        fx
    }

    #[test]
    fn test_round_trip_executes_identically() {
        let fx = fx();
        for mut plan in plans(&fx) {
            let bytes = encode(&plan);
            assert_eq!(bytes.len(), encoded_len(&plan));
            let mut decoded = decode(bytes.clone()).unwrap();
            assert_eq!(bytes, encode(&decoded), "{}", plan);
            let expected = collect(&mut plan, &fx.env);
            assert_eq!(expected, collect(&mut decoded, &fx.env), "{}", plan);
        }
    }

    #[test]
    fn test_remote_and_pivot_round_trip() {
        let fx = fx();
        let s = fx.db.get_table("S").unwrap();
        let q = Query::new().table("S", "s").output("s.v");
        let part = |f: &str| {
            Operator::IndexScan(
                IndexScan::correlated(1, "s", s, f, &q, None, "_id", 1.0).unwrap(),
            )
        };
        let pivot = Union::pivot(
            1,
            vec![part("s.1"), part("s.0")],
            vec![Value::Int(100), Value::Int(0)],
        )
        .unwrap();
        let plan = Operator::Remote(Remote::new(0, "127.0.0.1:4000", Operator::Union(pivot)));
        let bytes = encode(&plan);
        let decoded = decode(bytes.clone()).unwrap();
        assert_eq!(bytes, encode(&decoded));
        match decoded {
            Operator::Remote(r) => {
                assert_eq!("127.0.0.1:4000", r.addr);
                assert_eq!(1, r.child.node_id());
            }
            other => panic!("decoded {}", other),
        }
    }

    #[test]
    fn test_rejects_malformed() {
        let bytes = encode(&Operator::Dummy(Dummy::new(300)));
        assert!(decode(bytes.clone()).is_ok());

        let mut trailing = bytes.to_vec();
        trailing.push(0);
        assert!(decode(Bytes::from(trailing)).is_err());
        assert!(decode(bytes.slice(..bytes.len() - 1)).is_err());
        assert!(decode(Bytes::from_static(&[9, 0])).is_err());
        assert!(decode(Bytes::new()).is_err());
        // A string length running past the end.
        assert!(decode(Bytes::from_static(&[5, 0, 0x7f, b'x'])).is_err());
        // Nested unions deeper than any real plan.
        let mut deep = Vec::new();
        for _ in 0..(MAX_DEPTH + 1) {
            deep.extend_from_slice(&[6, 0, 0, 1]);
        }
        deep.extend_from_slice(&[8, 0]);
        assert!(decode(Bytes::from(deep)).is_err());
    }

    #[test]
    fn test_varints() {
        for v in &[0i64, 1, -1, 63, -64, 64, i64::MAX, i64::MIN] {
            let mut buf = BytesMut::new();
            put_signed(&mut buf, *v);
            let mut d = Decoder {
                buf: buf.freeze(),
                pos: 0,
                depth: 0,
            };
            assert_eq!(*v, d.signed().unwrap());
        }
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 300);
        assert_eq!(&[0xac, 0x02][..], &buf[..]);
    }
}
