use crate::server_state::ServerState;
use common::catalog::Catalog;
use common::stats::StatsRequest;
use common::DbError;
use optimizer::stats::local_part_stats;
use queryexe::protocol::{self, Opcode};
use queryexe::{codec, ExecEnv, OpIterator, Operator};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

fn transport(e: std::io::Error) -> DbError {
    DbError::TransportError(e.to_string())
}

/// Serves the requests arriving on one connection until the peer closes it.
///
/// # Arguments
///
/// * `stream` - Connection to a coordinator or another node.
/// * `state` - The node serving it.
pub fn handle_client_request(stream: TcpStream, state: Arc<ServerState>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| String::from("unknown"));
    debug!("handler: connection from {}", peer);
    match serve(stream, &state) {
        Ok(requests) => debug!("handler: {} closed after {} requests", peer, requests),
        Err(e) => error!("handler: dropping connection from {}: {}", peer, e),
    }
}

fn serve(stream: TcpStream, state: &ServerState) -> Result<usize, DbError> {
    let mut writer = BufWriter::new(stream.try_clone()?);
    let mut reader = BufReader::new(stream);
    let mut requests = 0;
    while let Some(op) = protocol::read_opcode(&mut reader)? {
        match op {
            Opcode::Query => {
                let mut plan = read_plan(&mut reader, state)?;
                run_query(&mut plan, &state.env, &mut writer)?;
            }
            Opcode::Param => {
                let mut plan = read_plan(&mut reader, state)?;
                run_param(&mut plan, &state.env, &mut reader, &mut writer)?;
            }
            Opcode::Stats => answer_stats(state, &mut reader, &mut writer)?,
            Opcode::Fire => {
                let mut plan = read_plan(&mut reader, state)?;
                run_discard(&mut plan, &state.env)?;
            }
        }
        requests += 1;
    }
    Ok(requests)
}

/// Decodes a shipped plan, which has to be rooted at this node.
fn read_plan<R: Read>(r: &mut R, state: &ServerState) -> Result<Operator, DbError> {
    let plan = codec::decode(protocol::read_frame(r)?)?;
    if plan.node_id() != state.node() {
        return Err(DbError::ProtocolError(format!(
            "node {} received a plan for node {}",
            state.node(),
            plan.node_id()
        )));
    }
    Ok(plan)
}

fn run_query<W: Write>(plan: &mut Operator, env: &Arc<ExecEnv>, w: &mut W) -> Result<(), DbError> {
    plan.open(None, env)?;
    let sent = protocol::stream_results(plan, w);
    let closed = plan.close();
    let rows = sent?;
    closed?;
    debug!("handler: query sent {} rows", rows);
    Ok(())
}

/// Runs the plan once per key until the session ends, each run closed by a terminator.
fn run_param<R: Read, W: Write>(
    plan: &mut Operator,
    env: &Arc<ExecEnv>,
    r: &mut R,
    w: &mut W,
) -> Result<(), DbError> {
    let mut opened = false;
    let mut keys = 0;
    let outcome = loop {
        let key = match protocol::read_key(r) {
            Ok(Some(key)) => key,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let started = if opened {
            plan.reopen(Some(&key[..]))
        } else {
            plan.open(Some(&key[..]), env)
        };
        if let Err(e) = started {
            break Err(e);
        }
        opened = true;
        if let Err(e) = protocol::stream_results(plan, w) {
            break Err(e);
        }
        keys += 1;
    };
    let closed = if opened { plan.close() } else { Ok(()) };
    outcome?;
    closed?;
    debug!("handler: parameterized session ran {} keys", keys);
    Ok(())
}

fn run_discard(plan: &mut Operator, env: &Arc<ExecEnv>) -> Result<(), DbError> {
    plan.open(None, env)?;
    let mut rows = 0;
    let outcome = loop {
        match plan.next() {
            Ok(Some(_)) => rows += 1,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    let closed = plan.close();
    outcome?;
    closed?;
    debug!("handler: discarded {} rows", rows);
    Ok(())
}

fn answer_stats<R: Read, W: Write>(
    state: &ServerState,
    r: &mut R,
    w: &mut W,
) -> Result<(), DbError> {
    let req: StatsRequest = serde_cbor::from_slice(&protocol::read_frame(r)?)?;
    if req.partition.node != state.node() {
        return Err(DbError::ProtocolError(format!(
            "node {} asked for statistics of a partition on node {}",
            state.node(),
            req.partition.node
        )));
    }
    let table = state.db.get_table(&req.table)?;
    let stats = local_part_stats(&state.env, table, &req.partition)?;
    protocol::write_frame(w, &serde_cbor::to_vec(&stats)?).map_err(transport)?;
    w.flush().map_err(transport)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TestCluster;
    use crate::Conductor;
    use common::stats::PartStats;
    use common::table::{Partition, Table};
    use common::testutil::*;
    use common::{DataType, Query, TableSchema};
    use queryexe::opiterator::{IndexScan, SeqScan};
    use queryexe::protocol::Line;
    use std::io::BufRead;

    fn cluster() -> TestCluster {
        let s = Table::new(
            "S".to_string(),
            TableSchema::from_vecs(vec!["_id", "v"], vec![DataType::Int, DataType::Int]),
            vec![],
        );
        TestCluster::start(
            2,
            vec![(s, vec![(1, "s.1", vec![vec![20, 200], vec![21, 210], vec![22, 220]])])],
        )
    }

    fn read_stream<R: BufRead>(r: &mut R, arity: usize) -> Vec<Vec<i64>> {
        let mut rows = Vec::new();
        loop {
            match protocol::read_line(r).unwrap() {
                Line::Row(line) => {
                    rows.push(tuple_to_ints(&common::Tuple::parse_line(line, arity)))
                }
                Line::End => return rows,
                Line::Closed => panic!("stream closed before its terminator"),
            }
        }
    }

    #[test]
    fn test_requests_share_a_connection() {
        init();
        let cluster = cluster();
        let node1 = cluster.states[1].clone();
        let table = node1.db.get_table("S").unwrap().clone();
        let q = Query::new().table("S", "s").output("s._id").output("s.v");
        let scan = SeqScan::new(1, "s", &table, "s.1", &q, None).unwrap();
        let plan = codec::encode(&Operator::SeqScan(scan));

        let stream = TcpStream::connect(node1.db.node_addr(1).unwrap()).unwrap();
        let mut w = stream.try_clone().unwrap();
        let mut r = BufReader::new(stream);

        protocol::write_request(&mut w, Opcode::Query, &plan).unwrap();
        assert_eq!(3, read_stream(&mut r, 2).len());

        let req = StatsRequest {
            table: "S".to_string(),
            partition: Partition::new(1, "s.1"),
        };
        protocol::write_request(&mut w, Opcode::Stats, &serde_cbor::to_vec(&req).unwrap())
            .unwrap();
        let stats: PartStats = serde_cbor::from_slice(&protocol::read_frame(&mut r).unwrap())
            .unwrap();
        assert_eq!(3.0, stats.cardinality);

        // Nothing comes back for a fired plan, the next request is answered as usual.
        protocol::write_request(&mut w, Opcode::Fire, &plan).unwrap();
        protocol::write_request(&mut w, Opcode::Query, &plan).unwrap();
        assert_eq!(3, read_stream(&mut r, 2).len());
    }

    #[test]
    fn test_parameterized_session() {
        init();
        let cluster = cluster();
        let node1 = cluster.states[1].clone();
        let table = node1.db.get_table("S").unwrap().clone();
        let q = Query::new().table("S", "s").output("s.v");
        let probe = IndexScan::correlated(1, "s", &table, "s.1", &q, None, "_id", 1.0).unwrap();

        let stream = TcpStream::connect(node1.db.node_addr(1).unwrap()).unwrap();
        let mut w = stream.try_clone().unwrap();
        let mut r = BufReader::new(stream);
        protocol::write_request(&mut w, Opcode::Param, &codec::encode(&Operator::IndexScan(probe)))
            .unwrap();
        for key in &["21", "5", "22"] {
            protocol::write_frame(&mut w, key.as_bytes()).unwrap();
        }
        protocol::write_end_of_keys(&mut w).unwrap();

        let runs: Vec<Vec<i64>> = (0..3)
            .map(|_| read_stream(&mut r, 1).into_iter().map(|row| row[0]).collect())
            .collect();
        assert_eq!(vec![vec![210], vec![], vec![220]], runs);
    }

    #[test]
    fn test_misrouted_plan_drops_connection() {
        init();
        let cluster = cluster();
        let node1 = cluster.states[1].clone();
        let table = node1.db.get_table("S").unwrap().clone();
        let q = Query::new().table("S", "s").output("s.v");
        let scan = SeqScan::new(0, "s", &table, "s.1", &q, None).unwrap();

        let stream = TcpStream::connect(node1.db.node_addr(1).unwrap()).unwrap();
        let mut w = stream.try_clone().unwrap();
        let mut r = BufReader::new(stream);
        protocol::write_request(&mut w, Opcode::Query, &codec::encode(&Operator::SeqScan(scan)))
            .unwrap();
        assert_eq!(Line::Closed, protocol::read_line(&mut r).unwrap());
    }

    fn drain_rows(conductor: &mut Conductor, q: &Query) -> usize {
        conductor.run_query(q).unwrap();
        let mut rows = 0;
        while conductor.fetch_row().unwrap().is_some() {
            rows += 1;
        }
        rows
    }

    #[test]
    fn test_fired_sockets_are_not_pooled() {
        init();
        let cluster = cluster();
        let mut conductor = Conductor::new(cluster.coordinator()).unwrap();
        conductor.pretreat().unwrap();
        assert_eq!(1, cluster.coordinator().env.io.idle_connections(1));

        let table = cluster.states[1].db.get_table("S").unwrap().clone();
        let q = Query::new().table("S", "s").output("s.v");
        let good = SeqScan::new(1, "s", &table, "s.1", &q, None).unwrap();
        conductor.fire(1, &Operator::SeqScan(good)).unwrap();
        assert_eq!(0, cluster.coordinator().env.io.idle_connections(1));

        // Node 1 rejects a plan rooted elsewhere and drops the connection.
        let misrouted = SeqScan::new(0, "s", &table, "s.1", &q, None).unwrap();
        conductor.fire(1, &Operator::SeqScan(misrouted)).unwrap();
        assert_eq!(0, cluster.coordinator().env.io.idle_connections(1));
        assert_eq!(3, drain_rows(&mut conductor, &q));
    }

    #[test]
    fn test_closed_pooled_socket_is_redialed() {
        init();
        let cluster = cluster();
        let coordinator = cluster.coordinator();
        let mut conductor = Conductor::new(coordinator.clone()).unwrap();
        conductor.pretreat().unwrap();

        // A socket node 1 has already hung up on.
        let mut dead = TcpStream::connect(coordinator.db.node_addr(1).unwrap()).unwrap();
        dead.write_all(b"X").unwrap();
        let mut rest = Vec::new();
        dead.read_to_end(&mut rest).unwrap();
        coordinator.env.io.release(1, dead);
        assert_eq!(2, coordinator.env.io.idle_connections(1));

        let q = Query::new().table("S", "s").output("s.v");
        assert_eq!(3, drain_rows(&mut conductor, &q));
        assert_eq!(3, drain_rows(&mut conductor, &q));
    }
}
