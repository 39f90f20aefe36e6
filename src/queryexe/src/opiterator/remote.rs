use bytes::Bytes;
use common::ids::{ColId, NodeId};
use common::{DataType, DbError, Tuple};
use std::io::{self, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;

use super::{ExecState, OpIterator, Operator};
use crate::codec;
use crate::cost::COST_NET_XFER_BYTE;
use crate::io::{ExecEnv, IoManager};
use crate::protocol::{self, Line, Opcode};

#[derive(Default)]
struct RemoteState {
    env: Option<Arc<ExecEnv>>,
    conn: Option<BufReader<TcpStream>>,
    /// Encoded child, built once per execution.
    plan: Option<Bytes>,
    /// A parameterized session is open on `conn`.
    session: bool,
    /// Result lines are still coming.
    streaming: bool,
    /// The last exchange on `conn` ended with the terminator.
    clean: bool,
    /// `conn` was used before this execution and no row came back on it yet.
    reused: bool,
    /// Key of the current execution.
    key: Option<Bytes>,
}

/// Runs its child on another node and reads the child's rows back over a pooled socket.
#[derive(Clone, Debug)]
pub struct Remote {
    /// Node consuming the rows.
    pub(crate) node: NodeId,
    /// Address of the node running the child.
    pub(crate) addr: String,
    pub(crate) child: Box<Operator>,
    state: ExecState<RemoteState>,
}

fn transport(e: io::Error) -> DbError {
    DbError::TransportError(e.to_string())
}

/// Bytes to send for the next execution. A parameterized session that stays parameterized
/// only needs the key; anything else ends the session and sends a full request.
fn request(plan: &[u8], session: bool, key: Option<&[u8]>) -> Result<Vec<u8>, DbError> {
    let mut msg = Vec::with_capacity(plan.len() + 16);
    let build = |msg: &mut Vec<u8>| -> io::Result<()> {
        if session {
            if let Some(k) = key {
                return protocol::write_frame(msg, k);
            }
            protocol::write_end_of_keys(msg)?;
        }
        match key {
            Some(k) => {
                protocol::write_request(msg, Opcode::Param, plan)?;
                protocol::write_frame(msg, k)
            }
            None => protocol::write_request(msg, Opcode::Query, plan),
        }
    };
    build(&mut msg).map_err(|e| DbError::ProtocolError(e.to_string()))?;
    Ok(msg)
}

fn send(stream: &mut TcpStream, msg: &[u8]) -> io::Result<()> {
    stream.write_all(msg)?;
    stream.flush()
}

impl Remote {
    /// # Arguments
    ///
    /// * `node` - Node pulling the rows.
    /// * `addr` - Address of the node executing `child`.
    /// * `child` - Plan to run remotely.
    pub fn new(node: NodeId, addr: &str, child: Operator) -> Self {
        Remote {
            node,
            addr: addr.to_string(),
            child: Box::new(child),
            state: ExecState::default(),
        }
    }

    fn env(&self) -> Result<Arc<ExecEnv>, DbError> {
        self.state
            .env
            .clone()
            .ok_or_else(|| DbError::ExecutionError(String::from("Remote is not open")))
    }

    /// Starts the next execution of the child, on the current socket when its last
    /// exchange completed, else on a pooled or fresh one.
    fn start(&mut self, key: Option<&[u8]>) -> Result<(), DbError> {
        let env = self.env()?;
        let plan = match &self.state.plan {
            Some(p) => p.clone(),
            None => {
                let p = codec::encode(&self.child);
                self.state.plan = Some(p.clone());
                p
            }
        };
        if let Some(mut conn) = self.state.conn.take() {
            if self.state.clean {
                let msg = request(&plan, self.state.session, key)?;
                match send(conn.get_mut(), &msg) {
                    Ok(()) => {
                        self.state.conn = Some(conn);
                        self.started(key, true);
                        return Ok(());
                    }
                    Err(e) => debug!("remote: socket to {} failed: {}", self.addr, e),
                }
            }
        }

        let msg = request(&plan, false, key)?;
        let child = self.child.node_id();
        let (mut stream, mut reused) = env.io.connect(child, &self.addr)?;
        if let Err(e) = send(&mut stream, &msg) {
            if !reused {
                return Err(transport(e));
            }
            debug!("remote: pooled socket to {} is stale, dialing", self.addr);
            stream = IoManager::dial(&self.addr)?;
            send(&mut stream, &msg).map_err(transport)?;
            reused = false;
        }
        self.state.conn = Some(BufReader::new(stream));
        self.started(key, reused);
        Ok(())
    }

    fn started(&mut self, key: Option<&[u8]>, reused: bool) {
        self.state.session = key.is_some();
        self.state.streaming = true;
        self.state.clean = false;
        self.state.reused = reused;
        self.state.key = key.map(Bytes::copy_from_slice);
    }

    /// Sends the current execution again on a fresh socket. Used when a socket that served
    /// earlier requests turns out to be closed before answering.
    fn redial(&mut self) -> Result<(), DbError> {
        let plan = self
            .state
            .plan
            .clone()
            .ok_or_else(|| DbError::ExecutionError(String::from("Remote is not open")))?;
        let key = self.state.key.clone();
        let msg = request(&plan, false, key.as_deref())?;
        debug!("remote: socket to {} was closed before answering, dialing", self.addr);
        let mut stream = IoManager::dial(&self.addr)?;
        send(&mut stream, &msg).map_err(transport)?;
        self.state.conn = Some(BufReader::new(stream));
        self.started(key.as_deref(), false);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), DbError> {
        while self.next()?.is_some() {}
        Ok(())
    }
}

/// Ships `plan` to the node at `addr`, which runs it and discards the rows. Nothing tells
/// whether the plan ran, so the socket is not pooled again.
///
/// # Arguments
///
/// * `env` - The sending node.
/// * `node` - Node executing the plan.
/// * `addr` - Address of `node`.
/// * `plan` - Plan to execute.
pub fn fire_and_forget(
    env: &Arc<ExecEnv>,
    node: NodeId,
    addr: &str,
    plan: &Operator,
) -> Result<(), DbError> {
    let mut msg = Vec::new();
    protocol::write_request(&mut msg, Opcode::Fire, &codec::encode(plan)).map_err(transport)?;
    let (mut stream, reused) = env.io.connect(node, addr)?;
    if let Err(e) = send(&mut stream, &msg) {
        if !reused {
            return Err(transport(e));
        }
        stream = IoManager::dial(addr)?;
        send(&mut stream, &msg).map_err(transport)?;
    }
    debug!("remote: fired plan at node {}", node);
    Ok(())
}

impl OpIterator for Remote {
    fn open(&mut self, key: Option<&[u8]>, env: &Arc<ExecEnv>) -> Result<(), DbError> {
        self.state.env = Some(env.clone());
        self.state.plan = None;
        self.state.conn = None;
        self.state.session = false;
        self.start(key)
    }

    fn reopen(&mut self, key: Option<&[u8]>) -> Result<(), DbError> {
        self.drain()?;
        self.start(key)
    }

    fn next(&mut self) -> Result<Option<Tuple>, DbError> {
        if !self.state.streaming {
            return Ok(None);
        }
        let arity = self.child.num_output_cols();
        loop {
            let conn = self
                .state
                .conn
                .as_mut()
                .ok_or_else(|| DbError::ExecutionError(String::from("Remote is not open")))?;
            match protocol::read_line(conn)? {
                Line::Row(line) => {
                    self.state.reused = false;
                    return Ok(Some(Tuple::parse_line(line, arity)));
                }
                Line::End => {
                    self.state.streaming = false;
                    self.state.clean = true;
                    self.state.reused = false;
                    return Ok(None);
                }
                Line::Closed if self.state.reused => {
                    self.state.conn = None;
                    self.redial()?;
                }
                Line::Closed => {
                    debug!("remote: {} closed the stream", self.addr);
                    self.state.streaming = false;
                    self.state.clean = false;
                    self.state.conn = None;
                    return Ok(None);
                }
            }
        }
    }

    fn close(&mut self) -> Result<(), DbError> {
        let env = self.state.env.take();
        if let (Some(mut conn), Some(env)) = (self.state.conn.take(), env) {
            if self.state.clean && !self.state.streaming {
                let ended = if self.state.session {
                    let stream = conn.get_mut();
                    protocol::write_end_of_keys(stream).and_then(|_| stream.flush())
                } else {
                    Ok(())
                };
                if ended.is_ok() {
                    env.io.release(self.child.node_id(), conn.into_inner());
                }
            }
        }
        self.state.streaming = false;
        self.state.clean = false;
        self.state.session = false;
        self.state.reused = false;
        self.state.key = None;
        self.state.plan = None;
        Ok(())
    }

    fn node_id(&self) -> NodeId {
        self.node
    }

    fn has_col(&self, col: &str) -> bool {
        self.child.has_col(col)
    }

    fn output_col_id(&self, col: &str) -> Option<ColId> {
        self.child.output_col_id(col)
    }

    fn col_type(&self, col: &str) -> Option<DataType> {
        self.child.col_type(col)
    }

    fn num_output_cols(&self) -> usize {
        self.child.num_output_cols()
    }

    /// The child's cost plus shipping its output.
    fn est_cost(&self) -> f64 {
        self.child.est_cost() + self.transfer_cost()
    }

    fn rescan_cost(&self) -> f64 {
        self.child.rescan_cost() + self.transfer_cost()
    }

    fn est_cardinality(&self) -> f64 {
        self.child.est_cardinality()
    }

    fn est_col_length(&self, col: ColId) -> f64 {
        self.child.est_col_length(col)
    }

    fn est_distinct(&self, col: ColId) -> f64 {
        self.child.est_distinct(col)
    }
}

impl Remote {
    fn transfer_cost(&self) -> f64 {
        COST_NET_XFER_BYTE * self.child.est_tuple_length() * self.child.est_cardinality()
    }
}

#[cfg(test)]
mod test {
    use super::super::testutil::*;
    use super::super::SeqScan;
    use super::*;
    use crate::protocol::{read_frame, read_key, read_opcode, stream_results};
    use common::catalog::Catalog;
    use common::testutil::tuple_to_ints;
    use common::{Query, Value};
    use std::net::TcpListener;
    use std::thread;

    /// Serves Q and P requests on every accepted connection, the way a node does.
    fn serve(listener: TcpListener, env: Arc<ExecEnv>) {
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = stream.unwrap();
                let env = env.clone();
                thread::spawn(move || {
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut writer = stream;
                    while let Some(op) = read_opcode(&mut reader).unwrap() {
                        let plan = read_frame(&mut reader).unwrap();
                        let mut plan = codec::decode(plan).unwrap();
                        match op {
                            Opcode::Query => {
                                plan.open(None, &env).unwrap();
                                stream_results(&mut plan, &mut writer).unwrap();
                                plan.close().unwrap();
                            }
                            Opcode::Param => {
                                let mut opened = false;
                                while let Some(key) = read_key(&mut reader).unwrap() {
                                    if opened {
                                        plan.reopen(Some(&key[..])).unwrap();
                                    } else {
                                        plan.open(Some(&key[..]), &env).unwrap();
                                        opened = true;
                                    }
                                    stream_results(&mut plan, &mut writer).unwrap();
                                }
                                if opened {
                                    plan.close().unwrap();
                                }
                            }
                            _ => unreachable!(),
                        }
                    }
                });
            }
        });
    }

    #[test]
    fn test_remote_query_and_pool() {
        let fx = fixture(&[("T", &["_id", "v"], vec![vec![1, 10], vec![2, 20], vec![3, 30]])]);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        serve(listener, fx.env.clone());

        let q = Query::new().table("T", "a").output("a.v").gt("a._id", Value::Int(1));
        let table = fx.db.get_table("T").unwrap();
        let scan = SeqScan::new(1, "a", table, "t.0", &q, None).unwrap();
        let mut op = Operator::Remote(Remote::new(0, &addr, Operator::SeqScan(scan)));
        assert_eq!(vec![vec![20], vec![30]], run(&mut op, &fx.env));
        // The socket went back to the pool and serves the next execution.
        assert_eq!(1, fx.env.io.idle_connections(1));
        assert_eq!(vec![vec![20], vec![30]], run(&mut op, &fx.env));
        assert_eq!(1, fx.env.io.idle_connections(1));
    }

    #[test]
    fn test_parameterized_session() {
        let fx = fixture(&[("T", &["_id", "v"], vec![vec![1, 10], vec![2, 20], vec![3, 30]])]);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        serve(listener, fx.env.clone());

        let q = Query::new().table("T", "a").output("a.v");
        let table = fx.db.get_table("T").unwrap();
        let scan =
            super::super::IndexScan::correlated(1, "a", table, "t.0", &q, None, "_id", 2.0)
                .unwrap();
        let mut op = Remote::new(0, &addr, Operator::IndexScan(scan));
        op.open(Some(b"2"), &fx.env).unwrap();
        assert_eq!(vec![20], tuple_to_ints(&op.next().unwrap().unwrap()));
        op.reopen(Some(b"3")).unwrap();
        assert_eq!(vec![30], tuple_to_ints(&op.next().unwrap().unwrap()));
        assert!(op.next().unwrap().is_none());
        op.reopen(Some(b"9")).unwrap();
        assert!(op.next().unwrap().is_none());
        op.close().unwrap();
        assert_eq!(1, fx.env.io.idle_connections(1));
    }

    #[test]
    fn test_peer_gone_is_end_of_stream() {
        let fx = fixture(&[("T", &["_id"], vec![vec![1]])]);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            read_opcode(&mut reader).unwrap();
            read_frame(&mut reader).unwrap();
            stream.write_all(b"7\n").unwrap();
        });
        let q = Query::new().table("T", "a").output("a._id");
        let table = fx.db.get_table("T").unwrap();
        let scan = SeqScan::new(1, "a", table, "t.0", &q, None).unwrap();
        let mut op = Operator::Remote(Remote::new(0, &addr, Operator::SeqScan(scan)));
        assert_eq!(vec![vec![7]], run(&mut op, &fx.env));
        assert_eq!(0, fx.env.io.idle_connections(1));
    }
}
