use bytes::Bytes;
use common::ids::NodeId;
use common::storage_trait::IndexStore;
use common::DbError;
use parking_lot::Mutex;

use std::collections::HashMap;
use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Pools the read-only file images and the idle sockets of a node.
///
/// Each pool sits behind one mutex that is only held to look up or insert an
/// entry. Reading a file or dialing a node happens outside of it.
pub struct IoManager {
    /// Relative partition paths resolve against this directory.
    data_dir: PathBuf,
    files: Mutex<HashMap<PathBuf, Bytes>>,
    connections: Mutex<HashMap<NodeId, Vec<TcpStream>>>,
}

impl IoManager {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        IoManager {
            data_dir: data_dir.as_ref().to_path_buf(),
            files: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    /// Returns the whole content of a partition file. The first caller reads the file into
    /// an in-memory copy, it is not mapped. Later callers share that buffer, which lives as
    /// long as the pool.
    ///
    /// # Arguments
    ///
    /// * `file` - Partition file, relative to the data directory or absolute.
    pub fn open_file(&self, file: &str) -> Result<Bytes, DbError> {
        let path = self.resolve(file);
        if let Some(data) = self.files.lock().get(&path) {
            return Ok(data.clone());
        }
        debug!("io::open_file loading {:?}", path);
        let data = Bytes::from(fs::read(&path).map_err(|e| {
            DbError::IOError(format!("cannot read {}: {}", path.display(), e))
        })?);
        Ok(self.files.lock().entry(path).or_insert(data).clone())
    }

    /// Takes an idle socket to `node` out of the pool, or dials `addr`. The flag tells
    /// whether the socket was reused.
    pub fn connect(&self, node: NodeId, addr: &str) -> Result<(TcpStream, bool), DbError> {
        let idle = self
            .connections
            .lock()
            .get_mut(&node)
            .and_then(|pool| pool.pop());
        match idle {
            Some(stream) => {
                debug!("io::connect reusing socket to node {}", node);
                Ok((stream, true))
            }
            None => Ok((Self::dial(addr)?, false)),
        }
    }

    /// Opens a fresh socket.
    pub fn dial(addr: &str) -> Result<TcpStream, DbError> {
        debug!("io::dial {}", addr);
        let stream = TcpStream::connect(addr)
            .map_err(|e| DbError::TransportError(format!("cannot reach {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Gives a socket whose last exchange completed back to the pool.
    pub fn release(&self, node: NodeId, stream: TcpStream) {
        self.connections
            .lock()
            .entry(node)
            .or_insert_with(Vec::new)
            .push(stream);
    }

    /// Number of idle sockets to `node`.
    pub fn idle_connections(&self, node: NodeId) -> usize {
        self.connections
            .lock()
            .get(&node)
            .map(|p| p.len())
            .unwrap_or(0)
    }
}

/// What an operator needs from the node executing it.
pub struct ExecEnv {
    /// Node this environment belongs to.
    pub node: NodeId,
    pub io: IoManager,
    pub store: Arc<dyn IndexStore>,
}

impl ExecEnv {
    /// # Arguments
    ///
    /// * `node` - Id of the local node.
    /// * `data_dir` - Directory partition paths are relative to.
    /// * `store` - Index store holding the local partitions' indexes.
    pub fn new<P: AsRef<Path>>(node: NodeId, data_dir: P, store: Arc<dyn IndexStore>) -> Arc<Self> {
        Arc::new(ExecEnv {
            node,
            io: IoManager::new(data_dir),
            store,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use common::testutil::*;
    use std::net::TcpListener;

    #[test]
    fn test_file_pool_shares_buffer() {
        let dir = gen_random_dir();
        write_int_file(dir.join("t.0"), &[vec![1, 2]]);
        let io = IoManager::new(&dir);
        let a = io.open_file("t.0").unwrap();
        let b = io.open_file("t.0").unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert!(io.open_file("missing").is_err());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_connection_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let io = IoManager::new(".");
        let (stream, reused) = io.connect(3, &addr).unwrap();
        assert!(!reused);
        io.release(3, stream);
        assert_eq!(1, io.idle_connections(3));
        let (_stream, reused) = io.connect(3, &addr).unwrap();
        assert!(reused);
        assert_eq!(0, io.idle_connections(3));
    }
}
