#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod conductor;
pub mod handler;
pub mod server_state;

pub use conductor::Conductor;
pub use server_state::ServerState;

use common::ids::NodeId;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

/// Node settings, read from a json file or the command line.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    /// Id of this node in the cluster description.
    pub node: NodeId,
    /// Cluster description file.
    pub cluster: String,
    /// Directory relative partition paths resolve against.
    pub data: String,
    /// Where indexes persist, empty for none.
    #[serde(default)]
    pub storage: String,
}

/// Accepts connections and serves each one on its own thread.
pub fn serve_forever(listener: TcpListener, state: Arc<ServerState>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&state);
                thread::spawn(move || handler::handle_client_request(stream, state));
            }
            Err(e) => error!("Error accepting connection: {}", e),
        }
    }
}
