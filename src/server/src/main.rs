#[macro_use]
extern crate log;
use env_logger::Env;
extern crate clap;
use clap::{App, Arg, ArgMatches};

use std::fs;
use std::net::TcpListener;
use std::process;
use std::sync::Arc;
use std::thread;

use common::catalog::Catalog;
use common::database::Database;
use common::ids::NodeId;
use common::{DbError, Query};
use server::{serve_forever, Conductor, ServerConfig, ServerState};

fn load_config(matches: &ArgMatches) -> Result<ServerConfig, DbError> {
    if let Some(path) = matches.value_of("config") {
        let contents = fs::read_to_string(path)?;
        return serde_json::from_str(&contents).map_err(|e| DbError::ValidationError(e.to_string()));
    }
    let node = matches
        .value_of("node")
        .unwrap_or("0")
        .parse::<NodeId>()
        .map_err(|e| DbError::ValidationError(format!("bad node id: {}", e)))?;
    Ok(ServerConfig {
        node,
        cluster: matches.value_of("cluster").unwrap_or("cluster.json").to_string(),
        data: matches.value_of("data").unwrap_or(".").to_string(),
        storage: matches.value_of("storage").unwrap_or("").to_string(),
    })
}

fn run(config: ServerConfig, query_file: Option<&str>) -> Result<(), DbError> {
    let db = Database::from_json_file(&config.cluster)?;
    let addr = db.node_addr(config.node)?;
    let state = Arc::new(ServerState::new(
        config.node,
        db,
        &config.data,
        config.storage.clone(),
    )?);
    let listener = TcpListener::bind(&addr)?;
    info!("Node {} listening on {}", config.node, addr);

    let path = match query_file {
        Some(path) => path,
        None => {
            serve_forever(listener, state);
            return Ok(());
        }
    };
    let serving = state.clone();
    thread::spawn(move || serve_forever(listener, serving));

    let query: Query = serde_json::from_str(&fs::read_to_string(path)?)
        .map_err(|e| DbError::ValidationError(e.to_string()))?;
    let mut conductor = Conductor::new(state.clone())?;
    let result = conductor.execute(&query)?;
    println!("{}", result.result());
    state.shutdown()
}

/// Entry point for a node.
///
/// Serves plans and statistics requests from the other nodes, each connection on its own
/// thread. With `--query` the coordinator also runs one query and exits.
fn main() {
    env_logger::from_env(Env::default().default_filter_or("info")).init();

    let matches = App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Node of a distributed query engine")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Sets a custom config file")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("node")
                .short("n")
                .long("node")
                .value_name("node")
                .default_value("0")
                .help("Id of this node")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("cluster")
                .long("cluster")
                .value_name("FILE")
                .default_value("cluster.json")
                .help("Cluster description: nodes and table partitions")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("data")
                .short("d")
                .long("data")
                .value_name("DIR")
                .default_value(".")
                .help("Directory holding this node's partition files")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("storage")
                .long("storage")
                .value_name("DIR")
                .default_value("")
                .help("Where indexes persist between runs")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("query")
                .short("q")
                .long("query")
                .value_name("FILE")
                .help("Runs the query in FILE (json) from this node and exits")
                .takes_value(true),
        )
        .get_matches();

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            error!("Cannot read configuration: {}", e);
            process::exit(1);
        }
    };
    info!("Starting sharddb node... {:?}", config);

    if let Err(e) = run(config, matches.value_of("query")) {
        error!("{}", e);
        process::exit(1);
    }
}
