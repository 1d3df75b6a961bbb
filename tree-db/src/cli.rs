use std::net::SocketAddr;

use clap::Parser;

/// Concurrent key/value server backed by a lock-coupled binary tree.
///
/// Clients speak a line protocol over TCP. Standard input is the operator
/// console: `s` pauses clients, `g` releases them, `p [file]` dumps the tree,
/// and end of input shuts the server down.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,
}
