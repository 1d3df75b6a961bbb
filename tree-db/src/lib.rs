//! Multi-client key/value server backed by a concurrent binary search tree.
//!
//! Clients connect over TCP and send one-line requests; an operator drives
//! the server from standard input. Each module focuses on a concrete
//! responsibility:
//!
//! - [`store`] is the tree itself, with one reader/writer lock per node and
//!   hand-over-hand locking on every operation.
//! - [`command`] parses client request lines, executes them, and replays
//!   command files.
//! - [`wire`] frames requests and responses as newline-terminated lines.
//! - [`connection`] is the per-client task: read, wait at the gate, execute,
//!   respond, and clean up on every exit path.
//! - [`registry`] tracks live connections and their cancellation tokens.
//! - [`gate`] is the server-wide pause/resume switch.
//! - [`interrupt`] turns Ctrl-C into "cancel all connections".
//! - [`server`] accepts connections and runs the shutdown sequence.
//! - [`console`] and [`cli`] are the operator-facing surfaces.
//!
//! Integration tests drive a real listener over TCP and spawn the binary.

pub mod cli;
pub mod command;
pub mod connection;
pub mod console;
pub mod gate;
pub mod interrupt;
pub mod registry;
pub mod server;
pub mod store;
pub mod wire;
