//! TCP front end and the shutdown sequence.
//!
//! [`Server::start`] spawns the interrupt monitor and the accept loop and
//! hands back a [`RunningServer`]. Consuming that handle with
//! [`RunningServer::shutdown`] is the only way to stop the server cleanly: it
//! cancels every connection, waits until all of them have unregistered, and
//! only then tears down the store.

use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, ensure};
use futures::Stream;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection, gate::FlowGate, interrupt, interrupt::InterruptMonitor,
    registry::ConnectionRegistry, store::TreeStore,
};

/// State shared by every connection task and the console.
pub struct ServerContext {
    pub store: Arc<TreeStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub gate: FlowGate,
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerContext {
    pub fn new() -> Self {
        Self {
            store: Arc::new(TreeStore::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            gate: FlowGate::new(),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            ctx: Arc::new(ServerContext::new()),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Starts serving with Ctrl-C as the interrupt source.
    pub fn start(self) -> Result<RunningServer> {
        self.start_with_interrupts(interrupt::ctrl_c_interrupts())
    }

    pub fn start_with_interrupts<S>(self, interrupts: S) -> Result<RunningServer>
    where
        S: Stream<Item = ()> + Send + 'static,
    {
        let Server { listener, ctx } = self;
        let local_addr = listener
            .local_addr()
            .context("failed to read listener address")?;

        let monitor = InterruptMonitor::spawn(Arc::clone(&ctx.registry), interrupts);
        let stop_listening = CancellationToken::new();
        let listener_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&ctx),
            stop_listening.clone(),
        ));

        Ok(RunningServer {
            ctx,
            local_addr,
            monitor,
            stop_listening,
            listener_task,
        })
    }
}

pub struct RunningServer {
    ctx: Arc<ServerContext>,
    local_addr: SocketAddr,
    monitor: InterruptMonitor,
    stop_listening: CancellationToken,
    listener_task: JoinHandle<()>,
}

impl RunningServer {
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancels every connection, waits for all of them to finish, then
    /// releases the store and stops listening.
    pub async fn shutdown(self) -> Result<()> {
        let RunningServer {
            ctx,
            monitor,
            stop_listening,
            listener_task,
            ..
        } = self;

        monitor.retire().await;

        let cancelled = ctx.registry.close();
        info!(cancelled, "closing all connections");
        ctx.registry.wait_for_drain().await;
        ensure!(
            ctx.registry.is_empty(),
            "connections still registered after drain"
        );

        info!("exiting database");
        ctx.store.teardown();

        stop_listening.cancel();
        listener_task.await.context("listener task failed")?;
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, stop: CancellationToken) {
    loop {
        select! {
            biased;
            _ = stop.cancelled() => break,
            accept_result = listener.accept() => handle_accept_result(accept_result, &ctx),
        }
    }
    debug!("listener stopped");
}

fn handle_accept_result(result: io::Result<(TcpStream, SocketAddr)>, ctx: &Arc<ServerContext>) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, ctx),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, ctx: &Arc<ServerContext>) {
    if !ctx.registry.is_accepting() {
        debug!(%peer, "shutting down, dropping new connection");
        return;
    }

    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        let exit = connection::serve(ctx, BufReader::new(reader), writer).await;
        debug!(%peer, ?exit, "client disconnected");
    });
}
