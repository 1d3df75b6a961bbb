//! Body of the task that serves one client connection.
//!
//! The connection registers itself, then loops: read a request, wait at the
//! flow gate, execute, write the response. Cancellation is observed while
//! reading, while paused, and while writing. Execution itself always runs to
//! completion so no tree operation is abandoned halfway.

use std::sync::Arc;

use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    command::{self, Response},
    registry::ConnectionId,
    server::ServerContext,
    wire::{self, Frame},
};

/// Why a connection task stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The server was shutting down when the connection arrived.
    Rejected,
    /// The client closed its side, or the stream failed.
    EndOfStream,
    Cancelled,
}

pub async fn serve<R, W>(ctx: Arc<ServerContext>, mut reader: R, mut writer: W) -> Exit
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(registration) = ctx.registry.register() else {
        debug!("not accepting connections, closing stream");
        return Exit::Rejected;
    };
    let conn = registration.id();
    debug!(%conn, "serving connection");

    let exit = run_session(&ctx, conn, registration.token(), &mut reader, &mut writer).await;
    debug!(%conn, ?exit, "connection finished");

    drop(registration);
    if let Err(err) = writer.shutdown().await {
        debug!(%conn, error = %err, "failed to shut down stream");
    }
    exit
}

async fn run_session<R, W>(
    ctx: &ServerContext,
    conn: ConnectionId,
    token: &CancellationToken,
    reader: &mut R,
    writer: &mut W,
) -> Exit
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = select! {
            biased;
            _ = token.cancelled() => return Exit::Cancelled,
            read = wire::read_line(reader) => match read {
                Ok(Some(frame)) => frame,
                Ok(None) => return Exit::EndOfStream,
                Err(err) => {
                    debug!(%conn, error = %err, "read failed, closing connection");
                    return Exit::EndOfStream;
                }
            },
        };

        select! {
            biased;
            _ = token.cancelled() => return Exit::Cancelled,
            _ = ctx.gate.await_resume() => {}
        }

        let response = match frame {
            Frame::Line(line) => command::dispatch(&ctx.store, &line, token).await,
            Frame::Oversized => {
                debug!(%conn, "request line too long");
                Response::IllFormed
            }
        };
        let response = response.to_string();

        select! {
            biased;
            _ = token.cancelled() => return Exit::Cancelled,
            written = wire::write_line(writer, &response) => {
                if let Err(err) = written {
                    debug!(%conn, error = %err, "write failed, closing connection");
                    return Exit::EndOfStream;
                }
            }
        }
    }
}
