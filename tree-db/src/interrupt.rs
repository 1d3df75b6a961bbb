//! Turns interrupts into "cancel every connection" instead of process exit.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::{select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::ConnectionRegistry;

pub struct InterruptMonitor {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl InterruptMonitor {
    /// Starts listening on `interrupts`. Every item cancels all connections
    /// registered at that moment; the server itself keeps running.
    pub fn spawn<S>(registry: Arc<ConnectionRegistry>, interrupts: S) -> Self
    where
        S: Stream<Item = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let task = tokio::spawn(watch_interrupts(registry, interrupts, stop.clone()));
        Self { stop, task }
    }

    /// Stops the monitor and waits for it to finish.
    pub async fn retire(self) {
        self.stop.cancel();
        if let Err(err) = self.task.await {
            warn!(error = ?err, "interrupt monitor failed");
        }
    }
}

/// SIGINT (Ctrl-C) as a stream. Once polled, Ctrl-C no longer terminates the
/// process.
pub fn ctrl_c_interrupts() -> impl Stream<Item = ()> + Send + 'static {
    futures::stream::unfold((), |()| async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some(((), ())),
            Err(err) => {
                warn!(error = ?err, "failed to listen for ctrl-c");
                None
            }
        }
    })
}

async fn watch_interrupts<S>(registry: Arc<ConnectionRegistry>, interrupts: S, stop: CancellationToken)
where
    S: Stream<Item = ()> + Send + 'static,
{
    tokio::pin!(interrupts);

    loop {
        select! {
            biased;
            _ = stop.cancelled() => break,
            interrupt = interrupts.next() => match interrupt {
                Some(()) => {
                    let cancelled = registry.cancel_all();
                    info!(cancelled, "SIGINT received, cancelling all clients");
                }
                None => {
                    debug!("interrupt source closed");
                    stop.cancelled().await;
                    break;
                }
            },
        }
    }
    debug!("interrupt monitor retired");
}
