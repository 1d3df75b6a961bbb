//! Server-wide pause/resume switch consulted before each command executes.

use tokio::sync::watch;
use tracing::info;

pub struct FlowGate {
    paused: watch::Sender<bool>,
}

impl Default for FlowGate {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    pub fn pause(&self) {
        let was_paused = self.paused.send_replace(true);
        info!(was_paused, "stopping all clients");
    }

    /// Releases every connection blocked in [`Self::await_resume`].
    pub fn resume(&self) {
        let was_paused = self.paused.send_replace(false);
        info!(was_paused, "releasing all clients");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Returns immediately when running, otherwise waits for the next resume.
    ///
    /// A pause that lands after this returns does not affect the caller; it
    /// only catches the next call.
    pub async fn await_resume(&self) {
        let mut paused = self.paused.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = paused.wait_for(|paused| !*paused).await;
    }
}
