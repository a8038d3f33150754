//! Shutdown signal shared by the bridge loops

use tokio::sync::broadcast;

/// Listens for the bridge-wide shutdown broadcast.
///
/// Every loop holds one of these and checks it between items, so an
/// in-flight handler always runs to completion.
#[derive(Debug)]
pub struct Shutdown {
    triggered: bool,
    rx: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(rx: broadcast::Receiver<()>) -> Self {
        Self {
            triggered: false,
            rx,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Wait until shutdown is signalled or the sender is dropped
    pub async fn recv(&mut self) {
        if self.triggered {
            return;
        }
        loop {
            match self.rx.recv().await {
                Ok(()) => break,
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
        self.triggered = true;
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            triggered: self.triggered,
            rx: self.rx.resubscribe(),
        }
    }
}
