use std::io;
use std::sync::Arc;

use tokio::sync::watch;

use crate::protocol::wire::WireError;

pub mod framed;
pub mod socket;

pub use framed::{Frame, FramedSocket};
pub use socket::{
    ChannelPair, LogProgress, ProgressSink, TransportClient, TransportServer, connect, serve,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Encode(WireError),
    #[error("failed to decode message: {0}")]
    Decode(WireError),
    #[error("socket i/o failed: {0}")]
    Io(String),
    #[error("channel identification failed: {0}")]
    Handshake(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("kernel process failed: {0}")]
    Process(String),
    #[error("channel closed")]
    ChannelClosed,
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Errors that mean the peer went away rather than that something broke.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Single-assignment completion signal.
///
/// The first `set` wins; later calls are no-ops. Every observer of a
/// FramedSocket or a TransportServer/Client awaits the same latch, so
/// termination (clean or not) reaches all of them exactly once.
#[derive(Debug, Clone)]
pub struct CloseLatch {
    tx: Arc<watch::Sender<Option<Result<(), TransportError>>>>,
}

impl Default for CloseLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` if this call performed the transition.
    pub fn set(&self, result: Result<(), TransportError>) -> bool {
        let mut won = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result.clone());
                won = true;
                true
            } else {
                false
            }
        });
        won
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn result(&self) -> Option<Result<(), TransportError>> {
        self.tx.borrow().clone()
    }

    /// Resolves once the latch has transitioned, with the recorded cause.
    pub async fn wait(&self) -> Result<(), TransportError> {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => slot.clone().unwrap_or(Ok(())),
            // The sender lives as long as this latch, so this arm is not
            // reachable from a live handle.
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn latch_first_write_wins() {
        let latch = CloseLatch::new();
        assert!(!latch.is_set());
        assert!(latch.set(Err(TransportError::ChannelClosed)));
        assert!(!latch.set(Ok(())));
        assert!(latch.is_set());
        assert!(matches!(
            latch.result(),
            Some(Err(TransportError::ChannelClosed))
        ));
        assert!(matches!(
            latch.wait().await,
            Err(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn latch_wakes_waiters() {
        let latch = CloseLatch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(latch.set(Ok(())));
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter resolved")
            .expect("waiter join");
        assert!(result.is_ok());
    }
}
