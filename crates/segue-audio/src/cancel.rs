//! Cooperative cancellation with explicit acknowledgement.
//!
//! The canceller flips the token; the cancelled loop notices at its next
//! checkpoint, releases what it holds and acknowledges. Whoever needs the loop
//! to be quiescent (destroying a source, say) waits for the acknowledgement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

#[derive(Debug)]
struct TokenState {
    cancelled: AtomicBool,
    acknowledged: AtomicBool,
    ack_tx: Sender<()>,
    ack_rx: Receiver<()>,
}

/// Shared cancellation flag of one fill loop.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (ack_tx, ack_rx) = bounded(1);
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                acknowledged: AtomicBool::new(false),
                ack_tx,
                ack_rx,
            }),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Signal that the cancelled loop has stopped. Only the first call counts.
    pub fn acknowledge(&self) {
        if !self.state.acknowledged.swap(true, Ordering::AcqRel) {
            let _ = self.state.ack_tx.try_send(());
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.state.acknowledged.load(Ordering::Acquire)
    }

    /// Block until the loop acknowledged, up to `timeout`.
    pub fn wait_acknowledged(&self, timeout: Duration) -> bool {
        if self.is_acknowledged() && self.state.ack_rx.is_empty() {
            return true;
        }
        self.state.ack_rx.recv_timeout(timeout).is_ok() || self.is_acknowledged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_seen_by_clones() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.clone().cancel();
        assert!(token.is_cancelled());
        assert!(!token.is_acknowledged());
    }

    #[test]
    fn test_acknowledgement_across_threads() {
        let token = CancellationToken::new();
        let worker = token.clone();
        let handle = std::thread::spawn(move || {
            while !worker.is_cancelled() {
                std::thread::yield_now();
            }
            worker.acknowledge();
        });
        token.cancel();
        assert!(token.wait_acknowledged(Duration::from_secs(5)));
        let _ = handle.join();
    }

    #[test]
    fn test_wait_times_out_without_ack() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!token.wait_acknowledged(Duration::from_millis(10)));
    }
}
