// ============================================================================
// Transaction State
// ============================================================================
//
// A connection holds at most one active transaction. The connection drives
// the lifecycle (begin, commit, rollback and their retaining variants); this
// module only describes the transaction it holds.
//
// ============================================================================

use crate::core::TransactionOptions;
use crate::driver::TransactionHandle;
use std::time::{Duration, Instant};

/// State of a connection with respect to transactions.
///
/// ```text
/// Closed ──open──> Open(no-tx) ──begin──> Open(in-tx)
///                     ^                       │
///                     └──commit / rollback────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The connection is closed.
    Closed,
    /// The connection is open without an active transaction.
    Idle,
    /// The connection has an active transaction.
    Active,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Closed => write!(f, "CLOSED"),
            TransactionState::Idle => write!(f, "IDLE"),
            TransactionState::Active => write!(f, "ACTIVE"),
        }
    }
}

/// The active transaction of a connection.
#[derive(Debug)]
pub struct Transaction {
    handle: TransactionHandle,
    options: TransactionOptions,
    start_time: Instant,
    retained: u32,
}

impl Transaction {
    pub(crate) fn new(handle: TransactionHandle, options: TransactionOptions) -> Self {
        Self {
            handle,
            options,
            start_time: Instant::now(),
            retained: 0,
        }
    }

    pub fn handle(&self) -> TransactionHandle {
        self.handle
    }

    /// Options the transaction was started with
    pub fn options(&self) -> TransactionOptions {
        self.options
    }

    pub fn is_read_only(&self) -> bool {
        self.options.contains(TransactionOptions::READ)
    }

    /// Time since the transaction was started
    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Number of retaining commits/rollbacks performed so far
    pub fn retained(&self) -> u32 {
        self.retained
    }

    pub(crate) fn mark_retained(&mut self) {
        self.retained += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_accessors() {
        let mut tx = Transaction::new(
            TransactionHandle(7),
            TransactionOptions::READ | TransactionOptions::COMMITTED,
        );
        assert_eq!(tx.handle(), TransactionHandle(7));
        assert!(tx.is_read_only());
        assert_eq!(tx.retained(), 0);

        tx.mark_retained();
        tx.mark_retained();
        assert_eq!(tx.retained(), 2);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::Active.to_string(), "ACTIVE");
        assert_eq!(TransactionState::Closed.to_string(), "CLOSED");
    }
}
