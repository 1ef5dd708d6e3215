//! Query deadlines.
//!
//! One `Deadline` bounds everything a query does after its parameters are
//! checked: chunk verification and decoding, loading the snapshot table and
//! running the statement. Rust-side work polls `check`; SQLite work runs under a
//! `Watchdog` that interrupts the connection when the remaining budget runs out.

use crate::core::error::NexusError;
use rusqlite::{ErrorCode, InterruptHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Deadline {
    query: String,
    budget: Duration,
    started: Instant,
}

impl Deadline {
    /// Start the clock for `query` with `budget` to spend.
    pub fn start(query: &str, budget: Duration) -> Self {
        Self {
            query: query.to_string(),
            budget,
            started: Instant::now(),
        }
    }

    /// A deadline that never expires, for callers outside a query.
    pub fn unbounded(query: &str) -> Self {
        Self::start(query, Duration::MAX)
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn check(&self) -> Result<(), NexusError> {
        if self.expired() {
            return Err(self.timeout_error());
        }
        Ok(())
    }

    pub fn timeout_error(&self) -> NexusError {
        let timeout_ms = u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(
            query = %self.query,
            timeout_ms,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "query deadline exceeded"
        );
        NexusError::QueryTimeout {
            query: self.query.clone(),
            timeout_ms,
        }
    }

    /// Interrupt the connection behind `handle` once the remaining budget is spent.
    pub fn watch(&self, handle: InterruptHandle) -> Watchdog {
        Watchdog::arm(handle, self.remaining())
    }

    /// Map a SQLite failure to a timeout when the watchdog fired or SQLite was
    /// interrupted; anything else is passed through.
    pub fn classify(&self, fired: bool, err: rusqlite::Error) -> Result<rusqlite::Error, NexusError> {
        if fired || err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
            return Err(self.timeout_error());
        }
        Ok(err)
    }
}

/// Interrupts the connection if not disarmed within the timeout.
pub struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    fired: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn arm(handle: InterruptHandle, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let thread = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                flag.store(true, Ordering::SeqCst);
                handle.interrupt();
            }
        });
        Self {
            cancel: Some(tx),
            fired,
            thread: Some(thread),
        }
    }

    /// Stop the watchdog; returns whether it fired.
    pub fn disarm(mut self) -> bool {
        self.stop();
        self.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        drop(self.cancel.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_reports_whether_it_fired() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let quick = Watchdog::arm(conn.get_interrupt_handle(), Duration::from_secs(5));
        assert!(!quick.disarm());

        let slow = Watchdog::arm(conn.get_interrupt_handle(), Duration::from_millis(1));
        thread::sleep(Duration::from_millis(50));
        assert!(slow.disarm());
    }

    #[test]
    fn spent_deadline_fails_checks_with_its_budget() {
        let deadline = Deadline::start("top_values", Duration::from_millis(1));
        thread::sleep(Duration::from_millis(5));
        assert_eq!(deadline.remaining(), Duration::ZERO);
        match deadline.check() {
            Err(NexusError::QueryTimeout { query, timeout_ms }) => {
                assert_eq!(query, "top_values");
                assert_eq!(timeout_ms, 1);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn unbounded_deadline_never_expires() {
        let deadline = Deadline::unbounded("snapshot");
        assert!(deadline.check().is_ok());
        assert!(deadline.remaining() > Duration::from_secs(3600));
    }

    #[test]
    fn interrupted_statements_classify_as_timeouts() {
        let deadline = Deadline::start("raw", Duration::from_secs(5));
        let interrupted = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
            None,
        );
        assert!(matches!(
            deadline.classify(false, interrupted),
            Err(NexusError::QueryTimeout { .. })
        ));
        let other = rusqlite::Error::InvalidQuery;
        assert!(matches!(deadline.classify(false, other), Ok(rusqlite::Error::InvalidQuery)));
    }
}
