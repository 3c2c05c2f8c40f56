//! Background expiration engine.
//!
//! A dedicated thread wakes every `every`, reads the wall clock and runs one
//! [`FlowTable::sweep`]-equivalent pass.  The thread stops when its
//! [`ExpirationHandle`] is stopped or dropped; a stop request is noticed
//! between ticks, never in the middle of a sweep.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, info, warn};

use crate::error::FlowTableError;
use crate::listener::EvictionListener;
use crate::table::FlowTable;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Flows with `last` strictly below this were evicted.
    pub threshold: i64,
    /// Table size when the sweep started.
    pub before: usize,
    /// Flows evicted (and notified) by this sweep.
    pub expired: usize,
    /// Table size when the sweep finished.
    pub after: usize,
}

/// Owns the sweeper thread.  Dropping the handle stops it.
pub struct ExpirationHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    every: Duration,
}

impl ExpirationHandle {
    pub(crate) fn spawn(
        table: FlowTable,
        every: Duration,
        listener: Option<Arc<dyn EvictionListener>>,
    ) -> Result<Self, FlowTableError> {
        if every.is_zero() {
            return Err(FlowTableError::InvalidConfig(
                "expiration period must be greater than 0".into(),
            ));
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("flowtable-expire".into())
            .spawn(move || {
                info!(?every, "flow expiration started");
                let ticker = tick(every);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let now = Utc::now().timestamp();
                            let report = table.sweep_with(now, every, listener.as_deref());
                            if report.expired > 0 {
                                debug!(
                                    now,
                                    expired = report.expired,
                                    size = report.after,
                                    "flow expiration tick"
                                );
                            }
                        }
                        // A message or a dropped sender both mean stop.
                        recv(stop_rx) -> _ => break,
                    }
                }
                info!("flow expiration stopped");
            })?;

        Ok(ExpirationHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
            every,
        })
    }

    pub fn every(&self) -> Duration {
        self.every
    }

    /// `true` until the sweeper thread has exited.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signals the sweeper and waits for it to exit.  A sweep in progress
    /// completes first.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("flow expiration thread panicked");
            }
        }
    }
}

impl Drop for ExpirationHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_period_is_rejected() {
        let table = FlowTable::new();
        let err = ExpirationHandle::spawn(table, Duration::ZERO, None).err();
        assert!(matches!(err, Some(FlowTableError::InvalidConfig(_))));
    }

    #[test]
    fn stop_joins_the_thread() {
        let table = FlowTable::new();
        let handle = table
            .start_expiration_with(Duration::from_millis(10), |_| {})
            .unwrap();
        assert!(handle.is_running());
        handle.stop();
    }
}
