//! Completion handles
//!
//! Every operation completes exactly once. `Pending` is the future-style
//! handle returned to callers; the callback forms of the API deliver the
//! same result to a closure instead.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{Error, Result};

/// Callback receiving the result of one operation
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Handle to the eventual result of an operation
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

impl<T: Send + 'static> Pending<T> {
    /// A handle plus the callback that completes it
    pub fn channel() -> (Pending<T>, Callback<T>) {
        let (tx, rx) = channel::bounded(1);
        let callback: Callback<T> = Box::new(move |result| {
            // The receiver may have been dropped; the result is then unwanted
            let _ = tx.send(result);
        });
        (Pending { rx }, callback)
    }

    /// An already completed handle
    pub fn ready(result: Result<T>) -> Pending<T> {
        let (pending, callback) = Self::channel();
        callback(result);
        pending
    }

    /// Block until the operation completes
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or_else(|_| Err(dropped()))
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "no result within {:?}",
                timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(dropped()),
        }
    }

    /// The result, if the operation has already completed
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(dropped())),
        }
    }
}

fn dropped() -> Error {
    Error::Connectivity("operation was dropped without completing".to_string())
}
