//! The future-ish handle returned by [`crate::pool::WorkStealingPool::submit`].

use crate::error::CoreError;
use crossbeam_channel::Receiver;

/// Resolves to the submitted closure's return value, or to whatever error
/// the closure propagated (including a captured panic).
pub struct JoinHandle<T> {
    pub(crate) receiver: Receiver<Result<T, CoreError>>,
}

impl<T> JoinHandle<T> {
    /// Blocks until the closure resolves.
    pub fn join(self) -> Result<T, CoreError> {
        self.receiver
            .recv()
            .unwrap_or(Err(CoreError::PoolShuttingDown))
    }

    /// Returns immediately with the outcome if it's already available.
    pub fn try_join(&self) -> Option<Result<T, CoreError>> {
        self.receiver.try_recv().ok()
    }
}
