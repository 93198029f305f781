//! The pool's FIFO waiter queue (§4.C: "a waiter is woken in strict FIFO order").

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    RUNTIME,
};

/// A counting semaphore limits concurrent holders to `max_size`; tokio's semaphore wakes
/// waiters in the order they called `acquire`, which is exactly the FIFO guarantee §4.C asks
/// for. We don't use the permit for anything but queue position — the actual connection is
/// handed over separately once a caller is at the front.
#[derive(Debug)]
pub(crate) struct WaitQueue {
    semaphore: Arc<Semaphore>,
    address: ServerAddress,
}

impl WaitQueue {
    pub(super) fn new(address: ServerAddress, max_size: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_size.max(1) as usize)),
            address,
        }
    }

    /// Blocks until this caller reaches the front of the queue or `timeout` elapses.
    pub(super) async fn wait_for_turn(&self, timeout: Option<std::time::Duration>) -> Result<tokio::sync::OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let result = match timeout {
            Some(timeout) => RUNTIME.timeout(timeout, async { Ok(acquire.await) }).await,
            None => Ok(acquire.await),
        };
        result?.map_err(|_| {
            Error::from(ErrorKind::WaitQueueTimeout {
                address: self.address.clone(),
            })
        })
    }
}
