//! A thin abstraction over the async runtime (§5: cooperative I/O on a work-stealing pool).
//!
//! This crate only ever targets tokio, but keeping the runtime behind a narrow module — rather
//! than calling `tokio::spawn`/`tokio::time::sleep` from every component — is what let the real
//! driver support two runtimes for years without duplicating the SDAM/CMAP/executor logic; we
//! keep the same seam even with one backend.

mod interval;
mod stream;

pub(crate) use interval::Interval;
pub(crate) use stream::AsyncStream;

use std::{future::Future, time::Duration};

use crate::error::{Error, Result};

/// A handle to the runtime. Zero-sized; exists purely so call sites read `RUNTIME.spawn(..)`
/// instead of `tokio::spawn(..)`, matching the shape of the two-runtime era of the driver this
/// is descended from.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct AsyncRuntime;

pub(crate) static RUNTIME: AsyncRuntime = AsyncRuntime;

impl AsyncRuntime {
    /// Spawn a task in the background. Used for the monitor loop (§4.D) and the pool's
    /// background maintenance task (§4.C).
    pub(crate) fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(fut)
    }

    /// Runs `fut`, failing with [`crate::error::ErrorKind::OperationTimeout`] if it does not
    /// complete within `timeout`. Every suspension point named in §5 goes through this.
    pub(crate) async fn timeout<F, T>(&self, timeout: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::from(crate::error::ErrorKind::OperationTimeout)),
        }
    }

    pub(crate) async fn delay_for(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Runs `fut` in the background and discards its result. Used by `ClientSession`'s `Drop`
    /// impl to check a server session back in (or abort an in-progress transaction) without
    /// blocking the thread the session was dropped on.
    pub(crate) fn execute<F>(&self, fut: F)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(fut);
    }
}
