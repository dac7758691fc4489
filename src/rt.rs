//! Runtime components.
//!
//! The engine spawns two long-lived tasks per connection (sender, receiver) plus one
//! short-lived task per donation cycle to drive the underlying HTTP/1 connection. Rather than
//! hard-wiring `tokio::spawn`, it abstracts over "place this future on an executor" through the
//! [`Executor`] trait, so an embedder could in principle swap in a different runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub(crate) type BoxSendFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An executor of futures.
///
/// This trait allows the engine to abstract over async runtimes. The crate ships
/// [`TokioExecutor`] as the default implementation used by [`crate::Context`].
pub trait Executor<Fut> {
    /// Place the future into the executor to be run to completion.
    fn execute(&self, fut: Fut);
}

/// The default [`Executor`], backed by `tokio::spawn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioExecutor;

impl<F> Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut);
    }
}

#[derive(Clone)]
pub(crate) struct Exec {
    inner: Arc<dyn Executor<BoxSendFuture> + Send + Sync>,
}

impl Exec {
    pub(crate) fn new<E>(executor: E) -> Exec
    where
        E: Executor<BoxSendFuture> + Send + Sync + 'static,
    {
        Exec {
            inner: Arc::new(executor),
        }
    }

    pub(crate) fn execute<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.execute(Box::pin(fut));
    }
}

impl std::fmt::Debug for Exec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exec").finish()
    }
}

impl Default for Exec {
    fn default() -> Exec {
        Exec::new(TokioExecutor)
    }
}
