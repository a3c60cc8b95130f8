use std::future::Future;
use tokio::task::JoinHandle;

/// Wraps a spawned task and aborts it when the wrapper is dropped.
///
/// Background loops (lease keep-alive, queue consumer, checker) are owned
/// through this so that their lifetime never exceeds their owner's.
#[derive(Debug)]
pub struct GuardHandle {
    handle: JoinHandle<()>,
}

impl GuardHandle {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        Self { handle }
    }
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
