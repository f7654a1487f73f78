use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::mock::MockStore;

/// Background helper owned by the proxy and stopped during teardown.
pub trait AuxiliaryService: Send {
    fn name(&self) -> &str;
    fn stop(&mut self) -> io::Result<()>;
}

/// A spawned task treated as a service; stopping aborts it.
pub struct TaskService {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl TaskService {
    pub fn spawn<F>(name: impl Into<String>, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            handle: Some(tokio::spawn(task)),
        }
    }
}

impl AuxiliaryService for TaskService {
    fn name(&self) -> &str {
        &self.name
    }

    fn stop(&mut self) -> io::Result<()> {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                Ok(())
            }
            None => Err(io::Error::other(format!("{} already stopped", self.name))),
        }
    }
}

impl Drop for TaskService {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Periodically log how many mocks are left in each pool.
pub fn usage_reporter(store: Arc<MockStore>, every: Duration) -> TaskService {
    TaskService::spawn("usage-reporter", async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                filtered = store.filtered_len(),
                unfiltered = store.unfiltered_len(),
                consumed = store.consumed_count(),
                "Mock usage"
            );
        }
    })
}
