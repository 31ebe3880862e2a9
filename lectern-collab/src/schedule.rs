//! Cancellable one-shot timers.
//!
//! A [`ScheduledTask`] owns the spawned timer; dropping it aborts the task,
//! so timers never outlive the component that scheduled them.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `f` once after `delay`.
    ///
    /// Returns `None` when called outside a Tokio runtime.
    pub fn after<F>(delay: Duration, f: F) -> Option<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        })
    }

    pub fn spawn<Fut>(fut: Fut) -> Option<Self>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(rt) => Some(Self {
                handle: rt.spawn(fut),
            }),
            Err(_) => {
                log::warn!("No async runtime available; task not scheduled");
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
