/// Runs work on a later turn of the event loop.
pub trait Scheduler {
    fn defer(&self, task: Box<dyn FnOnce()>);
}

/// Defers onto the next turn of the tokio `LocalSet` driving the shell.
///
/// Must be used from inside a `LocalSet`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NextTick;

impl Scheduler for NextTick {
    fn defer(&self, task: Box<dyn FnOnce()>) {
        tokio::task::spawn_local(async move {
            tokio::task::yield_now().await;
            task();
        });
    }
}

#[cfg(test)]
pub use manual::ManualTick;
