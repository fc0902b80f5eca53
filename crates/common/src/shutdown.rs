use std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

/// Process-wide quit flag. Workers observe it at their next epoch-work
/// boundary; loggers terminate their queues and drain.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    quit: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        if !self.quit.swap(true, Ordering::Release) {
            tracing::info!("Shutdown signaled");
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }
}
