
use std::sync::Arc;

use common::{
    epoch::EpochState,
    shutdown::ShutdownSignal,
};
use durability::LogQueue;
use indexing::Masstree;

use crate::TxExecutor;

pub(crate) struct TestDb {
    pub tree: Arc<Masstree>,
    pub epochs: Arc<EpochState>,
    pub queue: Arc<LogQueue>,
    pub quit: ShutdownSignal,
}

impl TestDb {
    /// An engine with `worker_num` executors sharing one tree and one
    /// logger queue; no logger thread runs, buffers just accumulate.
    pub fn new(worker_num: usize) -> (Self, Vec<TxExecutor>) {
        let tree = Arc::new(Masstree::new());
        let epochs = Arc::new(EpochState::new(worker_num, 1));
        let queue = Arc::new(LogQueue::new());
        let quit = ShutdownSignal::new();
        let executors = (0..worker_num)
            .map(|worker_id| {
                TxExecutor::new(
                    worker_id,
                    Arc::clone(&tree),
                    Arc::clone(&epochs),
                    Arc::clone(&queue),
                    quit.clone(),
                )
            })
            .collect();
        (
            Self {
                tree,
                epochs,
                queue,
                quit,
            },
            executors,
        )
    }
}
