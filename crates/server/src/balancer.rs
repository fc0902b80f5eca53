//! Spreads incoming transaction frames over per-worker queues; each worker
//! drains only its own queue.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rand::Rng;

pub struct TransactionBalancer {
    queues: Vec<Mutex<VecDeque<String>>>,
}

impl TransactionBalancer {
    pub fn new(worker_num: usize) -> Self {
        assert!(worker_num > 0);
        Self {
            queues: (0..worker_num).map(|_| Mutex::new(VecDeque::new())).collect(),
        }
    }

    /// Enqueue a raw request frame on a randomly chosen worker queue.
    pub fn put_transaction(&self, json_transaction: String) {
        let worker_id = rand::rng().random_range(0..self.queues.len());
        self.queues[worker_id].lock().push_back(json_transaction);
    }

    /// Dequeue the next request for `worker_id`, if any.
    pub fn get_transaction(&self, worker_id: usize) -> Option<String> {
        self.queues[worker_id].lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|queue| queue.lock().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::TransactionBalancer;

    #[test]
    fn test_round_trips_preserve_per_queue_order() {
        let balancer = TransactionBalancer::new(1);
        balancer.put_transaction("first".to_owned());
        balancer.put_transaction("second".to_owned());
        assert_eq!(balancer.get_transaction(0).as_deref(), Some("first"));
        assert_eq!(balancer.get_transaction(0).as_deref(), Some("second"));
        assert_eq!(balancer.get_transaction(0), None);
        assert!(balancer.is_empty());
    }

    #[test]
    fn test_every_frame_lands_on_some_queue() {
        let balancer = TransactionBalancer::new(4);
        for i in 0..100 {
            balancer.put_transaction(format!("tx{i}"));
        }
        let mut drained = 0;
        for worker_id in 0..4 {
            while balancer.get_transaction(worker_id).is_some() {
                drained += 1;
            }
        }
        assert_eq!(drained, 100);
    }
}
