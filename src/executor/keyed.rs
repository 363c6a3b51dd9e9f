use parking_lot::Mutex;
use std::collections::hash_map::{Entry, HashMap};
use std::collections::VecDeque;
use std::hash::Hash;

/// Per-key queues. A key with a lane has a job scheduled or running; everything else
/// submitted for that key waits in the lane until that job finishes.
pub(super) struct Lanes<K, J> {
    lanes: Mutex<HashMap<K, VecDeque<J>>>,
}
impl<K: Hash + Eq, J> Lanes<K, J> {
    pub(super) fn new() -> Self {
        Self { lanes: Mutex::new(HashMap::new()) }
    }
    /// Queues `job` behind whatever `key` already has going. Returns it back when the key
    /// was idle, in which case the caller schedules it.
    pub(super) fn enqueue(&self, key: K, job: J) -> Option<J> {
        match self.lanes.lock().entry(key) {
            Entry::Occupied(mut lane) => {
                lane.get_mut().push_back(job);
                None
            }
            Entry::Vacant(lane) => {
                lane.insert(VecDeque::new());
                Some(job)
            }
        }
    }
    /// Called when the scheduled job for `key` is done. Returns the next one to schedule,
    /// or retires the lane.
    pub(super) fn finish(&self, key: &K) -> Option<J> {
        let mut lanes = self.lanes.lock();
        let next = lanes.get_mut(key)?.pop_front();
        if next.is_none() {
            lanes.remove(key);
        }
        next
    }
    /// Keys with work scheduled.
    pub(super) fn active(&self) -> usize {
        self.lanes.lock().len()
    }
}
