//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use crate::task::Task;

/// A rate-limited work queue with per-item exponential backoff.
///
/// Items are deduplicated: adding an item that is already queued is a no-op,
/// and an item re-added while it is being processed is queued again only
/// after [`WorkQueue::done`] is called for it. The queue supports a single
/// consumer calling [`WorkQueue::get`].
#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    base_delay: Duration,
    max_delay: Duration,
    state: Mutex<State<T>>,
    notify: Notify,
}

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shut_down: bool,
}

// ===== impl WorkQueue =====

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(base_delay: Duration, max_delay: Duration) -> WorkQueue<T> {
        WorkQueue {
            inner: Arc::new(Inner {
                base_delay,
                max_delay,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shut_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueues an item for processing.
    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shut_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        // Items under processing are re-queued once `done` is called.
        if !state.processing.contains(&item) {
            state.queue.push_back(item);
            self.inner.notify.notify_one();
        }
    }

    /// Re-enqueues an item after a backoff delay derived from the number of
    /// times it has failed so far.
    pub fn add_rate_limited(&self, item: T) {
        let failures = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(item.clone()).or_insert(0);
            *failures += 1;
            *failures
        };
        let delay = self.backoff_delay(failures);
        trace!(?delay, %failures, "work item re-queued with backoff");

        let queue = self.clone();
        let mut task = Task::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
        task.detach();
    }

    /// Clears the failure history of an item, resetting its backoff.
    pub fn forget(&self, item: &T) {
        let mut state = self.inner.state.lock().unwrap();
        state.failures.remove(item);
    }

    /// Returns how many times an item has been re-queued with backoff since
    /// it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        let state = self.inner.state.lock().unwrap();
        state.failures.get(item).copied().unwrap_or(0)
    }

    /// Retrieves the next item to process, waiting for one to become
    /// available. Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.shut_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Marks the processing of an item as finished. If the item was re-added
    /// while it was being processed, it is queued again.
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock().unwrap();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.inner.notify.notify_one();
        }
    }

    /// Shuts the queue down, waking up the consumer.
    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.shut_down = true;
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        std::cmp::min(
            self.inner.base_delay.saturating_mul(1u32 << exp),
            self.inner.max_delay,
        )
    }
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> WorkQueue<T> {
        WorkQueue {
            inner: self.inner.clone(),
        }
    }
}
