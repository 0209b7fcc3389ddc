//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::task::Task;

/// A debounced fire-and-coalesce trigger.
///
/// [`Trigger::trigger_with_reason`] returns immediately; the reason is
/// appended to a pending list. The runner invokes the callback with the
/// accumulated reasons, enforcing a minimum interval between the start of
/// consecutive invocations. Calls arriving while the callback runs or during
/// the cool-down coalesce into at most one pending invocation.
#[derive(Clone, Debug)]
pub struct Trigger {
    reasons_tx: mpsc::UnboundedSender<String>,
}

/// The consuming half of a [`Trigger`], turned into a background task by
/// [`TriggerRunner::run`].
#[derive(Debug)]
pub struct TriggerRunner {
    min_interval: Duration,
    reasons_rx: mpsc::UnboundedReceiver<String>,
}

// ===== impl Trigger =====

impl Trigger {
    pub fn new(min_interval: Duration) -> (Trigger, TriggerRunner) {
        let (reasons_tx, reasons_rx) = mpsc::unbounded_channel();
        (
            Trigger { reasons_tx },
            TriggerRunner {
                min_interval,
                reasons_rx,
            },
        )
    }

    /// Requests an invocation of the runner callback.
    pub fn trigger_with_reason(&self, reason: impl Into<String>) {
        // An error means the runner is gone; nothing left to notify.
        let _ = self.reasons_tx.send(reason.into());
    }
}

// ===== impl TriggerRunner =====

impl TriggerRunner {
    /// Spawns the runner task. At most one callback invocation is in flight
    /// at any time. The task exits when all trigger handles are dropped.
    pub fn run<F, Fut>(mut self, mut cb: F) -> Task<()>
    where
        F: FnMut(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Task::spawn(async move {
            let mut last_start: Option<Instant> = None;
            while let Some(first) = self.reasons_rx.recv().await {
                // Wait out the cool-down since the start of the last run.
                if let Some(last_start) = last_start {
                    tokio::time::sleep_until(last_start + self.min_interval)
                        .await;
                }

                // Drain reasons accumulated in the meantime, keeping the
                // first occurrence of each.
                let mut reasons = vec![first];
                while let Ok(reason) = self.reasons_rx.try_recv() {
                    if !reasons.contains(&reason) {
                        reasons.push(reason);
                    }
                }

                last_start = Some(Instant::now());
                (cb)(reasons.join(", ")).await;
            }
        })
    }
}
