//! A secondary, per-subject worker pool sitting in front of a [`Dispatcher`].
//!
//! The synchronous [`Dispatcher::dispatch`] and its single FIFO queue are
//! enough for most messages, but some subjects (for example a busy
//! `call.cdr` stream) benefit from their own bounded concurrency so a slow
//! handler on one subject cannot starve another. `MessageQueue` gives each
//! registered subject its own `tokio` channel and a fixed pool of worker
//! tasks that drain it by calling back into the shared dispatcher.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

// Layer 3: Internal module imports
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::filter::MessageFilter;
use crate::message::Message;

struct Lane {
    sender: mpsc::Sender<Message>,
    workers: Vec<JoinHandle<()>>,
    filters: Vec<MessageFilter>,
}

impl Lane {
    /// spec.md §4.3: "a message matches if its name equals the queue's
    /// subject AND every filter parameter is present in the message with
    /// equal value" — the subject-name half is checked by the caller via the
    /// lane lookup key, this checks the remaining NamedList filter.
    fn accepts(&self, msg: &Message) -> bool {
        self.filters.iter().all(|filter| filter.matches(msg))
    }
}

/// Per-subject worker pools that dispatch through a shared [`Dispatcher`].
pub struct MessageQueue {
    dispatcher: Arc<Dispatcher>,
    lanes: Mutex<HashMap<String, Lane>>,
}

impl MessageQueue {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subject with `workers` concurrent tasks and a channel of
    /// depth `capacity`. `filters` are the NamedList-style per-parameter
    /// constraints spec.md §4.3 requires in addition to the subject-name
    /// match: a submitted message must satisfy every one of them. Re-
    /// registering the same subject replaces its lane, dropping the old
    /// channel (in-flight sends to it will fail).
    pub fn register_lane(&self, subject: impl Into<String>, workers: usize, capacity: usize, filters: Vec<MessageFilter>) {
        let subject = subject.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_id in 0..workers.max(1) {
            let dispatcher = self.dispatcher.clone();
            let rx = rx.clone();
            let subject_name = subject.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    match next {
                        Some(mut msg) => {
                            dispatcher.dispatch(&mut msg);
                        }
                        None => {
                            debug!(subject = subject_name.as_str(), worker_id, "lane drained, worker exiting");
                            break;
                        }
                    }
                }
            }));
        }

        self.lanes.lock().insert(
            subject,
            Lane {
                sender: tx,
                workers: handles,
                filters,
            },
        );
    }

    /// Submit a message to the named subject's lane. Per spec.md §4.3, the
    /// message must also satisfy every one of the lane's registered
    /// filters; a message that fails the filter is rejected rather than
    /// queued, the same as one submitted to an unregistered subject.
    pub async fn submit(&self, subject: &str, msg: Message) -> Result<(), DispatchError> {
        let sender = {
            let lanes = self.lanes.lock();
            let lane = lanes.get(subject).ok_or(DispatchError::QueueClosed)?;
            if !lane.accepts(&msg) {
                return Err(DispatchError::QueueClosed);
            }
            lane.sender.clone()
        };
        sender.send(msg).await.map_err(|_| DispatchError::QueueClosed)
    }

    /// Drop a subject's lane, closing its channel and letting its workers
    /// exit once they finish any message already in hand.
    pub fn remove_lane(&self, subject: &str) {
        if let Some(lane) = self.lanes.lock().remove(subject) {
            for handle in lane.workers {
                handle.abort();
            }
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }
}
