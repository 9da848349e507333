//! The synchronous dispatch core and its async FIFO queue.
//!
//! # Lock ordering
//!
//! The dispatcher holds three independently-acquired locks: `messages`
//! (the FIFO queue), `handlers` (the sorted handler list), and `hooks` (the
//! post-dispatch observer list). Code that must hold more than one acquires
//! them in that order — `messages` before `handlers` before `hooks` — to
//! rule out lock-order inversion. In the common path only one of the three
//! is ever held at a time.

// Layer 1: Standard library imports
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

// Layer 3: Internal module imports
use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::handler::{HandlerSpec, MessagePostHook};
use crate::message::Message;

/// Read-only snapshot of one installed handler, for diagnostics.
#[derive(Debug, Clone)]
pub struct HandlerInfo {
    pub name: String,
    pub priority: i32,
    pub track_name: Option<String>,
    pub has_filter: bool,
}

/// Cumulative dispatcher counters (spec.md §3 "Dispatcher counters").
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dispatched: u64,
    pub peak_queue_depth: usize,
}

struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dispatched: AtomicU64,
    peak_queue_depth: AtomicUsize,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            peak_queue_depth: AtomicUsize::new(0),
        }
    }
}

/// Routes messages to installed handlers in priority order, and holds the
/// secondary async FIFO queue used by callers that want to post-and-forget.
pub struct Dispatcher {
    handlers: RwLock<Vec<Arc<HandlerSpec>>>,
    hooks: RwLock<Vec<Option<Arc<dyn MessagePostHook>>>>,
    hook_holes: AtomicUsize,
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
    /// Bumped on every handler install/uninstall; lets an in-progress
    /// [`Dispatcher::dispatch`] detect that its position in the handler
    /// list may no longer mean what it did when it looked last.
    changes: AtomicU64,
    config: DispatcherConfig,
    counters: Counters,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_config(DispatcherConfig::default())
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            hooks: RwLock::new(Vec::new()),
            hook_holes: AtomicUsize::new(0),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            changes: AtomicU64::new(0),
            config,
            counters: Counters::default(),
        }
    }

    // ---- handler lifecycle -------------------------------------------------

    /// Install a handler, returning a handle usable with [`Dispatcher::uninstall`].
    pub fn install(&self, spec: HandlerSpec) -> Arc<HandlerSpec> {
        let spec = Arc::new(spec);
        let mut handlers = self.handlers.write();
        let pos = handlers
            .iter()
            .position(|h| h.order_key() > spec.order_key())
            .unwrap_or(handlers.len());
        handlers.insert(pos, spec.clone());
        self.changes.fetch_add(1, Ordering::AcqRel);
        debug!(name = spec.name(), priority = spec.priority(), "handler installed");
        spec
    }

    /// Remove a previously installed handler, waiting for any in-flight
    /// call on it to finish. Returns an error if the handler is still in
    /// flight after `config.uninstall_timeout_ms`.
    pub fn uninstall(&self, handle: &Arc<HandlerSpec>) -> Result<(), DispatchError> {
        {
            let mut handlers = self.handlers.write();
            if let Some(pos) = handlers.iter().position(|h| Arc::ptr_eq(h, handle)) {
                handlers.remove(pos);
                self.changes.fetch_add(1, Ordering::AcqRel);
            }
        }
        let deadline = std::time::Instant::now() + Duration::from_millis(self.config.uninstall_timeout_ms);
        while handle.in_flight() > 0 {
            if std::time::Instant::now() >= deadline {
                return Err(DispatchError::UninstallTimedOut {
                    name: handle.name().to_string(),
                    waited_ms: self.config.uninstall_timeout_ms,
                });
            }
            std::thread::yield_now();
        }
        debug!(name = handle.name(), "handler uninstalled");
        Ok(())
    }

    /// Snapshot every installed handler, in dispatch order.
    pub fn handler_snapshot(&self) -> Vec<HandlerInfo> {
        self.handlers
            .read()
            .iter()
            .map(|h| HandlerInfo {
                name: h.name().to_string(),
                priority: h.priority(),
                track_name: h.track_name().map(str::to_string),
                has_filter: h.has_filter(),
            })
            .collect()
    }

    // ---- post-dispatch hooks ------------------------------------------------

    /// Register a hook invoked after every completed dispatch.
    pub fn add_hook(&self, hook: Arc<dyn MessagePostHook>) {
        self.hooks.write().push(Some(hook));
    }

    /// Remove a hook by identity. Hooks are tombstoned in place (set to
    /// `None`) rather than shifted out immediately, so an in-progress
    /// dispatch's walk over the hook list is never invalidated mid-iteration;
    /// the list is compacted the next time it is empty of live entries.
    pub fn remove_hook(&self, hook: &Arc<dyn MessagePostHook>) {
        let mut hooks = self.hooks.write();
        let mut found = false;
        for slot in hooks.iter_mut() {
            if let Some(existing) = slot {
                if Arc::ptr_eq(existing, hook) {
                    *slot = None;
                    found = true;
                    break;
                }
            }
        }
        if found {
            self.hook_holes.fetch_add(1, Ordering::AcqRel);
            self.maybe_compact_hooks(&mut hooks);
        }
    }

    fn maybe_compact_hooks(&self, hooks: &mut Vec<Option<Arc<dyn MessagePostHook>>>) {
        let live = hooks.iter().filter(|h| h.is_some()).count();
        if live == 0 {
            hooks.clear();
            self.hook_holes.store(0, Ordering::Release);
        }
    }

    fn run_hooks(&self, msg: &Message, accepted: bool) {
        let len = self.hooks.read().len();
        let mut i = 0;
        while i < len {
            let hook = {
                let hooks = self.hooks.read();
                if i >= hooks.len() {
                    break;
                }
                hooks[i].clone()
            };
            if let Some(hook) = hook {
                hook.dispatched(msg, accepted);
            }
            i += 1;
        }
    }

    // ---- synchronous dispatch ------------------------------------------------

    /// Route `msg` through installed handlers in priority order.
    ///
    /// Non-broadcast messages stop at the first handler that returns
    /// `true`. Broadcast messages run every matching handler and return
    /// `true` if any of them did.
    ///
    /// The handler list may be mutated concurrently by another thread's
    /// [`Dispatcher::install`]/[`Dispatcher::uninstall`]; this walk detects
    /// that via the change counter and resumes from the handler list's
    /// current state rather than an index that may no longer be meaningful.
    pub fn dispatch(&self, msg: &mut Message) -> bool {
        let start = Utc::now();
        let mut retval = false;
        let mut idx = 0usize;
        let mut last_key: Option<(i32, u64)> = None;

        loop {
            let (handler, snapshot_changes) = {
                let handlers = self.handlers.read();
                if idx >= handlers.len() {
                    break;
                }
                (handlers[idx].clone(), self.changes.load(Ordering::Acquire))
            };

            if handler.accepts(msg) {
                let track = handler.track_name().map(str::to_string);
                let track_only = handler.track_name_only();
                let track_pos = track
                    .as_ref()
                    .map(|name| msg.append_param(name, handler.name()) + handler.name().len());

                let t0 = Utc::now();
                let accepted = handler.call(msg);
                trace!(handler = handler.name(), accepted, "handler ran");

                if let (Some(name), Some(pos)) = (&track, track_pos) {
                    if !track_only {
                        let elapsed = Utc::now() - t0;
                        let suffix = format!(
                            "#{}.{:03}",
                            elapsed.num_seconds(),
                            elapsed.num_milliseconds().rem_euclid(1000)
                        );
                        msg.insert_into_param(name, pos, &suffix);
                    }
                }

                if accepted {
                    retval = true;
                    if !msg.broadcast() {
                        break;
                    }
                }
            }

            last_key = Some(handler.order_key());

            let handlers = self.handlers.read();
            let changes_now = self.changes.load(Ordering::Acquire);
            if changes_now == snapshot_changes {
                idx += 1;
            } else {
                idx = Self::resume_index(&handlers, last_key);
            }
        }

        let now = Utc::now();
        msg.mark_dispatched_at(now);
        msg.dispatched(retval);
        self.run_hooks(msg, retval);
        self.counters.dispatched.fetch_add(1, Ordering::AcqRel);

        let elapsed_ms = (now - start).num_milliseconds().max(0) as u64;
        if elapsed_ms > self.config.warn_time_ms {
            warn!(
                name = msg.name(),
                elapsed_ms, "dispatch exceeded warn threshold"
            );
        }

        retval
    }

    /// Resume position after the handler list changed mid-dispatch: the
    /// first handler whose order key sorts strictly after the last handler
    /// we looked at (covers both "it moved" and "it was removed").
    fn resume_index(handlers: &[Arc<HandlerSpec>], last_key: Option<(i32, u64)>) -> usize {
        match last_key {
            None => 0,
            Some(key) => handlers
                .iter()
                .position(|h| h.order_key() > key)
                .unwrap_or(handlers.len()),
        }
    }

    // ---- async FIFO queue ------------------------------------------------

    /// Push a message onto the FIFO queue for later asynchronous dispatch.
    ///
    /// Fails with [`DispatchError::QueueFull`] if `config.queue_capacity` is
    /// nonzero and the queue is already at that depth; a `queue_capacity` of
    /// `0` never rejects a message.
    pub fn enqueue(&self, mut msg: Message) -> Result<(), DispatchError> {
        msg.mark_enqueued(Utc::now());
        let depth = {
            let mut queue = self.messages.lock();
            if self.config.queue_capacity != 0 && queue.len() >= self.config.queue_capacity {
                return Err(DispatchError::QueueFull {
                    capacity: self.config.queue_capacity,
                });
            }
            queue.push_back(msg);
            queue.len()
        };
        self.counters.enqueued.fetch_add(1, Ordering::AcqRel);
        self.counters.peak_queue_depth.fetch_max(depth, Ordering::AcqRel);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next queued message without dispatching it, if any.
    pub fn dequeue_one(&self) -> Option<Message> {
        let msg = self.messages.lock().pop_front();
        if msg.is_some() {
            self.counters.dequeued.fetch_add(1, Ordering::AcqRel);
        }
        msg
    }

    /// Wait for and pop the next queued message, dispatching it inline.
    /// Returns the message and whether it was accepted.
    pub async fn dequeue(&self) -> (Message, bool) {
        loop {
            if let Some(mut msg) = self.dequeue_one() {
                let accepted = self.dispatch(&mut msg);
                return (msg, accepted);
            }
            self.notify.notified().await;
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.counters.enqueued.load(Ordering::Acquire),
            dequeued: self.counters.dequeued.load(Ordering::Acquire),
            dispatched: self.counters.dispatched.load(Ordering::Acquire),
            peak_queue_depth: self.counters.peak_queue_depth.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code: unwrap/expect are acceptable
mod tests {
    use super::*;
    use crate::handler::Handler;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct Recorder(Arc<StdMutex<Vec<&'static str>>>, &'static str, bool);
    impl Handler for Recorder {
        fn receive(&self, msg: &mut Message) -> bool {
            self.0.lock().unwrap_or_else(|e| e.into_inner()).push(self.1);
            let _ = msg;
            self.2
        }
    }

    #[test]
    fn stops_at_first_accepting_handler_for_non_broadcast() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = Dispatcher::new();
        dispatcher.install(HandlerSpec::new(
            "x",
            10,
            Arc::new(Recorder(order.clone(), "first", true)),
        ));
        dispatcher.install(HandlerSpec::new(
            "x",
            20,
            Arc::new(Recorder(order.clone(), "second", true)),
        ));

        let mut msg = Message::new("x", "", false);
        assert!(dispatcher.dispatch(&mut msg));
        assert_eq!(*order.lock().unwrap_or_else(|e| e.into_inner()), vec!["first"]);
    }

    #[test]
    fn broadcast_runs_every_matching_handler() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = Dispatcher::new();
        dispatcher.install(HandlerSpec::new(
            "x",
            10,
            Arc::new(Recorder(order.clone(), "first", true)),
        ));
        dispatcher.install(HandlerSpec::new(
            "x",
            20,
            Arc::new(Recorder(order.clone(), "second", true)),
        ));

        let mut msg = Message::new("x", "", true);
        assert!(dispatcher.dispatch(&mut msg));
        assert_eq!(
            *order.lock().unwrap_or_else(|e| e.into_inner()),
            vec!["first", "second"]
        );
    }

    #[test]
    fn lower_priority_runs_before_higher() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = Dispatcher::new();
        dispatcher.install(HandlerSpec::new(
            "x",
            50,
            Arc::new(Recorder(order.clone(), "later", false)),
        ));
        dispatcher.install(HandlerSpec::new(
            "x",
            10,
            Arc::new(Recorder(order.clone(), "earlier", false)),
        ));

        let mut msg = Message::new("x", "", true);
        dispatcher.dispatch(&mut msg);
        assert_eq!(
            *order.lock().unwrap_or_else(|e| e.into_inner()),
            vec!["earlier", "later"]
        );
    }

    #[test]
    fn uninstall_removes_handler_from_future_dispatch() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.install(HandlerSpec::new(
            "x",
            10,
            Arc::new(Recorder(order.clone(), "gone", true)),
        ));
        dispatcher.uninstall(&handle).expect("not in flight");

        let mut msg = Message::new("x", "", false);
        assert!(!dispatcher.dispatch(&mut msg));
        assert!(order.lock().unwrap_or_else(|e| e.into_inner()).is_empty());
    }

    #[test]
    fn handler_installed_during_dispatch_is_observed_on_rescan() {
        struct Installer {
            dispatcher: *const Dispatcher,
            installed: AtomicBool,
            order: Arc<StdMutex<Vec<&'static str>>>,
        }
        // SAFETY: test-only raw pointer to a `Dispatcher` that outlives the
        // call, used solely to call `install` from inside `receive`.
        unsafe impl Send for Installer {}
        unsafe impl Sync for Installer {}
        impl Handler for Installer {
            fn receive(&self, msg: &mut Message) -> bool {
                if !self.installed.swap(true, Ordering::SeqCst) {
                    let dispatcher = unsafe { &*self.dispatcher };
                    dispatcher.install(HandlerSpec::new(
                        "x",
                        5,
                        Arc::new(Recorder(self.order.clone(), "late-joiner", false)),
                    ));
                }
                self.order.lock().unwrap_or_else(|e| e.into_inner()).push("installer");
                let _ = msg;
                false
            }
        }

        let order = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = Dispatcher::new();
        let dispatcher_ptr: *const Dispatcher = &dispatcher;
        dispatcher.install(HandlerSpec::new(
            "x",
            10,
            Arc::new(Installer {
                dispatcher: dispatcher_ptr,
                installed: AtomicBool::new(false),
                order: order.clone(),
            }),
        ));

        let mut msg = Message::new("x", "", true);
        dispatcher.dispatch(&mut msg);
        // The late joiner has priority 5, lower than the installer's 10, but
        // it was inserted after the installer already ran at index 0; the
        // rescan picks it up because its order key sorts after what we just
        // processed only once, then the next pass would see it ahead of
        // later handlers. Here there are none, so it simply must have run.
        assert!(order.lock().unwrap_or_else(|e| e.into_inner()).contains(&"late-joiner"));
    }

    #[test]
    fn handler_snapshot_reports_filter_presence() {
        let dispatcher = Dispatcher::new();
        dispatcher.install(HandlerSpec::new(
            "x",
            10,
            Arc::new(Recorder(Arc::new(StdMutex::new(Vec::new())), "plain", false)),
        ));
        dispatcher.install(
            HandlerSpec::new(
                "x",
                20,
                Arc::new(Recorder(Arc::new(StdMutex::new(Vec::new())), "filtered", false)),
            )
            .with_filter(crate::filter::MessageFilter::exact("module", "sip")),
        );

        let snapshot = dispatcher.handler_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot[0].has_filter);
        assert!(snapshot[1].has_filter);
    }

    #[test]
    fn enqueue_dequeue_tracks_stats() {
        let dispatcher = Dispatcher::new();
        dispatcher.enqueue(Message::new("x", "", false)).expect("capacity is unbounded by default");
        dispatcher.enqueue(Message::new("y", "", false)).expect("capacity is unbounded by default");
        assert_eq!(dispatcher.queue_depth(), 2);
        let popped = dispatcher.dequeue_one();
        assert!(popped.is_some());
        let stats = dispatcher.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dequeued, 1);
        assert_eq!(stats.peak_queue_depth, 2);
    }

    #[test]
    fn enqueue_rejects_once_queue_capacity_is_reached() {
        let dispatcher = Dispatcher::with_config(
            DispatcherConfig::builder()
                .queue_capacity(2)
                .build()
                .expect("valid config"),
        );
        dispatcher.enqueue(Message::new("x", "", false)).expect("first message fits");
        dispatcher.enqueue(Message::new("x", "", false)).expect("second message fits");
        let err = dispatcher.enqueue(Message::new("x", "", false)).unwrap_err();
        assert!(matches!(err, DispatchError::QueueFull { capacity: 2 }));
        assert_eq!(dispatcher.queue_depth(), 2);
    }

    #[tokio::test]
    async fn async_dequeue_dispatches_inline() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let dispatcher = Dispatcher::new();
        dispatcher.install(HandlerSpec::new(
            "x",
            10,
            Arc::new(Recorder(order.clone(), "ran", true)),
        ));
        dispatcher.enqueue(Message::new("x", "", false)).expect("capacity is unbounded by default");
        let (_, accepted) = dispatcher.dequeue().await;
        assert!(accepted);
        assert_eq!(*order.lock().unwrap_or_else(|e| e.into_inner()), vec!["ran"]);
    }
}
