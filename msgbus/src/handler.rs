//! Handler registration: [`Handler`], [`HandlerSpec`], and the post-dispatch
//! observer hooks.

// Layer 1: Standard library imports
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::filter::MessageFilter;
use crate::message::Message;

/// A handler reachable from the dispatcher's priority list.
///
/// `receive` returns `true` to mean "this message is handled; stop walking
/// the list" (unless the message is a broadcast, in which case every
/// matching handler still runs). Implementations must not block for long:
/// the dispatcher holds no lock while a handler runs, but a slow handler
/// still delays every other caller waiting on the same message.
pub trait Handler: Send + Sync {
    /// Process `msg`, optionally mutating its return value and parameters.
    fn receive(&self, msg: &mut Message) -> bool;
}

/// Indirection used by relayed handlers: a [`MessageReceiver`] forwards a
/// message to some other sink (a remote module, a channel) instead of
/// handling it inline. Grounded in the original's `MessageRelay`, which lets
/// a handler be "installed" on behalf of another object without that object
/// implementing `MessageHandler` itself.
pub trait MessageReceiver: Send + Sync {
    /// Deliver `msg` and report whether it was handled.
    fn received(&self, msg: &mut Message) -> bool;
}

/// Callback invoked once a message has finished its dispatch pass, after
/// every handler has run (or the first one accepted it, if not broadcast).
pub trait MessagePostHook: Send + Sync {
    /// `accepted` is the dispatcher's final return value for `msg`.
    fn dispatched(&self, msg: &Message, accepted: bool);
}

/// Callback a [`Message`] invokes itself from `dispatched()`, independent of
/// hooks registered on the dispatcher. See spec.md's `userData`
/// "MessageNotifier" note.
pub trait MessageNotifier: Send + Sync {
    fn dispatched(&self, msg: &Message, accepted: bool);
}

/// A registered handler: name, priority, optional filter, and the tracking
/// controls used to annotate a message with which handlers touched it.
///
/// Total order among installed handlers is `(priority, seq)`: lower priority
/// numbers run first, and `seq` — a monotonically increasing installation
/// counter — breaks ties deterministically. The original engine breaks ties
/// by comparing the `MessageHandler*` pointer address; a creation-order
/// counter gives the same "stable, total order across list mutation"
/// property without leaning on address identity.
pub struct HandlerSpec {
    name: String,
    priority: i32,
    seq: u64,
    filter: Option<MessageFilter>,
    track_name: Option<String>,
    track_name_only: bool,
    unsafe_count: AtomicI64,
    handler: Arc<dyn Handler>,
}

impl fmt::Debug for HandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .field("track_name", &self.track_name)
            .finish()
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

impl HandlerSpec {
    /// Register a new handler for messages named `name` (empty matches any
    /// message name) at `priority` (lower runs first).
    pub fn new(name: impl Into<String>, priority: i32, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            priority,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            filter: None,
            track_name: None,
            track_name_only: false,
            unsafe_count: AtomicI64::new(0),
            handler,
        }
    }

    /// Attach a parameter filter: only messages whose named parameter
    /// satisfies the filter reach this handler.
    #[must_use]
    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Record this handler's name into the message's `track_name` parameter
    /// when it runs. `only` suppresses the per-handler timing suffix,
    /// matching the original's `trackParam`/`trackName` pair where a
    /// "-" prefix on the track name means "name only, no duration".
    #[must_use]
    pub fn with_tracking(mut self, track_name: impl Into<String>, only: bool) -> Self {
        self.track_name = Some(track_name.into());
        self.track_name_only = only;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub fn track_name(&self) -> Option<&str> {
        self.track_name.as_deref()
    }

    pub fn track_name_only(&self) -> bool {
        self.track_name_only
    }

    /// Whether `msg` is eligible for this handler: name match, then filter.
    pub fn accepts(&self, msg: &Message) -> bool {
        if !msg.name_matches(&self.name) {
            return false;
        }
        match &self.filter {
            Some(filter) => filter.matches(msg),
            None => true,
        }
    }

    /// Invoke the underlying handler. Tracks an in-flight counter so
    /// [`Dispatcher::uninstall`] can wait for concurrent calls to drain
    /// before returning.
    ///
    /// [`Dispatcher::uninstall`]: crate::dispatcher::Dispatcher::uninstall
    pub(crate) fn call(&self, msg: &mut Message) -> bool {
        self.unsafe_count.fetch_add(1, Ordering::AcqRel);
        let result = self.handler.receive(msg);
        self.unsafe_count.fetch_sub(1, Ordering::AcqRel);
        result
    }

    pub(crate) fn in_flight(&self) -> i64 {
        self.unsafe_count.load(Ordering::Acquire)
    }

    /// Total order key used by the dispatcher's sorted handler list.
    pub(crate) fn order_key(&self) -> (i32, u64) {
        (self.priority, self.seq)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code: unwrap/expect are acceptable
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Flag(Arc<AtomicBool>);
    impl Handler for Flag {
        fn receive(&self, _msg: &mut Message) -> bool {
            self.0.store(true, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn accepts_respects_name_and_filter() {
        let flag = Arc::new(AtomicBool::new(false));
        let spec = HandlerSpec::new("call.route", 50, Arc::new(Flag(flag)))
            .with_filter(MessageFilter::exact("module", "sip"));

        let mut msg = Message::new("call.route", "", false);
        assert!(!spec.accepts(&msg));
        msg.add_param("module", "sip");
        assert!(spec.accepts(&msg));

        let other = Message::new("call.execute", "", false);
        assert!(!spec.accepts(&other));
    }

    #[test]
    fn seq_increases_monotonically_across_instances() {
        let flag = Arc::new(AtomicBool::new(false));
        let a = HandlerSpec::new("x", 0, Arc::new(Flag(flag.clone())));
        let b = HandlerSpec::new("x", 0, Arc::new(Flag(flag)));
        assert!(b.seq() > a.seq());
    }

    #[test]
    fn call_tracks_in_flight_count() {
        let flag = Arc::new(AtomicBool::new(false));
        let spec = HandlerSpec::new("x", 0, Arc::new(Flag(flag)));
        let mut msg = Message::new("x", "", false);
        assert_eq!(spec.in_flight(), 0);
        spec.call(&mut msg);
        assert_eq!(spec.in_flight(), 0);
    }
}
