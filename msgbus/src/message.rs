//! Message type: an immutable-by-convention named parameter list.

// Layer 1: Standard library imports
use std::fmt;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};

// Layer 3: Internal module imports
use crate::handler::MessageNotifier;

/// A single named parameter. Duplicates are permitted; insertion order is
/// preserved and observable to handlers (spec data model: "Iteration order
/// is observable to handlers").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: String,
}

/// A uniform, named, parameterized event carried across the bus.
///
/// # Ownership
///
/// Exactly one owner holds a `Message` at any time once it has been
/// enqueued: the dispatcher hands it to [`Dispatcher::dispatch`], which
/// consumes it into [`Message::dispatched`] before returning it to the
/// caller. There is no shared/concurrent mutation of a single `Message`.
///
/// [`Dispatcher::dispatch`]: crate::dispatcher::Dispatcher::dispatch
#[derive(Clone)]
pub struct Message {
    name: String,
    params: Vec<Param>,
    retval: String,
    notifier: Option<Arc<dyn MessageNotifier>>,
    msg_time: DateTime<Utc>,
    time_enqueue: Option<DateTime<Utc>>,
    time_dispatch: Option<DateTime<Utc>>,
    broadcast: bool,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("retval", &self.retval)
            .field("broadcast", &self.broadcast)
            .field("msg_time", &self.msg_time)
            .finish()
    }
}

impl Message {
    /// Create a new message. `retval` seeds [`Message::retval`]; handlers
    /// overwrite it to communicate a result.
    pub fn new(name: impl Into<String>, retval: impl Into<String>, broadcast: bool) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            params: Vec::new(),
            retval: retval.into(),
            notifier: None,
            msg_time: now,
            time_enqueue: None,
            time_dispatch: None,
            broadcast,
        }
    }

    /// Create a copy of this message with a (possibly different) broadcast
    /// flag, preserving timestamps. Mirrors the original engine's copy
    /// constructor, which is used when a reply needs to be re-dispatched as
    /// a fresh broadcast without losing trace timing.
    pub fn copy_with_broadcast(&self, broadcast: bool) -> Self {
        Self {
            name: self.name.clone(),
            params: self.params.clone(),
            retval: self.retval.clone(),
            notifier: self.notifier.clone(),
            msg_time: self.msg_time,
            time_enqueue: self.time_enqueue,
            time_dispatch: self.time_dispatch,
            broadcast,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retval(&self) -> &str {
        &self.retval
    }

    pub fn set_retval(&mut self, value: impl Into<String>) {
        self.retval = value.into();
    }

    pub fn broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn msg_time(&self) -> DateTime<Utc> {
        self.msg_time
    }

    pub fn time_enqueue(&self) -> Option<DateTime<Utc>> {
        self.time_enqueue
    }

    pub fn time_dispatch(&self) -> Option<DateTime<Utc>> {
        self.time_dispatch
    }

    pub(crate) fn mark_enqueued(&mut self, now: DateTime<Utc>) {
        self.time_enqueue = Some(now);
    }

    pub(crate) fn mark_dispatched_at(&mut self, now: DateTime<Utc>) {
        self.time_dispatch = Some(now);
    }

    /// Whether `name` matches this message: an empty handler name matches
    /// any message (a broadcast-eligible/"any name" handler).
    pub fn name_matches(&self, handler_name: &str) -> bool {
        handler_name.is_empty() || handler_name == self.name
    }

    /// Install (or clear) the notifier invoked from [`Message::dispatched`].
    pub fn set_notifier(&mut self, notifier: Option<Arc<dyn MessageNotifier>>) {
        self.notifier = notifier;
    }

    /// Number of parameters currently set, counting duplicates.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterate parameters in insertion order.
    pub fn params(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    /// Get the value of the first parameter with this name, if any.
    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    /// Append a parameter, permitting duplicates (matches the original
    /// NamedList semantics: `addParam` always appends).
    pub fn add_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.push(Param {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Set a parameter: replaces the first occurrence of `name`, or appends
    /// if absent.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(p) = self.params.iter_mut().find(|p| p.name == name) {
            p.value = value.into();
        } else {
            self.add_param(name, value);
        }
    }

    /// Remove all parameters with this name.
    pub fn clear_param(&mut self, name: &str) {
        self.params.retain(|p| p.name != name);
    }

    /// Append `suffix` to the named parameter's value, joined by `,` if the
    /// parameter already exists, else add a new parameter with just
    /// `suffix`. Used by the dispatcher's handler-name tracking
    /// (spec.md §4.1 "Tracking").
    pub fn append_param(&mut self, name: &str, suffix: &str) -> usize {
        if let Some(p) = self.params.iter_mut().find(|p| p.name == name) {
            let start = p.value.len();
            if !p.value.is_empty() {
                p.value.push(',');
            }
            p.value.push_str(suffix);
            start + if start > 0 { 1 } else { 0 }
        } else {
            self.add_param(name.to_string(), suffix.to_string());
            0
        }
    }

    /// Insert `text` at byte offset `at` in the named parameter's value
    /// (used to back-patch a `#secs.millis` duration into a tracked
    /// parameter after a later handler has already appended its own name).
    pub fn insert_into_param(&mut self, name: &str, at: usize, text: &str) {
        if let Some(p) = self.params.iter_mut().find(|p| p.name == name) {
            if at <= p.value.len() {
                p.value.insert_str(at, text);
            }
        }
    }

    /// Reset the message for reuse: clears the return value and re-stamps
    /// all timestamps to `now` (original engine's `resetMsg`).
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.retval.clear();
        self.msg_time = now;
        self.time_enqueue = Some(now);
        self.time_dispatch = Some(now);
    }

    /// Invoke the notifier, if any, once this message has left the
    /// dispatcher. `accepted` is the dispatcher's final OR of handler
    /// return values.
    pub fn dispatched(&self, accepted: bool) {
        if let Some(notifier) = &self.notifier {
            notifier.dispatched(self, accepted);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code: unwrap/expect are acceptable
mod tests {
    use super::*;

    #[test]
    fn params_preserve_insertion_order_and_duplicates() {
        let mut msg = Message::new("call.execute", "", false);
        msg.add_param("callto", "sip/1001");
        msg.add_param("caller", "1000");
        msg.add_param("callto", "sip/1002");
        let values: Vec<_> = msg.params().map(|p| (p.name.as_str(), p.value.as_str())).collect();
        assert_eq!(
            values,
            vec![
                ("callto", "sip/1001"),
                ("caller", "1000"),
                ("callto", "sip/1002"),
            ]
        );
        // get_param returns the first match.
        assert_eq!(msg.get_param("callto"), Some("sip/1001"));
    }

    #[test]
    fn set_param_replaces_first_occurrence() {
        let mut msg = Message::new("engine.start", "", false);
        msg.add_param("x", "1");
        msg.set_param("x", "2");
        assert_eq!(msg.get_param("x"), Some("2"));
        assert_eq!(msg.len(), 1);
    }

    #[test]
    fn empty_handler_name_matches_any_message() {
        let msg = Message::new("call.route", "", false);
        assert!(msg.name_matches(""));
        assert!(msg.name_matches("call.route"));
        assert!(!msg.name_matches("call.execute"));
    }

    #[test]
    fn append_param_joins_with_comma() {
        let mut msg = Message::new("call.route", "", false);
        let pos = msg.append_param("handlers", "route");
        assert_eq!(pos, 0);
        let pos2 = msg.append_param("handlers", "cdrbuild");
        assert_eq!(msg.get_param("handlers"), Some("route,cdrbuild"));
        assert!(pos2 > pos);
    }

    #[test]
    fn reset_clears_retval_and_restamps_time() {
        let mut msg = Message::new("call.route", "ok", false);
        let earlier = msg.msg_time();
        let later = earlier + chrono::Duration::seconds(5);
        msg.reset(later);
        assert_eq!(msg.retval(), "");
        assert_eq!(msg.msg_time(), later);
        assert_eq!(msg.time_dispatch(), Some(later));
    }
}
