//! # msgbus - Prioritized Publish/Dispatch Message Bus
//!
//! The message fabric for a telephony engine core: every event, signal, and
//! cross-module request is carried by a uniform, named, parameterized
//! [`Message`]. Modules register prioritized [`Handler`]s; the
//! [`Dispatcher`] routes a message through handlers in priority order until
//! one accepts it, or through all of them when the message is a broadcast.
//!
//! # Quick Start
//!
//! ```
//! use msgbus::{Dispatcher, Handler, HandlerSpec, Message};
//! use std::sync::Arc;
//!
//! struct Echo;
//! impl Handler for Echo {
//!     fn receive(&self, msg: &mut Message) -> bool {
//!         msg.set_retval(msg.name().to_string());
//!         true
//!     }
//! }
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.install(HandlerSpec::new("ping", 100, Arc::new(Echo)));
//!
//! let mut msg = Message::new("ping", "", false);
//! assert!(dispatcher.dispatch(&mut msg));
//! assert_eq!(msg.retval(), "ping");
//! ```
//!
//! # Module Organization
//!
//! - [`message`] - [`Message`], parameters, timestamps, notification callback
//! - [`filter`] - [`MessageFilter`] matching tree (exact string or regexp)
//! - [`handler`] - [`Handler`], [`HandlerSpec`], [`MessageReceiver`]/relay indirection, post-hooks
//! - [`dispatcher`] - [`Dispatcher`]: synchronous dispatch and the async FIFO queue
//! - [`queue`] - [`MessageQueue`]: a secondary per-subject worker pool
//! - [`wire`] - the external control-channel line protocol (encode/decode)
//! - [`config`] - [`DispatcherConfig`] with sensible defaults
//! - [`error`] - structured error types

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod handler;
pub mod message;
pub mod queue;
pub mod wire;

pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatchStats, HandlerInfo};
pub use error::{DispatchError, WireError};
pub use filter::MessageFilter;
pub use handler::{Handler, HandlerSpec, MessageNotifier, MessagePostHook, MessageReceiver};
pub use message::Message;
pub use queue::MessageQueue;
