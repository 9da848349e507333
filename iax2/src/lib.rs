//! # iax2 - IAX2 Transaction State Machine
//!
//! The per-call protocol engine for a telephony engine core: wire framing,
//! information elements, and the handshake/media state machine for one
//! IAX2 call or registration. [`Transaction`] owns a single call's sequence
//! counters, retransmission queue, and auth handshake; [`IaxEngine`] is the
//! concrete socket/call-number-table collaborator that drives many
//! transactions at once.
//!
//! # Quick Start
//!
//! ```no_run
//! use iax2::{EngineConfig, IaxEngine, TransactionKind};
//! use iax2::ie::IaxIeList;
//! use std::net::SocketAddr;
//! use std::time::Instant;
//!
//! # async fn run() -> Result<(), iax2::EngineError> {
//! let local: SocketAddr = "0.0.0.0:4569".parse().unwrap();
//! let (engine, mut media) = IaxEngine::bind(local, EngineConfig::default(), iax2::codec::ULAW, iax2::codec::ULAW).await?;
//!
//! let peer: SocketAddr = "203.0.113.10:4569".parse().unwrap();
//! let poke = engine.originate(TransactionKind::Poke, peer, IaxIeList::new(), Instant::now())?;
//! assert_eq!(poke.kind(), TransactionKind::Poke);
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`frame`] - wire framing: full frames (12-byte header) and mini-frames (4-byte header)
//! - [`ie`] - information elements and [`ie::IaxIeList`]
//! - [`seq`] - 8-bit modular sequence-number arithmetic
//! - [`codec`] - audio format bitmask constants and format/capability negotiation
//! - [`event`] - [`event::IaxEvent`], what a transaction surfaces to its driver
//! - [`transaction`] - [`transaction::Transaction`], the handshake/media state machine
//! - [`engine`] - [`engine::IaxEngine`]: socket, call-number allocator, transaction table
//! - [`config`] - [`EngineConfig`] with sensible defaults
//! - [`error`] - structured error types

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod frame;
pub mod ie;
pub mod seq;
pub mod transaction;

pub use config::EngineConfig;
pub use engine::{IaxEngine, MediaFrame};
pub use error::{EngineError, FrameError};
pub use event::IaxEvent;
pub use frame::{Frame, FrameType, FullFrame, MiniFrame, Subclass};
pub use ie::{IaxIeList, InfoElement};
pub use transaction::{AuthMethod, State, Transaction, TransactionHost, TransactionKind};
