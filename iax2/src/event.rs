//! Protocol events an [`IAXTransaction`](crate::transaction::Transaction) surfaces to its driver
//! (spec.md §4.8 `getEvent`, §7 "the transaction never throws; all failures
//! are observable via IAXEvent types").

use crate::ie::IaxIeList;

/// One outcome of [`Transaction::get_event`](crate::transaction::Transaction::get_event).
///
/// At most one is produced per call; the transaction never reports more
/// than one event for a single causing frame.
#[derive(Debug, Clone, PartialEq)]
pub enum IaxEvent {
    /// A `New`/`RegReq`/`RegRel` was received and accepted into the
    /// handshake; carries the request's information elements.
    New(IaxIeList),
    /// The peer accepted our outbound New/Reg.
    Accept(IaxIeList),
    /// The peer rejected our outbound New/Reg, or we rejected theirs.
    Reject(IaxIeList),
    /// Either side hung up an established call.
    Hangup(IaxIeList),
    /// Challenge/auth-method negotiation request.
    AuthReq(IaxIeList),
    /// Challenge response.
    AuthRep(IaxIeList),
    Busy,
    Answer,
    Ringing,
    Progressing,
    /// Retransmission budget exhausted, or a Terminating transaction's
    /// remote-side grace period elapsed (spec.md §4.8 point 2).
    Timeout,
    /// An `Inval` frame was received, or a generated event carried an
    /// invalid IE list.
    Invalid,
    /// A recognized-but-unhandled control subclass (spec.md §1 "video/image
    /// frames beyond stub recognition").
    NotImplemented,
    Voice { payload: Vec<u8>, timestamp: u32 },
    Dtmf { payload: Vec<u8>, timestamp: u32 },
    Text { payload: Vec<u8>, timestamp: u32 },
    Noise { payload: Vec<u8>, timestamp: u32 },
    /// Terminal event: the transaction has moved to `Terminated` and will
    /// produce no further events.
    Terminated,
    Quelch,
    Unquelch,
}

impl IaxEvent {
    /// Whether this event moves (or has already moved) the transaction to
    /// its terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IaxEvent::Terminated)
    }
}
