//! `IAXTransaction`: one call or registration (spec.md §4.5–§4.9).
//!
//! A transaction owns its own sequence counters, inbound/outbound frame
//! queues, handshake state, and media pacing, guarded by a single internal
//! mutex. Unlike the original engine's recursive lock (spec.md §5 "Each
//! transaction is a recursive mutex"), this crate's public methods never
//! call back into one another while already holding the lock — the same
//! liveness guarantee without reentrancy, idiomatic for `parking_lot`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::event::IaxEvent;
use crate::frame::{Frame, FrameType, FullFrame, MiniFrame, Subclass};
use crate::ie::{IaxIeList, InfoElement};
use crate::seq::{cmp_seq, next_seq};

/// The engine-provided surface a transaction consumes (spec.md §6 "Engine
/// API consumed by the transaction"). A production engine implementation
/// lives in [`crate::engine`]; tests can substitute a stub.
pub trait TransactionHost: Send + Sync {
    /// Hand `bytes` to the unreliable datagram transport. Returns whether
    /// the write was accepted (not delivery — IAX2 has no transport ack
    /// beyond its own protocol frames).
    fn write_socket(&self, bytes: &[u8], remote: SocketAddr) -> bool;

    /// Deliver reassembled media (decoded from a Voice frame or mini-frame)
    /// to whatever consumes audio for this call.
    fn process_media(&self, call: (u16, u16), data: &[u8], timestamp: u32);

    fn format(&self) -> u32;
    fn capability(&self) -> u32;

    /// Compute the MD5 challenge/response digest of `challenge || password`.
    fn get_md5_from_challenge(&self, challenge: &str, password: &str) -> String;

    /// Verify a peer-supplied MD5 result against the expected digest.
    fn is_md5_challenge_correct(&self, auth: &str, challenge: &str, password: &str) -> bool {
        auth == self.get_md5_from_challenge(challenge, password)
    }
}

/// What kind of call/registration this transaction represents (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    New,
    RegReq,
    RegRel,
    Poke,
}

impl TransactionKind {
    fn from_subclass(subclass: Subclass) -> Option<Self> {
        match subclass {
            Subclass::New => Some(TransactionKind::New),
            Subclass::RegReq => Some(TransactionKind::RegReq),
            Subclass::RegRel => Some(TransactionKind::RegRel),
            Subclass::Poke => Some(TransactionKind::Poke),
            _ => None,
        }
    }

    fn post_subclass(self) -> Subclass {
        match self {
            TransactionKind::New => Subclass::New,
            TransactionKind::RegReq => Subclass::RegReq,
            TransactionKind::RegRel => Subclass::RegRel,
            TransactionKind::Poke => Subclass::Poke,
        }
    }
}

/// The handshake state machine (spec.md §3, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unknown,
    NewLocalInvite,
    NewLocalInviteAuthRecv,
    NewLocalInviteRepSent,
    NewRemoteInvite,
    NewRemoteInviteAuthSent,
    NewRemoteInviteRepRecv,
    Connected,
    Terminating,
    Terminated,
}

/// Authentication method negotiated for a New/RegReq/RegRel handshake.
/// Only `Md5` has a working send/verify path; `Rsa`/`Text` are recognized
/// so the state machine can reject them explicitly rather than stall
/// (spec.md §9 "never silently stall").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Md5,
    Rsa,
    Text,
}

impl AuthMethod {
    fn bit(self) -> u16 {
        match self {
            AuthMethod::Md5 => 1 << 0,
            AuthMethod::Rsa => 1 << 1,
            AuthMethod::Text => 1 << 2,
        }
    }

    fn from_bits(bits: u16) -> Option<Self> {
        // Preference order matches the original: MD5 first.
        if bits & AuthMethod::Md5.bit() != 0 {
            Some(AuthMethod::Md5)
        } else if bits & AuthMethod::Rsa.bit() != 0 {
            Some(AuthMethod::Rsa)
        } else if bits & AuthMethod::Text.bit() != 0 {
            Some(AuthMethod::Text)
        } else {
            None
        }
    }
}

const NO_MEDIA_FORMAT: &str = "Unsupported or missing media format or capability";
const NO_AUTH_METHOD: &str = "Unsupported or missing authentication method or missing challenge";
const INVALID_AUTH: &str = "Invalid authentication request, response or challenge";

/// A queued outbound full frame awaiting acknowledgement or a typed
/// response, with its retransmission accounting (spec.md §3 "IAXFrameOut").
struct FrameOut {
    frame: FullFrame,
    ack_only: bool,
    acked: bool,
    last_sent_at: Instant,
    transmissions: u32,
    max_transmissions: u32,
    retrans_interval: Duration,
}

impl FrameOut {
    fn needs_retransmission(&self, now: Instant) -> bool {
        !self.acked && now.duration_since(self.last_sent_at) >= self.retrans_interval
    }

    /// Invariant 8: "an unacked outbound frame is transmitted at most
    /// `retransCount+1` times". `transmissions` already counts the initial
    /// send, so once it reaches the limit no further send is permitted.
    fn at_retransmission_limit(&self) -> bool {
        self.transmissions >= self.max_transmissions
    }

    fn mark_transmitted(&mut self, now: Instant) {
        self.transmissions += 1;
        self.last_sent_at = now;
    }
}

struct Inner {
    remote_call_no: u16,
    state: State,
    o_seq_no: u8,
    i_seq_no: u8,
    /// `m_timeStamp = now - 1` in the original (spec.md §9 open question):
    /// back-dated so a peer frame arriving in the same millisecond as
    /// construction still observes a non-zero elapsed timestamp.
    time_base: Instant,
    timeout_at: Option<Instant>,
    next_ping_at: Instant,
    local_req_end: bool,

    last_mini_frame_out: u16,
    last_mini_frame_in: Option<u32>,

    in_frames: VecDeque<FullFrame>,
    out_frames: Vec<FrameOut>,

    username: String,
    password: String,
    calling_number: String,
    calling_name: String,
    called_number: String,
    called_context: String,
    challenge: String,
    authdata: String,
    auth_method: AuthMethod,
    refresh: u16,

    format: u32,
    capability: u32,

    in_total_frames: u64,
    in_out_of_order_frames: u64,
    in_dropped_frames: u64,
}

impl Inner {
    fn new(remote_call_no: u16, config: &EngineConfig, now: Instant) -> Self {
        let time_base = now
            .checked_sub(Duration::from_millis(1))
            .unwrap_or(now);
        Self {
            remote_call_no,
            state: State::Unknown,
            o_seq_no: 0,
            i_seq_no: 0,
            time_base,
            timeout_at: None,
            next_ping_at: now + config.ping_interval,
            local_req_end: false,
            last_mini_frame_out: 0xFFFF,
            last_mini_frame_in: None,
            in_frames: VecDeque::new(),
            out_frames: Vec::new(),
            username: String::new(),
            password: String::new(),
            calling_number: String::new(),
            calling_name: String::new(),
            called_number: String::new(),
            called_context: String::new(),
            challenge: String::new(),
            authdata: String::new(),
            auth_method: AuthMethod::Md5,
            refresh: 60,
            format: 0,
            capability: 0,
            in_total_frames: 0,
            in_out_of_order_frames: 0,
            in_dropped_frames: 0,
        }
    }

    fn timestamp(&self, now: Instant) -> u32 {
        now.duration_since(self.time_base).as_millis() as u32
    }

    /// Sequence space is only consumed by frames that aren't pure
    /// handshake bookkeeping (spec.md §3 invariant: "Ack/VNAK/TxAcc/TxCnt/
    /// Inval do not consume sequence space").
    fn consumes_seq(subclass: Subclass) -> bool {
        !matches!(subclass, Subclass::Ack | Subclass::Vnak | Subclass::Inval)
    }

    fn change_state(&mut self, new_state: State) -> bool {
        if self.state == new_state {
            return true;
        }
        match self.state {
            State::Terminated => return false,
            State::Terminating if new_state != State::Terminated => return false,
            _ => {}
        }
        self.state = new_state;
        true
    }
}

/// One IAX2 call or registration.
pub struct Transaction {
    local_call_no: u16,
    remote_addr: SocketAddr,
    kind: TransactionKind,
    config: EngineConfig,
    host: Arc<dyn TransactionHost>,
    inner: Mutex<Inner>,
}

impl Transaction {
    pub fn local_call_no(&self) -> u16 {
        self.local_call_no
    }

    pub fn remote_call_no(&self) -> u16 {
        self.inner.lock().remote_call_no
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn authdata(&self) -> String {
        self.inner.lock().authdata.clone()
    }

    pub fn format(&self) -> u32 {
        self.inner.lock().format
    }

    pub fn dropped_frames(&self) -> u64 {
        self.inner.lock().in_dropped_frames
    }

    pub fn total_frames(&self) -> u64 {
        self.inner.lock().in_total_frames
    }

    pub fn out_of_order_frames(&self) -> u64 {
        self.inner.lock().in_out_of_order_frames
    }

    // ---- construction -----------------------------------------------------

    /// Build a transaction from a received first frame, per spec.md §4.5
    /// "inbound (from a received first frame whose subclass is one of
    /// {New, RegReq, RegRel, Poke})". Returns `None` for FwDownl or any
    /// other unsupported type.
    pub fn new_inbound(
        host: Arc<dyn TransactionHost>,
        config: EngineConfig,
        local_call_no: u16,
        remote_addr: SocketAddr,
        first_frame: FullFrame,
        now: Instant,
    ) -> Option<Arc<Transaction>> {
        let kind = TransactionKind::from_subclass(first_frame.subclass)?;
        let remote_call_no = first_frame.src_call;
        let mut inner = Inner::new(remote_call_no, &config, now);
        inner.in_total_frames += 1;
        let subclass = first_frame.subclass;
        if Inner::consumes_seq(subclass) {
            inner.i_seq_no = next_seq(inner.i_seq_no);
        }
        inner.in_frames.push_back(first_frame.clone());

        let txn = Arc::new(Transaction {
            local_call_no,
            remote_addr,
            kind,
            config,
            host,
            inner: Mutex::new(inner),
        });
        txn.send_ack_for(&first_frame, now);
        debug!(local_call_no, remote_call_no, ?kind, "transaction created (inbound)");
        Some(txn)
    }

    /// Build an outbound transaction from a type and an information-element
    /// list (spec.md §4.5 "outbound (from a type + IE list)").
    pub fn new_outbound(
        host: Arc<dyn TransactionHost>,
        config: EngineConfig,
        kind: TransactionKind,
        local_call_no: u16,
        remote_addr: SocketAddr,
        ies: IaxIeList,
        now: Instant,
    ) -> Arc<Transaction> {
        let mut inner = Inner::new(0, &config, now);
        match kind {
            TransactionKind::New => {
                inner.username = ies.username().unwrap_or_default().to_string();
                inner.calling_number = ies.calling_number().unwrap_or_default().to_string();
                inner.calling_name = ies.calling_name().unwrap_or_default().to_string();
                inner.called_number = ies.called_number().unwrap_or_default().to_string();
                inner.called_context = ies.called_context().unwrap_or_default().to_string();
                inner.format = ies.format().unwrap_or(host.format());
                inner.capability = ies.capability().unwrap_or(host.capability());
            }
            TransactionKind::RegReq | TransactionKind::RegRel => {
                inner.username = ies.username().unwrap_or_default().to_string();
                inner.refresh = ies.refresh().unwrap_or(60);
            }
            TransactionKind::Poke => {}
        }
        inner.state = State::NewLocalInvite;

        let txn = Arc::new(Transaction {
            local_call_no,
            remote_addr,
            kind,
            config,
            host,
            inner: Mutex::new(inner),
        });

        let out_ies = {
            let guard = txn.inner.lock();
            match kind {
                TransactionKind::New => IaxIeList::new()
                    .with(InfoElement::Version(2))
                    .with(InfoElement::Username(guard.username.clone()))
                    .with(InfoElement::CallingNumber(guard.calling_number.clone()))
                    .with(InfoElement::CallingName(guard.calling_name.clone()))
                    .with(InfoElement::CalledNumber(guard.called_number.clone()))
                    .with(InfoElement::CalledContext(guard.called_context.clone()))
                    .with(InfoElement::Format(guard.format))
                    .with(InfoElement::Capability(guard.capability)),
                TransactionKind::RegReq | TransactionKind::RegRel => IaxIeList::new()
                    .with(InfoElement::Username(guard.username.clone()))
                    .with(InfoElement::Refresh(guard.refresh)),
                TransactionKind::Poke => IaxIeList::new(),
            }
        };

        let mut guard = txn.inner.lock();
        txn.post_frame(&mut guard, kind.post_subclass(), out_ies, Vec::new(), None, false, now);
        drop(guard);
        debug!(local_call_no, ?kind, "transaction created (outbound)");
        txn
    }

    // ---- frame reception ---------------------------------------------------

    /// Accept a frame off the wire (spec.md §4.6 `processFrame`).
    pub fn process_frame(&self, frame: Frame, now: Instant) {
        match frame {
            Frame::Mini(mini) => self.process_mini_frame(mini, now),
            Frame::Full(full) => self.process_full_frame(full, now),
        }
    }

    fn process_full_frame(&self, frame: FullFrame, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            drop(inner);
            self.send_inval(now);
            return;
        }
        if inner.state == State::Terminating {
            let accept_ack_only = inner.local_req_end
                && frame.subclass.frame_type() == FrameType::Iax
                && frame.subclass == Subclass::Ack;
            if !accept_ack_only {
                return;
            }
        }

        inner.in_total_frames += 1;
        if inner.in_frames.len() >= self.config.max_in_frames {
            inner.in_dropped_frames += 1;
            warn!(local_call_no = self.local_call_no, "inbound frame queue full, dropping frame");
            return;
        }

        let is_ack = frame.subclass.frame_type() == FrameType::Iax && frame.subclass == Subclass::Ack;
        if !is_ack && !self.is_frame_acceptable(&mut inner, &frame, now) {
            return;
        }
        if Inner::consumes_seq(frame.subclass) {
            inner.i_seq_no = next_seq(inner.i_seq_no);
        }
        if !is_ack {
            drop(inner);
            self.send_ack_for(&frame, now);
            inner = self.inner.lock();
        }

        let mut frame = frame;
        if frame.subclass == Subclass::Voice && !frame.payload.is_empty() {
            let payload = std::mem::take(&mut frame.payload);
            let ts = frame.timestamp;
            if self.accept_media_timestamp(&mut inner, ts) {
                let call = (self.local_call_no, inner.remote_call_no);
                drop(inner);
                self.host.process_media(call, &payload, ts);
                inner = self.inner.lock();
            }
        }

        inner.in_frames.push_back(frame);
    }

    fn process_mini_frame(&self, mini: MiniFrame, now: Instant) {
        let _ = now;
        let mut inner = self.inner.lock();
        let incoming16 = u32::from(mini.timestamp16);
        let reconstructed = match inner.last_mini_frame_in {
            None => incoming16,
            Some(last) => {
                let mut ts = incoming16 | (last & 0xffff_0000);
                if (ts & 0xffff) < (last & 0xffff) {
                    ts += 0x1_0000;
                }
                ts
            }
        };
        if !self.accept_media_timestamp(&mut inner, reconstructed) {
            return;
        }
        let call = (self.local_call_no, inner.remote_call_no);
        drop(inner);
        self.host.process_media(call, &mini.payload, reconstructed);
    }

    /// Shared `lastMiniFrameIn` baseline update/gate for both full Voice
    /// frames and mini-frames, mirroring the original's uniform
    /// `processMedia` treatment of both as one monotonic timestamp sequence.
    /// Returns whether `reconstructed` is acceptable and, if so, advances
    /// the baseline; a zero delta resets the baseline to resync on the next
    /// frame, and a negative or too-large delta drops the frame outright.
    fn accept_media_timestamp(&self, inner: &mut Inner, reconstructed: u32) -> bool {
        let baseline = inner.last_mini_frame_in.unwrap_or(0);
        let delta = reconstructed as i64 - baseline as i64;
        if inner.last_mini_frame_in.is_some() && delta == 0 {
            inner.last_mini_frame_in = None;
            return false;
        }
        if delta < 0 || delta >= 32767 {
            return false;
        }
        inner.last_mini_frame_in = Some(reconstructed);
        true
    }

    fn is_frame_acceptable(&self, inner: &mut Inner, frame: &FullFrame, now: Instant) -> bool {
        let delta = cmp_seq(frame.o_seq_no, inner.i_seq_no);
        if delta == 0 {
            return true;
        }
        if delta > 0 {
            info!(
                local_call_no = self.local_call_no,
                expected = inner.i_seq_no,
                got = frame.o_seq_no,
                "out-of-order frame, sending VNAK"
            );
            inner.in_out_of_order_frames += 1;
            self.post_frame(inner, Subclass::Vnak, IaxIeList::new(), Vec::new(), None, true, now);
        } else {
            trace!(local_call_no = self.local_call_no, "late duplicate frame dropped");
        }
        false
    }

    // ---- media --------------------------------------------------------------

    /// Send media payload (spec.md §4.7 `sendMedia`). Emits a resynchronizing
    /// full Voice frame when the low 16 bits of the transaction timestamp
    /// have rolled behind `lastMiniFrameOut`; otherwise writes a mini-frame
    /// directly to the socket, unqueued.
    pub fn send_media(&self, data: &[u8], format: u32, now: Instant) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let ts = inner.timestamp(now);
        let ts16 = ts as u16;
        if ts16 < inner.last_mini_frame_out {
            inner.last_mini_frame_out = ts16;
            self.post_frame(
                &mut inner,
                Subclass::Voice,
                IaxIeList::new(),
                data.to_vec(),
                Some(ts),
                true,
                now,
            );
            return;
        }
        inner.last_mini_frame_out = ts16;
        let frame = MiniFrame {
            src_call: self.local_call_no,
            timestamp16: ts16,
            payload: data.to_vec(),
        };
        let remote = self.remote_addr;
        drop(inner);
        let _ = format;
        self.host.write_socket(&frame.encode(), remote);
    }

    // ---- outbound control -----------------------------------------------

    pub fn send_accept(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match (self.kind, inner.state) {
            (TransactionKind::New, State::NewRemoteInvite | State::NewRemoteInviteRepRecv) => {
                let ies = IaxIeList::new().with(InfoElement::Format(inner.format));
                self.post_frame(&mut inner, Subclass::Accept, ies, Vec::new(), None, true, now);
                inner.change_state(State::Connected);
                true
            }
            (TransactionKind::RegReq | TransactionKind::RegRel, State::NewRemoteInvite | State::NewRemoteInviteRepRecv) => {
                let remote = self.remote_addr;
                let ies = IaxIeList::new()
                    .with(InfoElement::Username(inner.username.clone()))
                    .with(InfoElement::CallingNumber(inner.calling_number.clone()))
                    .with(InfoElement::CallingName(inner.calling_name.clone()))
                    .with(InfoElement::Refresh(inner.refresh))
                    .with(InfoElement::ApparentAddr(remote.to_string().into_bytes()));
                self.post_frame(&mut inner, Subclass::RegAck, ies, Vec::new(), None, true, now);
                inner.change_state(State::Terminating);
                inner.local_req_end = true;
                true
            }
            _ => false,
        }
    }

    pub fn send_hangup(&self, cause: Option<&str>, code: Option<u8>, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if self.kind != TransactionKind::New
            || inner.state == State::Terminated
            || inner.state == State::Terminating
        {
            return false;
        }
        let ies = cause_ies(cause, code);
        self.post_frame(&mut inner, Subclass::Hangup, ies, Vec::new(), None, false, now);
        inner.change_state(State::Terminating);
        inner.local_req_end = true;
        debug!(local_call_no = self.local_call_no, cause, "transaction hangup sent");
        true
    }

    pub fn send_reject(&self, cause: Option<&str>, code: Option<u8>, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated || inner.state == State::Terminating {
            return false;
        }
        let subclass = match self.kind {
            TransactionKind::New => Subclass::Reject,
            TransactionKind::RegReq | TransactionKind::RegRel => Subclass::RegRej,
            TransactionKind::Poke => return false,
        };
        let ies = cause_ies(cause, code);
        self.post_frame(&mut inner, subclass, ies, Vec::new(), None, false, now);
        inner.change_state(State::Terminating);
        inner.local_req_end = true;
        debug!(local_call_no = self.local_call_no, cause, "transaction reject sent");
        true
    }

    /// Challenge the peer (callee side): spec.md §4.9 "caller may `sendAuth`".
    /// The challenge itself is a pseudo-random 32-bit value chosen here, per
    /// spec.md §4.9 "on send-auth, choose a pseudo-random 32-bit challenge".
    pub fn send_auth(&self, password: impl Into<String>, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(self.kind, TransactionKind::New | TransactionKind::RegReq | TransactionKind::RegRel)
            || inner.state != State::NewRemoteInvite
        {
            return false;
        }
        inner.password = password.into();
        inner.auth_method = AuthMethod::Md5;
        inner.challenge = rand::random::<u32>().to_string();
        let ies = IaxIeList::new()
            .with(InfoElement::Username(inner.username.clone()))
            .with(InfoElement::AuthMethods(AuthMethod::Md5.bit()))
            .with(InfoElement::Challenge(inner.challenge.clone()));
        let subclass = match self.kind {
            TransactionKind::New => Subclass::AuthReq,
            _ => Subclass::RegReq, // RegAuth is modeled as a RegReq challenge resend in this crate's reduced subclass set.
        };
        self.post_frame(&mut inner, subclass, ies, Vec::new(), None, false, now);
        inner.change_state(State::NewRemoteInviteAuthSent);
        true
    }

    /// Answer a received challenge (spec.md §4.9 "caller invokes
    /// `sendAuthReply`"). MD5 is the only auth method with a real
    /// implementation; RSA/Text are recognized and rejected.
    pub fn send_auth_reply(&self, password: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(self.kind, TransactionKind::New | TransactionKind::RegReq | TransactionKind::RegRel)
            || inner.state != State::NewLocalInviteAuthRecv
        {
            return false;
        }
        if inner.auth_method != AuthMethod::Md5 {
            drop(inner);
            return self.send_reject(Some(NO_AUTH_METHOD), None, now);
        }
        let digest = self.host.get_md5_from_challenge(&inner.challenge, password);
        let mut ies = IaxIeList::new();
        if self.kind != TransactionKind::New {
            ies.push(InfoElement::Username(inner.username.clone()));
        }
        ies.push(InfoElement::Md5Result(digest));
        let subclass = match self.kind {
            TransactionKind::New => Subclass::AuthRep,
            TransactionKind::RegReq => Subclass::RegReq,
            TransactionKind::RegRel => Subclass::RegRel,
            TransactionKind::Poke => unreachable!("guarded above"),
        };
        self.post_frame(&mut inner, subclass, ies, Vec::new(), None, false, now);
        inner.change_state(State::NewLocalInviteRepSent);
        true
    }

    /// Send a text message. Returns `false` if the transaction isn't
    /// connected, or if the text is too large to fit a single full frame's
    /// payload (spec.md's fragmentation is out of scope).
    pub fn send_text(&self, text: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != State::Connected {
            return false;
        }
        self.post_frame(&mut inner, Subclass::Text, IaxIeList::new(), text.as_bytes().to_vec(), None, true, now)
    }

    // ---- frame posting / retransmission ------------------------------------

    /// Build, transmit, and queue a frame for acknowledgement. Returns
    /// `false` without sending anything if the transaction has already
    /// terminated or the payload exceeds `config.max_full_frame_data_len`.
    #[allow(clippy::too_many_arguments)]
    fn post_frame(
        &self,
        inner: &mut Inner,
        subclass: Subclass,
        ies: IaxIeList,
        payload: Vec<u8>,
        timestamp: Option<u32>,
        ack_only: bool,
        now: Instant,
    ) -> bool {
        if inner.state == State::Terminated {
            return false;
        }
        if payload.len() > self.config.max_full_frame_data_len {
            warn!(
                local_call_no = self.local_call_no,
                len = payload.len(),
                max = self.config.max_full_frame_data_len,
                ?subclass,
                "refusing to send full frame: payload exceeds max_full_frame_data_len"
            );
            return false;
        }
        let ts = timestamp.unwrap_or_else(|| inner.timestamp(now));
        let consumes = Inner::consumes_seq(subclass);
        let frame = FullFrame {
            src_call: self.local_call_no,
            dst_call: inner.remote_call_no,
            retransmit: false,
            timestamp: ts,
            o_seq_no: inner.o_seq_no,
            i_seq_no: inner.i_seq_no,
            subclass,
            ies,
            payload,
        };
        if consumes {
            inner.o_seq_no = next_seq(inner.o_seq_no);
        }
        let mut out = FrameOut {
            frame,
            ack_only,
            acked: false,
            last_sent_at: now,
            transmissions: 0,
            max_transmissions: self.config.retrans_count + 1,
            retrans_interval: self.config.retrans_interval,
        };
        self.transmit(&out.frame, now);
        out.mark_transmitted(now);
        inner.out_frames.push(out);
        true
    }

    fn transmit(&self, frame: &FullFrame, now: Instant) {
        let _ = now;
        self.host.write_socket(&frame.encode(), self.remote_addr);
    }

    fn send_ack_for(&self, frame: &FullFrame, now: Instant) {
        let inner = self.inner.lock();
        let ack = FullFrame {
            src_call: self.local_call_no,
            dst_call: inner.remote_call_no,
            retransmit: false,
            timestamp: frame.timestamp,
            o_seq_no: frame.i_seq_no,
            i_seq_no: inner.i_seq_no,
            subclass: Subclass::Ack,
            ies: IaxIeList::new(),
            payload: Vec::new(),
        };
        let _ = now;
        self.host.write_socket(&ack.encode(), self.remote_addr);
    }

    fn send_inval(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let ts = inner.timestamp(now);
        let frame = FullFrame {
            src_call: self.local_call_no,
            dst_call: inner.remote_call_no,
            retransmit: false,
            timestamp: ts,
            o_seq_no: inner.o_seq_no,
            i_seq_no: inner.i_seq_no,
            subclass: Subclass::Inval,
            ies: IaxIeList::new(),
            payload: Vec::new(),
        };
        inner.o_seq_no = next_seq(inner.o_seq_no);
        self.host.write_socket(&frame.encode(), self.remote_addr);
    }

    // ---- event pump ---------------------------------------------------------

    /// Produce at most one event per call (spec.md §4.8 `getEvent`).
    pub fn get_event(&self, now: Instant) -> Option<IaxEvent> {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            return None;
        }
        if inner.state == State::Terminating && !inner.local_req_end {
            return match inner.timeout_at {
                Some(deadline) if now >= deadline => {
                    inner.change_state(State::Terminated);
                    Some(IaxEvent::Timeout)
                }
                _ => None,
            };
        }
        if inner.state != State::Terminating && now >= inner.next_ping_at {
            self.post_frame(&mut inner, Subclass::Ping, IaxIeList::new(), Vec::new(), None, true, now);
            inner.next_ping_at = now + self.config.ping_interval;
        }

        if let Some(event) = self.poll_outbound(&mut inner, now) {
            return Some(event);
        }
        if let Some(event) = self.poll_inbound(&mut inner, now) {
            return Some(event);
        }
        None
    }

    fn poll_outbound(&self, inner: &mut Inner, now: Instant) -> Option<IaxEvent> {
        let mut i = 0;
        while i < inner.out_frames.len() {
            if let Some(ack_idx) = self.find_inbound(inner, FrameType::Iax, Subclass::Ack, inner.out_frames[i].frame.timestamp) {
                inner.in_frames.remove(ack_idx);
                inner.out_frames[i].acked = true;
                if inner.state == State::Terminating {
                    inner.out_frames.remove(i);
                    inner.change_state(State::Terminated);
                    return Some(IaxEvent::Terminated);
                }
                if inner.out_frames[i].ack_only {
                    inner.out_frames.remove(i);
                    continue;
                }
            }

            if let Some((event, remove)) = self.match_typed_response(inner, i, now) {
                if remove {
                    inner.out_frames.remove(i);
                } else {
                    i += 1;
                }
                if let Some(event) = event {
                    return Some(event);
                }
                continue;
            }

            if inner.out_frames[i].needs_retransmission(now) {
                if inner.out_frames[i].at_retransmission_limit() {
                    inner.out_frames.remove(i);
                    inner.change_state(State::Terminated);
                    warn!(local_call_no = self.local_call_no, "retransmission budget exhausted");
                    return Some(IaxEvent::Timeout);
                }
                let frame_copy = inner.out_frames[i].frame.clone();
                self.transmit(&frame_copy, now);
                inner.out_frames[i].mark_transmitted(now);
                debug!(local_call_no = self.local_call_no, subclass = ?frame_copy.subclass, "retransmitting frame");
            }
            i += 1;
        }
        None
    }

    fn find_inbound(&self, inner: &Inner, frame_type: FrameType, subclass: Subclass, timestamp: u32) -> Option<usize> {
        inner
            .in_frames
            .iter()
            .position(|f| f.subclass.frame_type() == frame_type && f.subclass == subclass && f.timestamp == timestamp)
    }

    fn find_inbound_any_ts(&self, inner: &Inner, subclass: Subclass) -> Option<usize> {
        inner.in_frames.iter().position(|f| f.subclass == subclass)
    }

    /// Match a pending outbound frame against the typed response expected
    /// for `(kind, state, out frame's subclass)` (spec.md §4.9's branching
    /// state tables). Returns `Some((event, remove_out_frame))` when the
    /// frame's wait is resolved one way or another; `None` means the frame
    /// is still pending (subject to retransmission).
    fn match_typed_response(&self, inner: &mut Inner, idx: usize, now: Instant) -> Option<(Option<IaxEvent>, bool)> {
        let out_subclass = inner.out_frames[idx].frame.subclass;
        let state = inner.state;

        let candidates: &[(Subclass, State)] = match (self.kind, state, out_subclass) {
            (TransactionKind::New, State::NewLocalInvite, Subclass::New) => &[
                (Subclass::AuthReq, State::NewLocalInviteAuthRecv),
                (Subclass::Accept, State::Connected),
                (Subclass::Reject, State::Terminating),
                (Subclass::Hangup, State::Terminating),
            ],
            (TransactionKind::New, State::NewLocalInviteRepSent, Subclass::AuthRep) => &[
                (Subclass::Accept, State::Connected),
                (Subclass::Reject, State::Terminating),
                (Subclass::Hangup, State::Terminating),
            ],
            (TransactionKind::New, State::NewRemoteInviteAuthSent, Subclass::AuthReq) => &[
                (Subclass::New, State::NewRemoteInviteRepRecv),
                (Subclass::Reject, State::Terminating),
                (Subclass::Hangup, State::Terminating),
            ],
            (TransactionKind::RegReq | TransactionKind::RegRel, State::NewLocalInvite, sub)
                if sub == self.kind.post_subclass() =>
            {
                &[
                    (Subclass::RegAck, State::Terminating),
                    (Subclass::AuthReq, State::NewLocalInviteAuthRecv),
                    (Subclass::RegRej, State::Terminating),
                ]
            }
            (TransactionKind::RegReq | TransactionKind::RegRel, State::NewLocalInviteRepSent, sub)
                if sub == self.kind.post_subclass() =>
            {
                &[
                    (Subclass::RegAck, State::Terminating),
                    (Subclass::RegRej, State::Terminating),
                ]
            }
            (TransactionKind::RegReq | TransactionKind::RegRel, State::NewRemoteInviteAuthSent, sub)
                if sub == self.kind.post_subclass() =>
            {
                &[
                    (Subclass::RegReq, State::NewRemoteInviteRepRecv),
                    (Subclass::RegRel, State::NewRemoteInviteRepRecv),
                    (Subclass::RegRej, State::Terminating),
                ]
            }
            (TransactionKind::Poke, State::NewLocalInvite, Subclass::Poke) => &[(Subclass::Pong, State::Terminated)],
            _ => &[],
        };

        for &(candidate, new_state) in candidates {
            let Some(pos) = self.find_inbound_any_ts(inner, candidate) else {
                continue;
            };
            let Some(frame) = inner.in_frames.remove(pos) else {
                continue;
            };
            let ies = frame.ies.clone();
            inner.change_state(new_state);

            let event = match candidate {
                Subclass::AuthReq => self.handle_auth_req(inner, ies, now),
                Subclass::New if out_subclass == Subclass::AuthReq => self.handle_auth_rep(inner, ies, now),
                Subclass::RegReq | Subclass::RegRel if out_subclass == Subclass::RegReq || out_subclass == Subclass::RegRel => {
                    self.handle_auth_rep(inner, ies, now)
                }
                Subclass::Accept => Some(IaxEvent::Accept(ies)),
                Subclass::Reject | Subclass::RegRej => {
                    inner.local_req_end = false;
                    self.arm_timeout(inner, now);
                    Some(IaxEvent::Reject(ies))
                }
                Subclass::Hangup => {
                    inner.local_req_end = false;
                    self.arm_timeout(inner, now);
                    Some(IaxEvent::Hangup(ies))
                }
                Subclass::RegAck => self.handle_reg_ack(inner, ies),
                Subclass::Pong => Some(IaxEvent::Terminated),
                _ => None,
            };
            if new_state == State::Terminating {
                self.arm_timeout(inner, now);
            }
            return Some((event, true));
        }

        // Internal ping/lag probes: matched without a typed event.
        if matches!(out_subclass, Subclass::Ping | Subclass::LagRq) {
            let expect = if out_subclass == Subclass::Ping { Subclass::Pong } else { Subclass::LagRp };
            if let Some(pos) = self.find_inbound(inner, FrameType::Iax, expect, inner.out_frames[idx].frame.timestamp) {
                inner.in_frames.remove(pos);
                return Some((None, true));
            }
        }
        None
    }

    fn arm_timeout(&self, inner: &mut Inner, now: Instant) {
        if inner.timeout_at.is_none() {
            inner.timeout_at = Some(now + self.config.transaction_timeout);
        }
    }

    fn handle_auth_req(&self, inner: &mut Inner, ies: IaxIeList, now: Instant) -> Option<IaxEvent> {
        let method_bits = ies.auth_methods();
        let challenge = ies.challenge().map(str::to_string);
        match (method_bits.and_then(AuthMethod::from_bits), challenge) {
            (Some(method), Some(challenge)) => {
                inner.auth_method = method;
                inner.challenge = challenge;
                Some(IaxEvent::AuthReq(ies))
            }
            _ => {
                inner.challenge.clear();
                let event = IaxEvent::Reject(IaxIeList::new().with(InfoElement::Cause(NO_AUTH_METHOD.to_string())));
                self.post_frame(inner, self.reject_subclass(), cause_ies(Some(NO_AUTH_METHOD), None), Vec::new(), None, false, now);
                inner.change_state(State::Terminating);
                inner.local_req_end = true;
                Some(event)
            }
        }
    }

    fn handle_auth_rep(&self, inner: &mut Inner, ies: IaxIeList, now: Instant) -> Option<IaxEvent> {
        let digest = ies.md5_result().unwrap_or_default().to_string();
        inner.authdata = digest.clone();
        if self.kind == TransactionKind::New {
            return Some(IaxEvent::AuthRep(ies));
        }
        // Registration verifies and answers the peer itself (original
        // engine's `processAuthRep` for RegReq/RegRel): no event surfaces
        // here, the Accept/Reject event arrives once that post's own
        // response completes the handshake.
        let correct = self.host.is_md5_challenge_correct(&digest, &inner.challenge, &inner.password);
        if correct {
            let remote = self.remote_addr;
            let reg_ies = IaxIeList::new()
                .with(InfoElement::Username(inner.username.clone()))
                .with(InfoElement::Refresh(inner.refresh))
                .with(InfoElement::ApparentAddr(remote.to_string().into_bytes()));
            self.post_frame(inner, Subclass::RegAck, reg_ies, Vec::new(), None, true, now);
            inner.change_state(State::Terminating);
            inner.local_req_end = true;
        } else {
            self.post_frame(inner, Subclass::RegRej, cause_ies(Some(INVALID_AUTH), None), Vec::new(), None, false, now);
            inner.change_state(State::Terminating);
            inner.local_req_end = true;
        }
        None
    }

    fn handle_reg_ack(&self, inner: &mut Inner, ies: IaxIeList) -> Option<IaxEvent> {
        if let Some(refresh) = ies.refresh() {
            inner.refresh = refresh;
        }
        if let Some(name) = ies.calling_name() {
            inner.calling_name = name.to_string();
        }
        if let Some(number) = ies.calling_number() {
            inner.calling_number = number.to_string();
        }
        inner.local_req_end = false;
        Some(IaxEvent::Accept(ies))
    }

    fn reject_subclass(&self) -> Subclass {
        match self.kind {
            TransactionKind::New => Subclass::Reject,
            TransactionKind::RegReq | TransactionKind::RegRel => Subclass::RegRej,
            TransactionKind::Poke => Subclass::Reject,
        }
    }

    fn poll_inbound(&self, inner: &mut Inner, now: Instant) -> Option<IaxEvent> {
        while let Some(frame) = inner.in_frames.pop_front() {
            let event = if inner.state == State::Unknown {
                self.handle_start(inner, frame, now)
            } else {
                self.handle_ongoing(inner, frame, now)
            };
            if event.is_some() {
                return event;
            }
        }
        None
    }

    fn handle_start(&self, inner: &mut Inner, frame: FullFrame, now: Instant) -> Option<IaxEvent> {
        match self.kind {
            TransactionKind::New if frame.subclass == Subclass::New => {
                if let Some(version) = frame.ies.version() {
                    if version != 2 {
                        self.post_frame(
                            inner,
                            Subclass::Reject,
                            cause_ies(Some("Unsupported or missing protocol version"), None),
                            Vec::new(),
                            None,
                            false,
                            now,
                        );
                        inner.change_state(State::Terminating);
                        inner.local_req_end = true;
                        return None;
                    }
                }
                inner.username = frame.ies.username().unwrap_or_default().to_string();
                inner.password = frame.ies.password().unwrap_or_default().to_string();
                inner.calling_number = frame.ies.calling_number().unwrap_or_default().to_string();
                inner.calling_name = frame.ies.calling_name().unwrap_or_default().to_string();
                inner.called_number = frame.ies.called_number().unwrap_or_default().to_string();
                inner.called_context = frame.ies.called_context().unwrap_or_default().to_string();
                let remote_format = frame.ies.format().unwrap_or(0);
                let remote_capability = frame.ies.capability().unwrap_or(0);

                match crate::codec::negotiate(self.host.capability(), self.host.format(), remote_capability, remote_format) {
                    Some(chosen) => {
                        inner.format = chosen;
                        inner.capability = self.host.capability() & remote_capability;
                        inner.change_state(State::NewRemoteInvite);
                        Some(IaxEvent::New(frame.ies))
                    }
                    None => {
                        self.post_frame(inner, Subclass::Reject, cause_ies(Some(NO_MEDIA_FORMAT), None), Vec::new(), None, false, now);
                        inner.change_state(State::Terminating);
                        inner.local_req_end = true;
                        None
                    }
                }
            }
            TransactionKind::RegReq | TransactionKind::RegRel
                if frame.subclass == Subclass::RegReq || frame.subclass == Subclass::RegRel =>
            {
                inner.username = frame.ies.username().unwrap_or_default().to_string();
                inner.password = frame.ies.password().unwrap_or_default().to_string();
                inner.refresh = frame.ies.refresh().unwrap_or(60);
                inner.change_state(State::NewRemoteInvite);
                Some(IaxEvent::New(frame.ies))
            }
            TransactionKind::Poke if frame.subclass == Subclass::Poke => {
                self.post_frame(inner, Subclass::Pong, IaxIeList::new(), Vec::new(), Some(frame.timestamp), true, now);
                inner.change_state(State::Terminating);
                None
            }
            _ => None,
        }
    }

    fn handle_ongoing(&self, inner: &mut Inner, frame: FullFrame, now: Instant) -> Option<IaxEvent> {
        if frame.subclass.frame_type() == FrameType::Iax && frame.subclass == Subclass::Inval {
            inner.change_state(State::Terminated);
            return Some(IaxEvent::Invalid);
        }

        if inner.state == State::Connected {
            return self.handle_connected(inner, frame, now);
        }

        let pre_connect = matches!(
            inner.state,
            State::NewLocalInviteAuthRecv | State::NewRemoteInvite | State::NewRemoteInviteRepRecv
        );
        if pre_connect {
            let is_reject = match self.kind {
                TransactionKind::New => frame.subclass == Subclass::Hangup || frame.subclass == Subclass::Reject,
                TransactionKind::RegReq | TransactionKind::RegRel => frame.subclass == Subclass::RegRej,
                TransactionKind::Poke => false,
            };
            if is_reject {
                inner.change_state(State::Terminating);
                self.arm_timeout(inner, now);
                return Some(IaxEvent::Reject(frame.ies));
            }
        }
        if self.kind == TransactionKind::Poke && frame.subclass == Subclass::Poke {
            self.post_frame(inner, Subclass::Pong, IaxIeList::new(), Vec::new(), Some(frame.timestamp), true, now);
            inner.change_state(State::Terminating);
            return None;
        }

        self.auto_reply(inner, &frame, now);
        None
    }

    fn handle_connected(&self, inner: &mut Inner, mut frame: FullFrame, now: Instant) -> Option<IaxEvent> {
        match frame.subclass.frame_type() {
            FrameType::Voice => Some(IaxEvent::Voice {
                payload: std::mem::take(&mut frame.payload),
                timestamp: frame.timestamp,
            }),
            FrameType::Dtmf => Some(IaxEvent::Dtmf {
                payload: std::mem::take(&mut frame.payload),
                timestamp: frame.timestamp,
            }),
            FrameType::Text => Some(IaxEvent::Text {
                payload: std::mem::take(&mut frame.payload),
                timestamp: frame.timestamp,
            }),
            FrameType::Noise => Some(IaxEvent::Noise {
                payload: std::mem::take(&mut frame.payload),
                timestamp: frame.timestamp,
            }),
            FrameType::Control => match frame.subclass {
                Subclass::Busy => {
                    inner.change_state(State::Terminating);
                    self.arm_timeout(inner, now);
                    Some(IaxEvent::Busy)
                }
                Subclass::Answer => Some(IaxEvent::Answer),
                Subclass::Ringing => Some(IaxEvent::Ringing),
                Subclass::Progressing => Some(IaxEvent::Progressing),
                _ => Some(IaxEvent::NotImplemented),
            },
            FrameType::Iax => match frame.subclass {
                Subclass::Ping => {
                    self.post_frame(inner, Subclass::Pong, IaxIeList::new(), Vec::new(), Some(frame.timestamp), true, now);
                    None
                }
                Subclass::LagRq => {
                    self.post_frame(inner, Subclass::LagRp, IaxIeList::new(), Vec::new(), Some(frame.timestamp), true, now);
                    None
                }
                Subclass::Quelch => Some(IaxEvent::Quelch),
                Subclass::Unquelch => Some(IaxEvent::Unquelch),
                Subclass::Hangup | Subclass::Reject => {
                    inner.change_state(State::Terminating);
                    self.arm_timeout(inner, now);
                    Some(IaxEvent::Hangup(frame.ies))
                }
                // VNAK is handled passively: the normal per-frame
                // retransmission timer catches up outbound frames rather
                // than an immediate forced resend (spec.md §9 open
                // question, preserved verbatim).
                Subclass::Vnak
                | Subclass::Pong
                | Subclass::LagRp
                | Subclass::New
                | Subclass::Accept
                | Subclass::AuthReq
                | Subclass::AuthRep => None,
                _ => None,
            },
            _ => Some(IaxEvent::NotImplemented),
        }
    }

    fn auto_reply(&self, inner: &mut Inner, frame: &FullFrame, now: Instant) {
        if frame.subclass.frame_type() != FrameType::Iax {
            return;
        }
        match frame.subclass {
            Subclass::Ping => {
                self.post_frame(inner, Subclass::Pong, IaxIeList::new(), Vec::new(), Some(frame.timestamp), true, now);
            }
            Subclass::LagRq => {
                self.post_frame(inner, Subclass::LagRp, IaxIeList::new(), Vec::new(), Some(frame.timestamp), true, now);
            }
            _ => {}
        }
    }
}

fn cause_ies(cause: Option<&str>, code: Option<u8>) -> IaxIeList {
    let mut ies = IaxIeList::new();
    if let Some(cause) = cause {
        ies.push(InfoElement::Cause(cause.to_string()));
    }
    if let Some(code) = code {
        ies.push(InfoElement::CauseCode(code));
    }
    ies
}

impl Drop for Transaction {
    /// If the transaction has not already wound down, send a Reject with
    /// cause "Server shutdown" (spec.md §4.5 "Destruction").
    fn drop(&mut self) {
        let state = self.inner.lock().state;
        if state != State::Terminating && state != State::Terminated {
            self.send_reject(Some("Server shutdown"), None, Instant::now());
        }
    }
}
