//! `IaxEngine`: the concrete socket, call-number allocator, and transaction
//! table an application drives (spec.md §6 "IAXEngine as external
//! collaborator").
//!
//! Call-number allocation follows a free-list: released numbers are pushed
//! onto a stack and popped before the engine mints a new one, rather than
//! growing a counter forever, the same free/allocate shape as hermit's
//! `collections::freelist::FreeList` (`librs/src/collections/freelist.rs`),
//! simplified here to whole call-number slots instead of address ranges.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::IaxEvent;
use crate::frame::Frame;
use crate::ie::IaxIeList;
use crate::transaction::{Transaction, TransactionHost, TransactionKind};

const MAX_CALL_NUMBER: u16 = 0x7fff;

/// Media handed up from a transaction's mini-frame/Voice processing: local
/// call number, remote call number, payload, reconstructed timestamp.
pub type MediaFrame = (u16, u16, Vec<u8>, u32);

/// Owns the UDP socket, the call-number space, and every live transaction.
pub struct IaxEngine {
    socket: Arc<UdpSocket>,
    config: EngineConfig,
    format: u32,
    capability: u32,
    transactions: DashMap<u16, Arc<Transaction>>,
    /// Reverse index from a peer's own call number (as it stamps `src_call`
    /// on every frame it sends us, full or mini) to the local call number of
    /// the transaction we paired it with. A mini-frame header carries only
    /// the sender's call number, never ours, so this is the only way to
    /// route one back to its transaction.
    remote_index: DashMap<u16, u16>,
    free_call_numbers: Mutex<Vec<u16>>,
    next_call_number: AtomicU16,
    users: DashMap<String, String>,
    media_tx: mpsc::UnboundedSender<MediaFrame>,
}

impl IaxEngine {
    /// Bind a UDP socket and construct the engine around it.
    pub async fn bind(
        addr: SocketAddr,
        config: EngineConfig,
        format: u32,
        capability: u32,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<MediaFrame>), EngineError> {
        let socket = UdpSocket::bind(addr).await.map_err(EngineError::Io)?;
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            socket: Arc::new(socket),
            config,
            format,
            capability,
            transactions: DashMap::new(),
            remote_index: DashMap::new(),
            free_call_numbers: Mutex::new(Vec::new()),
            next_call_number: AtomicU16::new(1),
            users: DashMap::new(),
            media_tx,
        });
        Ok((engine, media_rx))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Register a username/password pair this engine will answer auth
    /// challenges for (inbound registrar role) or authenticate as (outbound
    /// caller role).
    pub fn register_user(&self, username: impl Into<String>, password: impl Into<String>) {
        self.users.insert(username.into(), password.into());
    }

    /// Look up a registered user's password, e.g. to answer an `AuthReq`
    /// challenge with [`Transaction::send_auth_reply`] or to verify one
    /// before `send_auth`.
    pub fn password_for(&self, username: &str) -> Option<String> {
        self.users.get(username).map(|entry| entry.value().clone())
    }

    fn allocate_call_number(&self) -> Result<u16, EngineError> {
        if let Some(n) = self.free_call_numbers.lock().pop() {
            return Ok(n);
        }
        let n = self.next_call_number.fetch_add(1, Ordering::Relaxed);
        if n > MAX_CALL_NUMBER {
            return Err(EngineError::CallNumbersExhausted);
        }
        Ok(n)
    }

    fn release_call_number(&self, n: u16) {
        self.free_call_numbers.lock().push(n);
    }

    /// Start a new call/registration/poke to `remote` (spec.md §4.5
    /// "outbound").
    pub fn originate(
        self: &Arc<Self>,
        kind: TransactionKind,
        remote: SocketAddr,
        ies: IaxIeList,
        now: Instant,
    ) -> Result<Arc<Transaction>, EngineError> {
        let local_call_no = self.allocate_call_number()?;
        let host: Arc<dyn TransactionHost> = self.clone();
        let txn = Transaction::new_outbound(host, self.config.clone(), kind, local_call_no, remote, ies, now);
        self.transactions.insert(local_call_no, txn.clone());
        Ok(txn)
    }

    /// Feed one datagram off the wire to the right transaction, creating one
    /// if the frame is a recognized first frame and no transaction owns its
    /// destination call number yet.
    ///
    /// A full frame's `dst_call` names the transaction's local call number
    /// directly, but a mini-frame header carries only the sender's own call
    /// number (the same field a full frame calls `src_call`), which is never
    /// comparable to our local call numbers — they are allocated
    /// independently on each end. Mini-frames are routed through
    /// `remote_index`, keyed by that remote call number instead.
    pub fn receive_datagram(self: &Arc<Self>, bytes: &[u8], remote: SocketAddr, now: Instant) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                trace!(%err, "dropping undecodable datagram");
                return;
            }
        };

        match frame {
            Frame::Mini(mini) => {
                let local_call_no = self.remote_index.get(&mini.src_call).map(|entry| *entry.value());
                match local_call_no.and_then(|local| self.transactions.get(&local).map(|e| e.value().clone())) {
                    Some(txn) => txn.process_frame(Frame::Mini(mini), now),
                    None => trace!(src_call = mini.src_call, "mini-frame for unknown transaction dropped"),
                }
            }
            Frame::Full(full) => {
                let dst_call = full.dst_call;
                if let Some(txn) = self.transactions.get(&dst_call).map(|e| e.value().clone()) {
                    txn.process_frame(Frame::Full(full), now);
                    self.sync_remote_index(dst_call, &txn);
                    return;
                }
                if dst_call != 0 {
                    trace!(dst_call, "full frame for unknown transaction dropped");
                    return;
                }

                let local_call_no = match self.allocate_call_number() {
                    Ok(n) => n,
                    Err(err) => {
                        warn!(%err, "cannot accept inbound call, call numbers exhausted");
                        return;
                    }
                };
                let host: Arc<dyn TransactionHost> = self.clone();
                match Transaction::new_inbound(host, self.config.clone(), local_call_no, remote, full, now) {
                    Some(txn) => {
                        debug!(local_call_no, %remote, "inbound transaction created");
                        self.transactions.insert(local_call_no, txn.clone());
                        self.sync_remote_index(local_call_no, &txn);
                    }
                    None => {
                        self.release_call_number(local_call_no);
                        trace!("unsupported first frame type, no transaction created");
                    }
                }
            }
        }
    }

    /// Record (or refresh) the remote call number a transaction has learned
    /// for itself, so a later mini-frame from that peer can find it back.
    /// A no-op until the peer's call number is actually known (outbound
    /// transactions start out not knowing it).
    fn sync_remote_index(&self, local_call_no: u16, txn: &Arc<Transaction>) {
        let remote_call_no = txn.remote_call_no();
        if remote_call_no != 0 {
            self.remote_index.insert(remote_call_no, local_call_no);
        }
    }

    /// Run the socket read loop until the socket errors. Each datagram is
    /// fed to [`receive_datagram`](Self::receive_datagram).
    pub async fn run_recv_loop(self: Arc<Self>) -> Result<(), EngineError> {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, remote) = self.socket.recv_from(&mut buf).await.map_err(EngineError::Io)?;
            self.receive_datagram(&buf[..len], remote, Instant::now());
        }
    }

    /// Pump every live transaction's event queue once, collecting at most
    /// one event per transaction, and reap any that finished.
    pub fn poll_events(&self, now: Instant) -> Vec<(u16, IaxEvent)> {
        let mut events = Vec::new();
        let mut finished = Vec::new();
        for entry in self.transactions.iter() {
            let local_call_no = *entry.key();
            if let Some(event) = entry.value().get_event(now) {
                let terminal = event.is_terminal();
                events.push((local_call_no, event));
                if terminal {
                    finished.push(local_call_no);
                }
            }
        }
        for local_call_no in finished {
            if let Some((_, txn)) = self.transactions.remove(&local_call_no) {
                let remote_call_no = txn.remote_call_no();
                if remote_call_no != 0 {
                    self.remote_index.remove(&remote_call_no);
                }
            }
            self.release_call_number(local_call_no);
        }
        events
    }

    /// Look up a live transaction by its local call number.
    pub fn transaction(&self, local_call_no: u16) -> Result<Arc<Transaction>, EngineError> {
        self.transactions
            .get(&local_call_no)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::UnknownTransaction {
                local: local_call_no,
                remote: None,
            })
    }

    pub fn active_transaction_count(&self) -> usize {
        self.transactions.len()
    }
}

impl TransactionHost for IaxEngine {
    fn write_socket(&self, bytes: &[u8], remote: SocketAddr) -> bool {
        match self.socket.try_send_to(bytes, remote) {
            Ok(_) => true,
            Err(err) => {
                warn!(%err, %remote, "failed to send frame");
                false
            }
        }
    }

    fn process_media(&self, call: (u16, u16), data: &[u8], timestamp: u32) {
        let _ = self.media_tx.send((call.0, call.1, data.to_vec(), timestamp));
    }

    fn format(&self) -> u32 {
        self.format
    }

    fn capability(&self) -> u32 {
        self.capability
    }

    fn get_md5_from_challenge(&self, challenge: &str, password: &str) -> String {
        use md5::{Digest, Md5};
        let mut hasher = Md5::new();
        hasher.update(challenge.as_bytes());
        hasher.update(password.as_bytes());
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }

    fn is_md5_challenge_correct(&self, auth: &str, challenge: &str, password: &str) -> bool {
        auth == self.get_md5_from_challenge(challenge, password)
    }
}

/// A snapshot of per-user credentials an engine holds, for diagnostics.
pub fn registered_users(engine: &IaxEngine) -> HashMap<String, usize> {
    engine.users.iter().map(|entry| (entry.key().clone(), entry.value().len())).collect()
}
