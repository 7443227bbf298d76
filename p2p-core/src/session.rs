//! Message session: one peer relationship. Assigns identifiers, routes inbound messages to
//! transfers or signaling handlers, and multiplexes outbound messages over relay or direct
//! transports with a retry queue for when neither is usable.
//!
//! Each collection has its own lock. Nested locking only ever goes `transfers` before a
//! transfer's own locks, and `routes` before `pending`. No lock is held while calling into a
//! transport, a handler or a transfer.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::direct::{self, FrameEncodeError};
use crate::error::{Error, Result};
use crate::header::{FramingError, Header, ProtocolVersion};
use crate::message::{random_nonzero, Message, MessageKind};
use crate::pool::MessagePool;
use crate::relay;
use crate::transfer::{AbortReason, DataStream, TransferSession, TransferSetup, TransferState};
use crate::transport::{same_transport, DirectConnector, Transport, TransportError, TransportKind};

/// Notifications for the layer above. Delivered over the channel returned by `MessageSession::new`.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TransferStarted { session_id: u32 },
    TransferFinished { session_id: u32 },
    TransferAborted { session_id: u32, reason: AbortReason },
    DirectConnectionEstablished,
    DirectConnectionFailed,
    DirectConnectionClosed,
    /// The relay transport failed; outbound messages are buffered until `set_transport`.
    TransportInvalid,
}

/// Receives signaling (session 0) messages.
pub trait MessageHandler: Send + Sync {
    /// Returns true when the handler consumed the message.
    fn handle_message(&self, session: &MessageSession, message: &Message) -> bool;
}

/// Called once with the acknowledgement of a message sent through `send_with_ack`.
pub type AckCallback = Box<dyn FnOnce(&Message) + Send>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Base plus current value of one side's identifier counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierSequence {
    base: u32,
    current: u32,
}

impl IdentifierSequence {
    pub fn new(base: u32) -> Self {
        Self { base, current: base }
    }

    pub fn random() -> Self {
        Self::new(rand::thread_rng().gen_range(1000..=i32::MAX as u32))
    }

    pub fn with_current(base: u32, current: u32) -> Self {
        Self { base, current }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// V1: next identifier, never equal to the base.
    pub fn advance_v1(&mut self) -> u32 {
        self.current = self.current.wrapping_add(1);
        if self.current == self.base {
            self.current = self.current.wrapping_add(1);
        }
        self.current
    }

    /// V2: returns the identifier for a message and moves past its `size` bytes.
    pub fn advance_v2(&mut self, size: u32) -> u32 {
        let id = self.current;
        self.current = self.current.wrapping_add(size);
        id
    }
}

struct Ids {
    local: IdentifierSequence,
    remote: IdentifierSequence,
}

#[derive(Default)]
struct Routes {
    relay: Option<Arc<dyn Transport>>,
    relay_valid: bool,
    direct: Option<Arc<dyn Transport>>,
    direct_attempted: bool,
    nonce: Option<Uuid>,
}

struct PendingTransport {
    transport: Arc<dyn Transport>,
    listening: bool,
}

enum TransmitError {
    NoTransport,
    Failed(Arc<dyn Transport>, TransportError),
    Encode(FrameEncodeError),
}

impl From<FrameEncodeError> for TransmitError {
    fn from(e: FrameEncodeError) -> Self {
        TransmitError::Encode(e)
    }
}

impl From<FramingError> for TransmitError {
    fn from(e: FramingError) -> Self {
        TransmitError::Encode(e.into())
    }
}

pub struct MessageSession {
    version: ProtocolVersion,
    local_account: String,
    remote_account: String,
    config: SessionConfig,
    ids: Mutex<Ids>,
    routes: Mutex<Routes>,
    pending: Mutex<Vec<PendingTransport>>,
    transfers: Mutex<HashMap<u32, Arc<TransferSession>>>,
    handlers: Mutex<Vec<Arc<dyn MessageHandler>>>,
    retry: Mutex<VecDeque<Message>>,
    flushing: AtomicBool,
    pool: Mutex<MessagePool>,
    acks: Mutex<HashMap<u32, AckCallback>>,
    connector: Mutex<Option<Arc<dyn DirectConnector>>>,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<SessionEvent>,
    this: Weak<MessageSession>,
}

impl MessageSession {
    pub fn new(
        version: ProtocolVersion,
        local_account: impl Into<String>,
        remote_account: impl Into<String>,
        config: SessionConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new_cyclic(|this| Self {
            version,
            local_account: local_account.into(),
            remote_account: remote_account.into(),
            config,
            ids: Mutex::new(Ids {
                local: IdentifierSequence::random(),
                remote: IdentifierSequence::new(0),
            }),
            routes: Mutex::new(Routes::default()),
            pending: Mutex::new(Vec::new()),
            transfers: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            retry: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            pool: Mutex::new(MessagePool::new()),
            acks: Mutex::new(HashMap::new()),
            connector: Mutex::new(None),
            closed: AtomicBool::new(false),
            events: tx,
            this: this.clone(),
        });
        (session, rx)
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn local_account(&self) -> &str {
        &self.local_account
    }

    pub fn remote_account(&self) -> &str {
        &self.remote_account
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    // --- identifiers ---

    pub fn local_identifier(&self) -> u32 {
        lock(&self.ids).local.current()
    }

    pub fn local_base_identifier(&self) -> u32 {
        lock(&self.ids).local.base()
    }

    pub fn remote_identifier(&self) -> u32 {
        lock(&self.ids).remote.current()
    }

    pub fn remote_base_identifier(&self) -> u32 {
        lock(&self.ids).remote.base()
    }

    /// Replace the local counter (e.g. to continue a base negotiated elsewhere).
    pub fn set_local_sequence(&self, sequence: IdentifierSequence) {
        lock(&self.ids).local = sequence;
    }

    /// Identifier for a V1 message series that shares one identifier across chunks.
    pub fn next_local_identifier(&self) -> u32 {
        let mut ids = lock(&self.ids);
        match self.version {
            ProtocolVersion::V1 => ids.local.advance_v1(),
            ProtocolVersion::V2 => ids.local.current(),
        }
    }

    // --- handlers ---

    pub fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        lock(&self.handlers).push(handler);
    }

    pub fn unregister_handler(&self, handler: &Arc<dyn MessageHandler>) {
        lock(&self.handlers).retain(|h| !Arc::ptr_eq(h, handler));
    }

    // --- outbound ---

    /// Assign identifiers, split to the current transport's chunk size and send (or buffer).
    pub fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let (_, chunks) = self.prepare(message);
        for chunk in chunks {
            self.transmit(chunk);
        }
        Ok(())
    }

    /// Like `send`, and runs `callback` when the peer acknowledges the message.
    pub fn send_with_ack(&self, message: Message, callback: AckCallback) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let (key, chunks) = self.prepare(message);
        lock(&self.acks).insert(key, callback);
        for chunk in chunks {
            self.transmit(chunk);
        }
        Ok(())
    }

    pub fn pending_acks(&self) -> usize {
        lock(&self.acks).len()
    }

    /// Messages waiting for a usable transport.
    pub fn buffered_messages(&self) -> usize {
        lock(&self.retry).len()
    }

    fn prepare(&self, mut message: Message) -> (u32, Vec<Message>) {
        let max = self.config.max_chunk_size(self.version, self.is_direct_connected());
        let kind = message.kind();
        let mut ids = lock(&self.ids);
        match self.version {
            ProtocolVersion::V1 => {
                if message.identifier() == 0 {
                    let id = ids.local.advance_v1();
                    message.update_header(|h| h.set_identifier(id));
                }
                if matches!(kind, MessageKind::Signaling | MessageKind::Data) {
                    message.update_header(|h| {
                        if let Header::V1(h) = h {
                            if h.ack_session_id == 0 {
                                h.ack_session_id = random_nonzero();
                            }
                        }
                    });
                }
                let chunks = message.split(max);
                let key = chunks.first().map_or(0, Message::expected_ack_key);
                (key, chunks)
            }
            ProtocolVersion::V2 => {
                let assign = message.identifier() == 0;
                if assign {
                    let id = ids.local.current();
                    message.update_header(|h| h.set_identifier(id));
                }
                let key = message.expected_ack_key();
                let chunks = message.split(max);
                if assign {
                    let used: u32 = chunks.iter().map(|c| c.header().message_size()).sum();
                    ids.local.advance_v2(used);
                }
                (key, chunks)
            }
        }
    }

    fn transmit(&self, chunk: Message) {
        // A flusher may hold a popped chunk that has not gone out yet; queue behind it.
        let deferred = {
            let q = lock(&self.retry);
            !q.is_empty() || self.flushing.load(Ordering::Acquire)
        };
        if deferred {
            self.enqueue(chunk);
            self.flush_retry_queue();
            return;
        }
        match self.try_transmit(&chunk) {
            Ok(()) => {}
            Err(TransmitError::NoTransport) => {
                debug!(identifier = chunk.identifier(), "no usable transport, buffering");
                self.enqueue(chunk);
            }
            Err(TransmitError::Failed(transport, e)) => {
                warn!(error = %e, "send failed, buffering");
                self.invalidate_transport(&transport);
                self.enqueue(chunk);
                self.flush_retry_queue();
            }
            Err(TransmitError::Encode(e)) => {
                warn!(error = %e, identifier = chunk.identifier(), "dropping unencodable message");
            }
        }
    }

    fn try_transmit(&self, message: &Message) -> std::result::Result<(), TransmitError> {
        let route = {
            let r = lock(&self.routes);
            match (&r.direct, &r.relay) {
                (Some(d), _) => Some(d.clone()),
                (None, Some(relay)) if r.relay_valid => Some(relay.clone()),
                _ => None,
            }
        };
        let transport = route.ok_or(TransmitError::NoTransport)?;
        let bytes = match transport.kind() {
            TransportKind::Direct => direct::encode_frame(message)?,
            TransportKind::Relay => relay::wrap(message, &self.remote_account, Some(&self.local_account))?,
        };
        trace!(identifier = message.identifier(), len = bytes.len(), "sending");
        transport.send(bytes).map_err(|e| TransmitError::Failed(transport, e))
    }

    fn enqueue(&self, message: Message) {
        let len = {
            let mut q = lock(&self.retry);
            q.push_back(message);
            q.len()
        };
        if len > self.config.max_buffered_messages {
            debug!(len, "retry queue over capacity, delaying sender");
            std::thread::sleep(self.config.backpressure_delay());
        }
    }

    /// Replay buffered messages in order until the queue is empty or no transport is usable.
    pub fn flush_retry_queue(&self) {
        loop {
            if self.flushing.swap(true, Ordering::AcqRel) {
                return;
            }
            let stalled = self.drain_retry_queue();
            self.flushing.store(false, Ordering::Release);
            if stalled || lock(&self.retry).is_empty() {
                return;
            }
        }
    }

    fn drain_retry_queue(&self) -> bool {
        loop {
            let Some(next) = lock(&self.retry).pop_front() else {
                return false;
            };
            match self.try_transmit(&next) {
                Ok(()) => {}
                Err(TransmitError::NoTransport) => {
                    lock(&self.retry).push_front(next);
                    return true;
                }
                Err(TransmitError::Failed(transport, e)) => {
                    warn!(error = %e, "replay failed");
                    lock(&self.retry).push_front(next);
                    self.invalidate_transport(&transport);
                }
                Err(TransmitError::Encode(e)) => {
                    warn!(error = %e, "dropping unencodable buffered message");
                }
            }
        }
    }

    // --- transports ---

    /// Install a relay transport, or promote a direct one, then replay buffered messages.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        {
            let mut r = lock(&self.routes);
            match transport.kind() {
                TransportKind::Relay => {
                    r.relay = Some(transport);
                    r.relay_valid = true;
                }
                TransportKind::Direct => {
                    r.direct = Some(transport);
                    r.direct_attempted = true;
                }
            }
        }
        info!(buffered = self.buffered_messages(), "transport set");
        self.flush_retry_queue();
    }

    /// Mark a transport unusable. A failed direct connection falls back to the relay; a failed
    /// relay raises `TransportInvalid` so the host can supply a replacement.
    pub fn invalidate_transport(&self, transport: &Arc<dyn Transport>) {
        let mut r = lock(&self.routes);
        if r.direct.as_ref().is_some_and(|d| same_transport(d, transport)) {
            r.direct = None;
            drop(r);
            info!("direct connection lost, falling back to relay");
            transport.disconnect();
            self.emit(SessionEvent::DirectConnectionClosed);
        } else if r.relay.as_ref().is_some_and(|t| same_transport(t, transport)) {
            if r.relay_valid {
                r.relay_valid = false;
                drop(r);
                warn!("relay transport invalid");
                self.emit(SessionEvent::TransportInvalid);
            }
        }
    }

    pub fn is_direct_connected(&self) -> bool {
        lock(&self.routes).direct.is_some()
    }

    pub fn direct_attempted(&self) -> bool {
        lock(&self.routes).direct_attempted
    }

    // --- inbound ---

    /// Bytes from the relay: unwrap and process. The message is dropped on error.
    pub fn handle_relay_bytes(&self, bytes: &[u8]) -> Result<()> {
        let (_, message) = relay::unwrap(self.version, bytes).map_err(|e| {
            warn!(error = %e, "dropping relay message");
            e
        })?;
        self.handle_inbound(message);
        Ok(())
    }

    /// One length-prefix frame body from a direct transport (pending or active).
    pub fn handle_direct_frame(&self, transport: &Arc<dyn Transport>, frame: &[u8]) -> Result<()> {
        if direct::is_preamble(frame) {
            trace!("preamble");
            return Ok(());
        }
        if self.is_pending(transport) {
            let nonce = match self.version {
                ProtocolVersion::V1 => Message::parse(self.version, frame)
                    .ok()
                    .filter(|m| m.kind() == MessageKind::Handshake)
                    .and_then(|m| m.header().as_v1().map(direct::nonce_from_v1)),
                ProtocolVersion::V2 => direct::parse_v2_handshake(frame),
            };
            match nonce {
                Some(nonce) => self.complete_handshake(transport, nonce),
                None => warn!(len = frame.len(), "unexpected frame before handshake"),
            }
            return Ok(());
        }
        let message = Message::parse(self.version, frame).map_err(|e| {
            warn!(error = %e, "dropping direct frame");
            e
        })?;
        self.handle_inbound(message);
        Ok(())
    }

    /// Feed a parsed message through reassembly and dispatch whatever became whole.
    pub fn handle_inbound(&self, message: Message) {
        {
            let mut ids = lock(&self.ids);
            let id = message.identifier();
            if ids.remote.base() == 0 && id != 0 {
                ids.remote = IdentifierSequence::new(id);
            }
            let next = match self.version {
                ProtocolVersion::V1 => id,
                ProtocolVersion::V2 => id.wrapping_add(message.header().message_size()),
            };
            ids.remote = IdentifierSequence::with_current(ids.remote.base(), next);
        }
        let ready: Vec<Message> = {
            let mut pool = lock(&self.pool);
            pool.buffer(message);
            std::iter::from_fn(|| pool.dequeue(self.version)).collect()
        };
        for message in ready {
            self.dispatch(message);
        }
    }

    fn dispatch(&self, message: Message) {
        let session_id = message.session_id();
        if message.is_error() || message.is_close() {
            if let Some(transfer) = self.transfer(session_id) {
                let reason = if message.is_error() {
                    AbortReason::RemoteError
                } else {
                    AbortReason::RemoteClosed
                };
                transfer.abort(reason);
                return;
            }
        }
        match message.kind() {
            MessageKind::Handshake => debug!("ignoring handshake on an established route"),
            MessageKind::Ack => {
                let key = message.header().ack_identifier();
                let callback = lock(&self.acks).remove(&key);
                match callback {
                    Some(cb) => cb(&message),
                    None => trace!(key, "ack without pending callback"),
                }
            }
            MessageKind::Data => match self.transfer(session_id) {
                Some(transfer) => transfer.on_message(&message),
                None => debug!(session_id, "no transfer for data message"),
            },
            MessageKind::Signaling => {
                if message.requires_ack() {
                    if let Err(e) = self.send(message.create_ack()) {
                        debug!(error = %e, "could not acknowledge signaling message");
                    }
                }
                let handlers = lock(&self.handlers).clone();
                let mut consumed = false;
                for handler in &handlers {
                    consumed |= handler.handle_message(self, &message);
                }
                if !consumed {
                    debug!(identifier = message.identifier(), "unhandled signaling message");
                }
            }
        }
    }

    // --- transfers ---

    pub fn create_transfer(&self, setup: TransferSetup, stream: DataStream) -> Result<Arc<TransferSession>> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let mut transfers = lock(&self.transfers);
        if transfers.contains_key(&setup.session_id) {
            return Err(Error::DuplicateSession(setup.session_id));
        }
        let session_id = setup.session_id;
        let transfer = Arc::new(TransferSession::new(self.this.clone(), setup, stream, self.version, &self.config));
        transfers.insert(session_id, transfer.clone());
        debug!(session_id, sender = transfer.is_sender(), "transfer created");
        Ok(transfer)
    }

    pub fn transfer(&self, session_id: u32) -> Option<Arc<TransferSession>> {
        lock(&self.transfers).get(&session_id).cloned()
    }

    pub fn remove_transfer(&self, session_id: u32) -> Option<Arc<TransferSession>> {
        lock(&self.transfers).remove(&session_id)
    }

    pub fn transfer_count(&self) -> usize {
        lock(&self.transfers).len()
    }

    fn resume_waiting_transfers(&self, established: bool) {
        let waiting: Vec<Arc<TransferSession>> = lock(&self.transfers)
            .values()
            .filter(|t| t.state() == TransferState::AwaitingDirectConnection)
            .cloned()
            .collect();
        for transfer in waiting {
            if let Err(e) = transfer.start_data_transfer(established) {
                warn!(session_id = transfer.session_id(), error = %e, "could not resume transfer");
            }
        }
    }

    // --- direct connections ---

    pub fn set_connector(&self, connector: Arc<dyn DirectConnector>) {
        *lock(&self.connector) = Some(connector);
    }

    /// Nonce both sides must present in the handshake. Generated on first use if unset.
    pub fn set_direct_nonce(&self, nonce: Uuid) {
        lock(&self.routes).nonce = Some(nonce);
    }

    pub fn direct_nonce(&self) -> Option<Uuid> {
        lock(&self.routes).nonce
    }

    pub fn create_direct_connection(&self, addr: SocketAddr) -> Result<()> {
        self.open_direct(addr, false)
    }

    pub fn listen_for_direct_connection(&self, addr: SocketAddr) -> Result<()> {
        self.open_direct(addr, true)
    }

    fn open_direct(&self, addr: SocketAddr, listening: bool) -> Result<()> {
        let connector = lock(&self.connector).clone().ok_or(Error::NoConnector)?;
        let this = self.this.upgrade().ok_or(Error::SessionClosed)?;
        {
            let mut r = lock(&self.routes);
            r.direct_attempted = true;
            if r.nonce.is_none() {
                r.nonce = Some(Uuid::new_v4());
            }
        }
        let opened = if listening {
            connector.listen(&this, addr)
        } else {
            connector.connect(&this, addr)
        };
        match opened {
            Ok(transport) => {
                info!(%addr, listening, "direct connection candidate");
                self.add_pending(&transport, listening);
                Ok(())
            }
            Err(e) => {
                warn!(%addr, error = %e, "direct connection could not be opened");
                self.check_direct_failed();
                Err(e.into())
            }
        }
    }

    fn add_pending(&self, transport: &Arc<dyn Transport>, listening: bool) {
        let mut pending = lock(&self.pending);
        match pending.iter_mut().find(|p| same_transport(&p.transport, transport)) {
            Some(p) => p.listening = listening,
            None => pending.push(PendingTransport {
                transport: transport.clone(),
                listening,
            }),
        }
    }

    fn is_pending(&self, transport: &Arc<dyn Transport>) -> bool {
        lock(&self.pending).iter().any(|p| same_transport(&p.transport, transport))
    }

    /// Connector callback: a candidate socket is up. The connecting side sends the handshake.
    pub fn on_direct_connected(&self, transport: &Arc<dyn Transport>, listening: bool) {
        self.add_pending(transport, listening);
        debug!(listening, "direct socket connected");
        if listening || !self.config.auto_handshake {
            return;
        }
        let nonce = {
            let mut r = lock(&self.routes);
            *r.nonce.get_or_insert_with(Uuid::new_v4)
        };
        let sent = direct::encode_handshake(self.version, nonce, true)
            .map_err(|e| e.to_string())
            .and_then(|bytes| transport.send(bytes).map_err(|e| e.to_string()));
        if let Err(e) = sent {
            warn!(error = %e, "handshake send failed");
            self.on_direct_failed(transport);
        }
    }

    fn complete_handshake(&self, transport: &Arc<dyn Transport>, nonce: Uuid) {
        let listening = lock(&self.pending)
            .iter()
            .find(|p| same_transport(&p.transport, transport))
            .is_some_and(|p| p.listening);
        let accepted = {
            let mut r = lock(&self.routes);
            match r.nonce {
                Some(expected) => expected == nonce,
                None => {
                    r.nonce = Some(nonce);
                    true
                }
            }
        };
        if !accepted {
            warn!("direct handshake nonce mismatch");
            self.on_direct_failed(transport);
            return;
        }
        // Must be the active route before the reply goes out.
        let losers: Vec<Arc<dyn Transport>> = {
            let mut r = lock(&self.routes);
            r.direct = Some(transport.clone());
            r.direct_attempted = true;
            let mut pending = lock(&self.pending);
            pending
                .drain(..)
                .map(|p| p.transport)
                .filter(|t| !same_transport(t, transport))
                .collect()
        };
        for loser in losers {
            loser.disconnect();
        }
        if listening {
            let echoed = direct::encode_handshake(self.version, nonce, false)
                .map_err(|e| e.to_string())
                .and_then(|bytes| transport.send(bytes).map_err(|e| e.to_string()));
            if let Err(e) = echoed {
                warn!(error = %e, "handshake reply failed");
                self.invalidate_transport(transport);
                self.check_direct_failed();
                return;
            }
        }
        info!(listening, "direct connection established");
        self.emit(SessionEvent::DirectConnectionEstablished);
        self.resume_waiting_transfers(true);
        self.flush_retry_queue();
    }

    /// Connector callback: a candidate failed to connect or handshake.
    pub fn on_direct_failed(&self, transport: &Arc<dyn Transport>) {
        lock(&self.pending).retain(|p| !same_transport(&p.transport, transport));
        transport.disconnect();
        self.check_direct_failed();
    }

    fn check_direct_failed(&self) {
        let no_candidates = lock(&self.pending).is_empty();
        if no_candidates && !self.is_direct_connected() {
            info!("direct connection failed, staying on relay");
            self.emit(SessionEvent::DirectConnectionFailed);
            self.resume_waiting_transfers(false);
        }
    }

    /// Connector callback: the socket closed.
    pub fn on_direct_disconnected(&self, transport: &Arc<dyn Transport>) {
        if self.is_pending(transport) {
            self.on_direct_failed(transport);
        } else {
            self.invalidate_transport(transport);
        }
    }

    /// Drop the active direct connection and fall back to the relay.
    pub fn close_direct_connection(&self) {
        let direct = lock(&self.routes).direct.take();
        if let Some(transport) = direct {
            info!("closing direct connection");
            transport.disconnect();
            self.emit(SessionEvent::DirectConnectionClosed);
        }
    }

    /// Abort every transfer, drop all connections and buffered state.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transfers: Vec<Arc<TransferSession>> = lock(&self.transfers).values().cloned().collect();
        for transfer in transfers {
            transfer.abort(AbortReason::SessionClosed);
        }
        let pending: Vec<PendingTransport> = lock(&self.pending).drain(..).collect();
        for p in pending {
            p.transport.disconnect();
        }
        self.close_direct_connection();
        lock(&self.retry).clear();
        lock(&self.pool).clear();
        lock(&self.acks).clear();
        info!(remote = %self.remote_account, "message session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::V1Flags;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl Transport for Recorder {
        fn kind(&self) -> TransportKind {
            TransportKind::Relay
        }
        fn send(&self, bytes: Vec<u8>) -> std::result::Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected);
            }
            lock(&self.sent).push(bytes);
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn disconnect(&self) {}
    }

    fn sent_messages(r: &Recorder, version: ProtocolVersion) -> Vec<Message> {
        lock(&r.sent)
            .iter()
            .map(|b| relay::unwrap(version, b).unwrap().1)
            .collect()
    }

    #[test]
    fn identifier_skips_base() {
        let mut seq = IdentifierSequence::with_current(10, 8);
        assert_eq!(seq.advance_v1(), 9);
        assert_eq!(seq.advance_v1(), 11);

        let mut seq = IdentifierSequence::with_current(0, u32::MAX);
        assert_eq!(seq.advance_v1(), 1);
    }

    #[test]
    fn identifier_v2_advances_by_size() {
        let mut seq = IdentifierSequence::new(100);
        assert_eq!(seq.advance_v2(20), 100);
        assert_eq!(seq.advance_v2(5), 120);
        assert_eq!(seq.current(), 125);
    }

    #[test]
    fn v1_send_assigns_identifiers() {
        let (session, _rx) = MessageSession::new(ProtocolVersion::V1, "a", "b", SessionConfig::default());
        let relay = Arc::new(Recorder::default());
        session.set_transport(relay.clone());
        let base = session.local_base_identifier();
        for _ in 0..3 {
            let mut m = Message::new(ProtocolVersion::V1);
            m.set_payload(b"x".to_vec());
            session.send(m).unwrap();
        }
        let sent = sent_messages(&relay, ProtocolVersion::V1);
        let ids: Vec<u32> = sent.iter().map(Message::identifier).collect();
        assert_eq!(ids, vec![base + 1, base + 2, base + 3]);
        assert!(sent.iter().all(|m| m.header().as_v1().unwrap().ack_session_id != 0));
    }

    #[test]
    fn v2_send_advances_by_message_size() {
        let (session, _rx) = MessageSession::new(ProtocolVersion::V2, "a", "b", SessionConfig::default());
        let relay = Arc::new(Recorder::default());
        session.set_transport(relay.clone());
        let start = session.local_identifier();
        let mut m = Message::new(ProtocolVersion::V2);
        m.set_payload(vec![1; 3000]);
        session.send(m).unwrap();
        let sent = sent_messages(&relay, ProtocolVersion::V2);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].identifier(), start);
        let used: u32 = sent.iter().map(|m| m.header().message_size()).sum();
        assert_eq!(session.local_identifier(), start.wrapping_add(used));
    }

    #[test]
    fn buffers_without_transport_and_replays_in_order() {
        let (session, _rx) = MessageSession::new(ProtocolVersion::V1, "a", "b", SessionConfig::default());
        for i in 0..3u8 {
            let mut m = Message::new(ProtocolVersion::V1);
            m.set_payload(vec![i]);
            session.send(m).unwrap();
        }
        assert_eq!(session.buffered_messages(), 3);
        let relay = Arc::new(Recorder::default());
        session.set_transport(relay.clone());
        assert_eq!(session.buffered_messages(), 0);
        let payloads: Vec<u8> = sent_messages(&relay, ProtocolVersion::V1)
            .iter()
            .map(|m| m.payload()[0])
            .collect();
        assert_eq!(payloads, vec![0, 1, 2]);
    }

    #[test]
    fn send_queues_behind_an_active_flush() {
        let (session, _rx) = MessageSession::new(ProtocolVersion::V1, "a", "b", SessionConfig::default());
        let relay = Arc::new(Recorder::default());
        session.set_transport(relay.clone());
        // Queue empty, but a flusher is between popping its last chunk and sending it.
        session.flushing.store(true, Ordering::SeqCst);
        let mut m = Message::new(ProtocolVersion::V1);
        m.set_payload(vec![7]);
        session.send(m).unwrap();
        assert_eq!(session.buffered_messages(), 1);
        assert!(lock(&relay.sent).is_empty());

        session.flushing.store(false, Ordering::SeqCst);
        session.flush_retry_queue();
        assert_eq!(session.buffered_messages(), 0);
        assert_eq!(sent_messages(&relay, ProtocolVersion::V1)[0].payload(), &[7]);
    }

    #[test]
    fn failed_relay_raises_transport_invalid() {
        let (session, mut rx) = MessageSession::new(ProtocolVersion::V1, "a", "b", SessionConfig::default());
        let relay = Arc::new(Recorder::default());
        relay.fail.store(true, Ordering::SeqCst);
        session.set_transport(relay.clone());
        let mut m = Message::new(ProtocolVersion::V1);
        m.set_payload(vec![1]);
        session.send(m).unwrap();
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::TransportInvalid);
        assert_eq!(session.buffered_messages(), 1);
    }

    #[test]
    fn ack_callback_fires_once() {
        let (session, _rx) = MessageSession::new(ProtocolVersion::V1, "a", "b", SessionConfig::default());
        let relay = Arc::new(Recorder::default());
        session.set_transport(relay.clone());
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        let mut m = Message::new(ProtocolVersion::V1);
        m.set_payload(b"invite".to_vec());
        session
            .send_with_ack(
                m,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(session.pending_acks(), 1);
        let sent = sent_messages(&relay, ProtocolVersion::V1).remove(0);
        let ack = sent.create_ack();
        session.handle_inbound(ack.clone());
        session.handle_inbound(ack);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(session.pending_acks(), 0);
    }

    #[test]
    fn signaling_is_acked_and_fanned_out() {
        struct Count(std::sync::atomic::AtomicUsize);
        impl MessageHandler for Count {
            fn handle_message(&self, _: &MessageSession, _: &Message) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                true
            }
        }
        let (session, _rx) = MessageSession::new(ProtocolVersion::V1, "a", "b", SessionConfig::default());
        let relay = Arc::new(Recorder::default());
        session.set_transport(relay.clone());
        let first = Arc::new(Count(Default::default()));
        let second: Arc<dyn MessageHandler> = Arc::new(Count(Default::default()));
        session.register_handler(first.clone());
        session.register_handler(second.clone());
        session.unregister_handler(&second);

        let mut m = Message::new(ProtocolVersion::V1);
        m.update_header(|h| h.set_identifier(5));
        m.set_payload(b"hello".to_vec());
        session.handle_inbound(m);

        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        let sent = sent_messages(&relay, ProtocolVersion::V1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), MessageKind::Ack);
        assert_eq!(sent[0].header().as_v1().unwrap().ack_session_id, 5);
        assert_eq!(session.remote_identifier(), 5);
    }

    #[test]
    fn closed_session_rejects_sends() {
        let (session, _rx) = MessageSession::new(ProtocolVersion::V1, "a", "b", SessionConfig::default());
        session.close();
        let m = Message::new(ProtocolVersion::V1);
        assert!(matches!(session.send(m), Err(Error::SessionClosed)));
    }

    #[test]
    fn handshake_outside_negotiation_is_ignored() {
        let (session, _rx) = MessageSession::new(ProtocolVersion::V1, "a", "b", SessionConfig::default());
        let hs = direct::handshake_message_v1(Uuid::new_v4());
        assert_eq!(hs.header().as_v1().unwrap().flags, V1Flags::DIRECT_HANDSHAKE);
        session.handle_inbound(hs);
        assert_eq!(session.transfer_count(), 0);
    }
}
