//! Transfer session: one data stream in one direction, bound to a session id.
//!
//! The sender runs a dedicated thread that reads the source in chunks; the receiver is driven
//! by `on_message` from whatever thread delivers inbound traffic.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::header::{Header, OperationCode, ProtocolVersion, TfCombination, V1Flags};
use crate::message::Message;
use crate::session::{lock, MessageSession, SessionEvent};
use crate::slp::SlpMessage;

/// Bytes of the zero-filled message sent ahead of the first data chunk.
const PREPARATION_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    AwaitingDirectConnection,
    Transferring,
    Finished,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Finished | TransferState::Aborted)
    }
}

/// Writable, seekable receive target.
pub trait DataSink: Write + Seek + Send {}

impl<T: Write + Seek + Send> DataSink for T {}

pub enum DataStream {
    /// Sender side: `length` bytes are read from `reader`.
    Source { reader: Box<dyn Read + Send>, length: u64 },
    /// Receiver side.
    Sink(Box<dyn DataSink>),
}

impl DataStream {
    pub fn source(reader: impl Read + Send + 'static, length: u64) -> Self {
        DataStream::Source {
            reader: Box::new(reader),
            length,
        }
    }

    pub fn sink(sink: impl DataSink + 'static) -> Self {
        DataStream::Sink(Box::new(sink))
    }

    pub fn is_source(&self) -> bool {
        matches!(self, DataStream::Source { .. })
    }
}

/// Payload tags and identity of a transfer, usually resolved from an invitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSetup {
    pub session_id: u32,
    pub message_flag: V1Flags,
    pub footer: u32,
    pub call_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("send loop already running")]
    AlreadyRunning,
    #[error("transfer already {0:?}")]
    Closed(TransferState),
    #[error("message session is gone")]
    SessionGone,
    #[error("could not spawn send loop: {0}")]
    Spawn(io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Requested,
    RemoteError,
    RemoteClosed,
    SessionClosed,
    Stream(String),
    ShortSource { expected: u64, sent: u64 },
}

pub struct TransferSession {
    session: Weak<MessageSession>,
    setup: TransferSetup,
    version: ProtocolVersion,
    is_sender: bool,
    state: Mutex<TransferState>,
    stream: Mutex<Option<DataStream>>,
    length: u64,
    position: AtomicU64,
    abort_requested: AtomicBool,
    send_loop_active: AtomicBool,
    preparation_seen: AtomicBool,
    package_number: u16,
    chunk_size: usize,
    pacing: Duration,
    close_stream: bool,
}

impl TransferSession {
    pub(crate) fn new(
        session: Weak<MessageSession>,
        setup: TransferSetup,
        stream: DataStream,
        version: ProtocolVersion,
        config: &SessionConfig,
    ) -> Self {
        let (is_sender, length) = match &stream {
            DataStream::Source { length, .. } => (true, *length),
            DataStream::Sink(_) => (false, 0),
        };
        Self {
            session,
            setup,
            version,
            is_sender,
            state: Mutex::new(TransferState::Idle),
            stream: Mutex::new(Some(stream)),
            length,
            position: AtomicU64::new(0),
            abort_requested: AtomicBool::new(false),
            send_loop_active: AtomicBool::new(false),
            preparation_seen: AtomicBool::new(false),
            package_number: rand::thread_rng().gen_range(1..=u16::MAX),
            chunk_size: config.max_chunk_size(version, false),
            pacing: config.v2_pacing(),
            close_stream: config.close_stream_on_finish,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.setup.session_id
    }

    pub fn setup(&self) -> &TransferSetup {
        &self.setup
    }

    pub fn is_sender(&self) -> bool {
        self.is_sender
    }

    pub fn state(&self) -> TransferState {
        *lock(&self.state)
    }

    /// Bytes sent or received so far.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    fn session(&self) -> Option<Arc<MessageSession>> {
        self.session.upgrade()
    }

    /// Move to `to` unless already terminal. Returns the previous state on success.
    fn transition(&self, to: TransferState) -> Option<TransferState> {
        let mut state = lock(&self.state);
        if state.is_terminal() {
            return None;
        }
        let from = *state;
        *state = to;
        Some(from)
    }

    fn mark_transferring(&self, session: &MessageSession) {
        if let Some(from) = self.transition(TransferState::Transferring) {
            if from != TransferState::Transferring {
                info!(session_id = self.session_id(), sender = self.is_sender, "transfer started");
                session.emit(SessionEvent::TransferStarted {
                    session_id: self.session_id(),
                });
            }
        }
    }

    /// Start (or resume) the transfer. With `try_direct`, a sender whose session has no direct
    /// connection and has not attempted one waits in `AwaitingDirectConnection` until the
    /// session reports the outcome.
    pub fn start_data_transfer(self: &Arc<Self>, try_direct: bool) -> Result<(), TransferError> {
        let session = self.session().ok_or(TransferError::SessionGone)?;
        let state = self.state();
        if state.is_terminal() {
            return Err(TransferError::Closed(state));
        }
        if !self.is_sender {
            self.mark_transferring(&session);
            return Ok(());
        }
        if self.send_loop_active.load(Ordering::Acquire) {
            return Err(TransferError::AlreadyRunning);
        }
        if try_direct && !session.is_direct_connected() && !session.direct_attempted() {
            self.transition(TransferState::AwaitingDirectConnection);
            debug!(session_id = self.session_id(), "waiting for direct connection");
            return Ok(());
        }
        if self.send_loop_active.swap(true, Ordering::AcqRel) {
            return Err(TransferError::AlreadyRunning);
        }
        self.mark_transferring(&session);
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("p2p-send-{}", self.session_id()))
            .spawn(move || this.run_send_loop())
            .map(|_| ())
            .map_err(|e| {
                self.send_loop_active.store(false, Ordering::Release);
                TransferError::Spawn(e)
            })
    }

    fn run_send_loop(self: Arc<Self>) {
        let result = self.send_all();
        self.send_loop_active.store(false, Ordering::Release);
        match result {
            Ok(true) => self.finish_sender(),
            Ok(false) => debug!(session_id = self.session_id(), "send loop stopped"),
            Err(reason) => self.abort(reason),
        }
    }

    /// Returns `Ok(false)` when stopped by an abort.
    fn send_all(&self) -> Result<bool, AbortReason> {
        let session = self.session().ok_or(AbortReason::SessionClosed)?;
        let Some(DataStream::Source { mut reader, length }) = lock(&self.stream).take() else {
            return Err(AbortReason::Stream("no source stream".into()));
        };
        let result = self.stream_source(&session, reader.as_mut(), length);
        if !self.close_stream {
            *lock(&self.stream) = Some(DataStream::Source { reader, length });
        }
        result
    }

    fn stream_source(&self, session: &MessageSession, reader: &mut (dyn Read + Send), length: u64) -> Result<bool, AbortReason> {
        let direct = session.is_direct_connected();
        let file_v1 = self.version == ProtocolVersion::V1 && self.setup.message_flag == V1Flags::FILE_DATA;
        if !direct && !file_v1 {
            session.send(self.preparation_message()).map_err(|_| AbortReason::SessionClosed)?;
        }

        let data_identifier = match self.version {
            ProtocolVersion::V1 => session.next_local_identifier(),
            ProtocolVersion::V2 => 0,
        };
        let mut buf = vec![0u8; self.chunk_size];
        let mut first = true;
        loop {
            if self.abort_requested.load(Ordering::Acquire) {
                return Ok(false);
            }
            let n = read_full(reader, &mut buf).map_err(|e| AbortReason::Stream(e.to_string()))?;
            if n == 0 {
                break;
            }
            let offset = self.position();
            let chunk = self.data_chunk(data_identifier, offset, length, &buf[..n], first);
            session.send(chunk).map_err(|_| AbortReason::SessionClosed)?;
            self.position.store(offset + n as u64, Ordering::Release);
            first = false;
            if self.version == ProtocolVersion::V2 && offset + (n as u64) < length {
                std::thread::sleep(self.pacing);
            }
        }
        let sent = self.position();
        if sent < length {
            return Err(AbortReason::ShortSource { expected: length, sent });
        }
        Ok(true)
    }

    fn preparation_message(&self) -> Message {
        let mut m = Message::new(self.version);
        let session_id = self.session_id();
        m.update_header(|h| {
            h.set_session_id(session_id);
            if let Header::V2(h) = h {
                h.tf_combination = TfCombination::FIRST;
            }
        });
        m.set_footer(self.setup.footer);
        m.set_payload(vec![0; PREPARATION_LEN]);
        m
    }

    fn data_tf(&self) -> TfCombination {
        if self.setup.message_flag.contains(V1Flags::FILE) {
            TfCombination::FILE_TRANSFER
        } else {
            TfCombination::MSN_OBJECT
        }
    }

    fn data_chunk(&self, identifier: u32, offset: u64, length: u64, bytes: &[u8], first: bool) -> Message {
        let mut m = Message::new(self.version);
        let session_id = self.session_id();
        let remaining = length.saturating_sub(offset + bytes.len() as u64);
        let flags = self.setup.message_flag;
        let tf = if first { self.data_tf() | TfCombination::FIRST } else { self.data_tf() };
        let package_number = self.package_number;
        m.update_header(|h| match h {
            Header::V1(h) => {
                h.session_id = session_id;
                h.identifier = identifier;
                h.offset = offset;
                h.total_size = length;
                h.flags = flags;
            }
            Header::V2(h) => {
                h.session_id = session_id;
                h.tf_combination = tf;
                h.package_number = package_number;
                h.data_remaining = remaining;
                if remaining == 0 {
                    h.operation_code = OperationCode::RAK;
                }
            }
        });
        m.set_footer(self.setup.footer);
        m.set_payload(bytes.to_vec());
        m
    }

    fn bye(&self, session: &MessageSession) -> Message {
        let slp = SlpMessage::bye(
            session.remote_account(),
            session.local_account(),
            self.setup.call_id,
            self.session_id(),
        );
        Message::signaling(self.version, slp)
    }

    fn finish_sender(&self) {
        let Some(session) = self.session() else { return };
        if self.version == ProtocolVersion::V2 {
            if let Err(e) = session.send(self.bye(&session)) {
                debug!(error = %e, "could not send bye");
            }
        }
        if self.transition(TransferState::Finished).is_none() {
            return;
        }
        info!(session_id = self.session_id(), bytes = self.position(), "transfer finished");
        self.close_stream();
        session.emit(SessionEvent::TransferFinished {
            session_id: self.session_id(),
        });
        session.remove_transfer(self.session_id());
    }

    /// Receive path: write one data chunk to the sink.
    pub fn on_message(&self, message: &Message) {
        if self.is_sender {
            debug!(session_id = self.session_id(), "data for a sending transfer ignored");
            return;
        }
        let Some(session) = self.session() else { return };
        if self.state().is_terminal() {
            return;
        }
        self.mark_transferring(&session);
        if self.is_preparation(message) {
            debug!(session_id = self.session_id(), "preparation message");
            return;
        }

        let written = {
            let mut stream = lock(&self.stream);
            match stream.as_mut() {
                Some(DataStream::Sink(sink)) => self.write_chunk(sink.as_mut(), message),
                _ => Err(io::Error::new(io::ErrorKind::NotConnected, "no sink")),
            }
        };
        if let Err(e) = written {
            if is_socket_error(&e) {
                session.close_direct_connection();
            }
            self.abort(AbortReason::Stream(e.to_string()));
            return;
        }

        let complete = match message.header() {
            Header::V1(h) => h.offset + u64::from(h.message_size) == h.total_size,
            Header::V2(h) => h.data_remaining == 0,
        };
        if complete {
            self.finish_receiver(&session, message);
        }
    }

    /// V1 chunks without the data flag are only the preparation message when they carry
    /// exactly its four zero bytes, ahead of any data.
    fn is_preparation(&self, message: &Message) -> bool {
        if message.is_data_chunk() {
            return false;
        }
        match message.header() {
            Header::V2(_) => true,
            Header::V1(h) => {
                h.total_size == PREPARATION_LEN as u64
                    && *message.payload() == [0; PREPARATION_LEN]
                    && self.position() == 0
                    && !self.preparation_seen.swap(true, Ordering::AcqRel)
            }
        }
    }

    fn write_chunk(&self, sink: &mut dyn DataSink, message: &Message) -> io::Result<()> {
        let payload = message.payload();
        match self.version {
            ProtocolVersion::V1 => {
                let offset = message.offset();
                sink.seek(SeekFrom::Start(offset))?;
                sink.write_all(payload)?;
                self.position.fetch_max(offset + payload.len() as u64, Ordering::AcqRel);
            }
            ProtocolVersion::V2 => {
                sink.write_all(payload)?;
                self.position.fetch_add(payload.len() as u64, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    fn finish_receiver(&self, session: &MessageSession, last: &Message) {
        if self.transition(TransferState::Finished).is_none() {
            return;
        }
        if let Err(e) = session.send(last.create_ack()) {
            debug!(error = %e, "could not acknowledge final chunk");
        }
        self.close_stream();
        info!(session_id = self.session_id(), bytes = self.position(), "transfer finished");
        session.emit(SessionEvent::TransferFinished {
            session_id: self.session_id(),
        });
        if let Err(e) = session.send(self.bye(session)) {
            debug!(error = %e, "could not send bye");
        }
        session.remove_transfer(self.session_id());
    }

    /// Stop the transfer. The send loop notices at the next chunk boundary.
    pub fn abort(&self, reason: AbortReason) {
        if self.transition(TransferState::Aborted).is_none() {
            return;
        }
        self.abort_requested.store(true, Ordering::Release);
        warn!(session_id = self.session_id(), ?reason, "transfer aborted");
        if let Some(session) = self.session() {
            session.emit(SessionEvent::TransferAborted {
                session_id: self.session_id(),
                reason,
            });
            session.remove_transfer(self.session_id());
        }
        self.close_stream();
    }

    fn close_stream(&self) {
        let mut stream = lock(&self.stream);
        if let Some(DataStream::Sink(sink)) = stream.as_mut() {
            if let Err(e) = sink.flush() {
                warn!(session_id = self.session_id(), error = %e, "flushing sink failed");
            }
        }
        if self.close_stream {
            stream.take();
        }
    }
}

fn read_full(reader: &mut (dyn Read + Send), buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Errors that mean the underlying socket is gone rather than the sink being unwritable.
fn is_socket_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}
