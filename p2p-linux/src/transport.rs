//! Direct transport: one TCP socket per candidate, length-prefixed frames in both directions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use p2p_core::{decode_frame, DirectConnector, FrameDecodeError, MessageSession, Transport, TransportError, TransportKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);
const READ_BUF: usize = 16 * 1024;

/// Outbound half of a direct socket. Frames are queued and written by a writer task.
pub struct TcpTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    up: AtomicBool,
    closed: watch::Sender<bool>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl TcpTransport {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            up: AtomicBool::new(true),
            closed: watch::Sender::new(false),
            rx: Mutex::new(Some(rx)),
        })
    }

    fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.rx.lock().ok()?.take()
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.up.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        self.tx.send(bytes).map_err(|_| TransportError::Disconnected)
    }

    fn is_connected(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    fn disconnect(&self) {
        self.up.store(false, Ordering::Release);
        self.closed.send_replace(true);
    }
}

/// Opens direct connections on the tokio runtime and reports back through the session callbacks.
pub struct TcpDirectConnector {
    handle: Handle,
}

impl TcpDirectConnector {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl DirectConnector for TcpDirectConnector {
    fn connect(&self, session: &Arc<MessageSession>, addr: SocketAddr) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = TcpTransport::new();
        let weak = Arc::downgrade(session);
        let t = transport.clone();
        self.handle.spawn(async move {
            let as_dyn: Arc<dyn Transport> = t.clone();
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    info!(%addr, "direct socket connected");
                    run_connection(stream, t, weak, false).await;
                }
                Ok(Err(e)) => {
                    warn!(%addr, error = %e, "direct connect failed");
                    report_failed(&weak, &as_dyn);
                }
                Err(_) => {
                    warn!(%addr, "direct connect timed out");
                    report_failed(&weak, &as_dyn);
                }
            }
        });
        Ok(transport)
    }

    fn listen(&self, session: &Arc<MessageSession>, addr: SocketAddr) -> Result<Arc<dyn Transport>, TransportError> {
        // Bind up front so the caller sees address errors immediately.
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let transport = TcpTransport::new();
        let weak = Arc::downgrade(session);
        let t = transport.clone();
        self.handle.spawn(async move {
            let as_dyn: Arc<dyn Transport> = t.clone();
            let listener = match TcpListener::from_std(std_listener) {
                Ok(l) => l,
                Err(e) => {
                    warn!(%addr, error = %e, "listener setup failed");
                    report_failed(&weak, &as_dyn);
                    return;
                }
            };
            info!(%addr, "listening for direct connection");
            match tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    info!(%peer, "direct socket accepted");
                    run_connection(stream, t, weak, true).await;
                }
                Ok(Err(e)) => {
                    warn!(%addr, error = %e, "accept failed");
                    report_failed(&weak, &as_dyn);
                }
                Err(_) => {
                    warn!(%addr, "no direct connection before timeout");
                    report_failed(&weak, &as_dyn);
                }
            }
        });
        Ok(transport)
    }
}

fn report_failed(session: &Weak<MessageSession>, transport: &Arc<dyn Transport>) {
    if let Some(session) = session.upgrade() {
        tokio::task::block_in_place(|| session.on_direct_failed(transport));
    }
}

/// Resolves once the transport is marked closed (or its sender is gone).
async fn closed_signal(rx: &mut watch::Receiver<bool>) {
    // The borrow guard is not Send; drop it before returning to the select.
    let _ = rx.wait_for(|c| *c).await;
}

/// Drive one connected socket: spawn the writer, tell the session, then feed frames in until EOF.
async fn run_connection(stream: TcpStream, transport: Arc<TcpTransport>, session: Weak<MessageSession>, listening: bool) {
    let as_dyn: Arc<dyn Transport> = transport.clone();
    let Some(mut outbound) = transport.take_outbound() else {
        return;
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let (mut reader, mut writer) = stream.into_split();

    let writer_transport = transport.clone();
    let mut writer_closed = transport.closed.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                next = outbound.recv() => {
                    let Some(bytes) = next else { break };
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!(error = %e, "direct write failed");
                        break;
                    }
                    let _ = writer.flush().await;
                }
                _ = closed_signal(&mut writer_closed) => break,
            }
        }
        writer_transport.up.store(false, Ordering::Release);
        let _ = writer.shutdown().await;
    });

    match session.upgrade() {
        Some(s) => tokio::task::block_in_place(|| s.on_direct_connected(&as_dyn, listening)),
        None => {
            transport.disconnect();
            return;
        }
    }

    let mut closed = transport.closed.subscribe();
    let mut buf: Vec<u8> = Vec::with_capacity(READ_BUF);
    let mut chunk = vec![0u8; READ_BUF];
    'read: loop {
        let n = tokio::select! {
            r = reader.read(&mut chunk) => match r {
                Ok(0) | Err(_) => break 'read,
                Ok(n) => n,
            },
            _ = closed_signal(&mut closed) => break 'read,
        };
        buf.extend_from_slice(&chunk[..n]);
        let Some(s) = session.upgrade() else { break };
        let mut consumed = 0;
        loop {
            match decode_frame(&buf[consumed..]) {
                Ok((frame, used)) => {
                    if let Err(e) = tokio::task::block_in_place(|| s.handle_direct_frame(&as_dyn, frame)) {
                        debug!(error = %e, "direct frame rejected");
                    }
                    consumed += used;
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(FrameDecodeError::TooLarge) => {
                    warn!("oversized direct frame, closing");
                    break 'read;
                }
            }
        }
        buf.drain(..consumed);
    }

    transport.disconnect();
    if let Some(s) = session.upgrade() {
        tokio::task::block_in_place(|| s.on_direct_disconnected(&as_dyn));
    }
    debug!("direct connection closed");
}
