// p2p-link: send or receive one file over a direct P2P connection.

mod config;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use p2p_core::apps::{InviteContext, FILE_TRANSFER_EUF_GUID};
use p2p_core::{
    AppRegistry, DataStream, Message, MessageHandler, MessageSession, ProtocolVersion, SessionEvent, TransferSetup,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::transport::TcpDirectConnector;

const FILE_TRANSFER_APP_ID: u32 = 2;
const CLOSE_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "p2p-link", version, about = "P2P file transfer over a direct connection")]
struct Cli {
    /// Log at debug level (RUST_LOG still wins when set).
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Config file instead of the standard locations.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a listening peer and send a file.
    Send {
        file: PathBuf,
        #[arg(long)]
        peer: SocketAddr,
        #[command(flatten)]
        common: TransferArgs,
    },
    /// Listen for a peer and write the received file.
    Receive {
        output: PathBuf,
        #[command(flatten)]
        common: TransferArgs,
    },
}

#[derive(Args)]
struct TransferArgs {
    /// Transfer session id; both sides must agree.
    #[arg(long, default_value_t = 1)]
    session_id: u32,
    /// Handshake nonce. The receiver prints one when omitted; the sender must pass it.
    #[arg(long)]
    nonce: Option<Uuid>,
    /// Use the V2 wire protocol regardless of config.
    #[arg(long)]
    v2: bool,
}

/// Logs signaling traffic that no transfer consumes.
struct LogHandler;

impl MessageHandler for LogHandler {
    fn handle_message(&self, session: &MessageSession, message: &Message) -> bool {
        match message.nested() {
            Some(slp) => info!(peer = session.remote_account(), line = slp.start_line(), "signaling"),
            None => debug!(identifier = message.identifier(), "signaling without body"),
        }
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cfg = config::load(cli.config.as_deref())?;
    let registry = AppRegistry::with_defaults();

    match cli.command {
        Command::Send { file, peer, common } => send(&cfg, &registry, file, peer, common).await,
        Command::Receive { output, common } => receive(&cfg, &registry, output, common).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_session(cfg: &NodeConfig, args: &TransferArgs) -> (Arc<MessageSession>, UnboundedReceiver<SessionEvent>) {
    let version = if args.v2 { ProtocolVersion::V2 } else { cfg.protocol };
    let (session, events) = MessageSession::new(version, &*cfg.local_account, &*cfg.remote_account, cfg.session.clone());
    session.set_connector(Arc::new(TcpDirectConnector::new(tokio::runtime::Handle::current())));
    session.register_handler(Arc::new(LogHandler));
    (session, events)
}

/// Transfer parameters for a plain file transfer, built the same way an accepted invitation would be.
fn file_transfer_setup(registry: &AppRegistry, session_id: u32) -> anyhow::Result<TransferSetup> {
    let entry = registry
        .lookup(FILE_TRANSFER_EUF_GUID, FILE_TRANSFER_APP_ID)
        .context("file transfer application not registered")?;
    let ctx = InviteContext {
        session_id,
        call_id: Uuid::new_v4(),
        app_id: FILE_TRANSFER_APP_ID,
    };
    Ok((entry.constructor)(&ctx))
}

async fn send(
    cfg: &NodeConfig,
    registry: &AppRegistry,
    file: PathBuf,
    peer: SocketAddr,
    args: TransferArgs,
) -> anyhow::Result<()> {
    let nonce = args.nonce.context("--nonce is required to send; use the one the receiver printed")?;
    let source = std::fs::File::open(&file).with_context(|| format!("opening {}", file.display()))?;
    let length = source.metadata()?.len();
    let (session, mut events) = open_session(cfg, &args);
    session.set_direct_nonce(nonce);

    let setup = file_transfer_setup(registry, args.session_id)?;
    let transfer = session.create_transfer(setup, DataStream::source(source, length))?;
    transfer.start_data_transfer(true)?;
    info!(file = %file.display(), bytes = length, %peer, "sending");
    session.create_direct_connection(peer)?;

    let outcome = tokio::select! {
        r = wait_for_transfer(&mut events, args.session_id) => r,
        r = shutdown_signal() => r.and_then(|()| Err(anyhow::anyhow!("interrupted"))),
    };
    if outcome.is_ok() {
        // Let queued frames drain until the receiver hangs up.
        let closed = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(event) = events.recv().await {
                if event == SessionEvent::DirectConnectionClosed {
                    break;
                }
            }
        })
        .await;
        if closed.is_err() {
            warn!("receiver did not close the connection");
        }
    }
    session.close();
    outcome
}

async fn receive(cfg: &NodeConfig, registry: &AppRegistry, output: PathBuf, args: TransferArgs) -> anyhow::Result<()> {
    let sink = std::fs::File::create(&output).with_context(|| format!("creating {}", output.display()))?;
    let (session, mut events) = open_session(cfg, &args);
    let nonce = args.nonce.unwrap_or_else(Uuid::new_v4);
    session.set_direct_nonce(nonce);
    println!("nonce: {nonce}");

    let setup = file_transfer_setup(registry, args.session_id)?;
    session.create_transfer(setup, DataStream::sink(sink))?.start_data_transfer(false)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    session.listen_for_direct_connection(addr)?;
    info!(output = %output.display(), %addr, "waiting for sender");

    let outcome = tokio::select! {
        r = wait_for_transfer(&mut events, args.session_id) => r,
        r = shutdown_signal() => r.and_then(|()| Err(anyhow::anyhow!("interrupted"))),
    };
    // Give the final ack and BYE a moment on the wire.
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.close();
    outcome
}

async fn wait_for_transfer(events: &mut UnboundedReceiver<SessionEvent>, session_id: u32) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        debug!(?event, "session event");
        match event {
            SessionEvent::TransferFinished { session_id: id } if id == session_id => {
                info!(session_id, "transfer complete");
                return Ok(());
            }
            SessionEvent::TransferAborted { session_id: id, reason } if id == session_id => {
                bail!("transfer aborted: {reason:?}");
            }
            SessionEvent::DirectConnectionFailed => bail!("direct connection failed"),
            SessionEvent::DirectConnectionEstablished => info!("direct connection established"),
            _ => {}
        }
    }
    bail!("session ended before the transfer finished")
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
