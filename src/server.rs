use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    error::ErrorKind,
    protocol::{ClientFrame, FrameReader, ServerFrame, write_frame},
    registry::ConversationRegistry,
    session::SessionHandle,
};

pub struct ChatServer {
    listener: TcpListener,
    registry: Arc<ConversationRegistry>,
}

impl ChatServer {
    /// Server with a fresh in-memory registry.
    pub fn new(listener: TcpListener) -> Self {
        Self::with_registry(listener, Arc::new(ConversationRegistry::in_memory()))
    }

    /// Server over an externally owned registry, so callers can share one
    /// registry between instances or inspect it from tests.
    pub fn with_registry(listener: TcpListener, registry: Arc<ConversationRegistry>) -> Self {
        Self { listener, registry }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` completes. Connection tasks
    /// already running finish on their own; shutdown only stops accepting.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<ConversationRegistry>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, registry),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<ConversationRegistry>,
) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, registry).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, registry: Arc<ConversationRegistry>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut frames = FrameReader::new(BufReader::new(reader));
    let mut writer = writer;

    let mut session = perform_join(&registry, &mut frames, &mut writer).await?;
    info!(
        ?peer,
        participant = session.participant(),
        conversation = session.conversation_id(),
        "participant connected"
    );

    let outcome = run_session(&mut session, &mut frames, &mut writer).await;
    session.leave().await;
    info!(?peer, participant = session.participant(), "participant disconnected");

    outcome
}

/// Reads the opening frame, which must be a join, and registers the
/// session. Rejections are reported to the client with an error frame
/// before the connection is dropped.
async fn perform_join<R, W>(
    registry: &ConversationRegistry,
    frames: &mut FrameReader<R>,
    writer: &mut W,
) -> Result<SessionHandle>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = match frames.read_frame::<ClientFrame>().await? {
        Some(frame) => frame,
        None => anyhow::bail!("connection closed before join"),
    };

    let (display_name, conversation_id) = match frame {
        ClientFrame::Join {
            display_name,
            conversation_id,
        } => (display_name, conversation_id),
        other => {
            reject(writer, ErrorKind::Protocol, "expected a join frame first").await?;
            anyhow::bail!("expected a join frame first, got {other:?}");
        }
    };

    let session = match registry.join(&conversation_id, &display_name).await {
        Ok(session) => session,
        Err(err) => {
            reject(writer, err.wire_kind(), &err.to_string()).await?;
            return Err(err.into());
        }
    };

    write_frame(
        writer,
        &ServerFrame::Joined {
            session_id: session.session_id(),
            conversation_id,
        },
    )
    .await?;

    Ok(session)
}

/// Multiplexes inbound frames and outbound deliveries until the client
/// leaves, the connection drops, or the session is evicted. Frame reads
/// hold their partial progress inside `frames`, so a delivery winning the
/// race never loses bytes of a half-read client frame.
async fn run_session<R, W>(
    session: &mut SessionHandle,
    frames: &mut FrameReader<R>,
    writer: &mut W,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    loop {
        select! {
            client_frame = frames.read_frame::<ClientFrame>() => {
                if !handle_client_frame(client_frame, session, writer).await? {
                    break;
                }
            }
            delivery = session.next_delivery() => {
                match delivery {
                    Some(message) => {
                        write_frame(writer, &ServerFrame::MessageAdded {
                            sequence: message.sequence,
                            sender_id: message.sender_id.clone(),
                            body: message.body.clone(),
                        })
                        .await?;
                    }
                    // The channel only closes mid-session when the router
                    // evicted us for falling behind.
                    None => {
                        let _ = reject(
                            writer,
                            ErrorKind::NotConnected,
                            "session evicted: deliveries were not consumed",
                        )
                        .await;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Returns `Ok(false)` when the session should wind down.
async fn handle_client_frame<W>(
    frame: std::io::Result<Option<ClientFrame>>,
    session: &SessionHandle,
    writer: &mut W,
) -> Result<bool>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = match frame {
        Ok(frame) => frame,
        Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
            reject(writer, ErrorKind::Protocol, "malformed frame").await?;
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    };

    match frame {
        Some(ClientFrame::Send { body }) => {
            match session.send(body).await {
                Ok(message) => {
                    write_frame(writer, &ServerFrame::SendAck { sequence: message.sequence })
                        .await?;
                }
                Err(err) => {
                    warn!(participant = session.participant(), error = %err, "send rejected");
                    reject(writer, err.wire_kind(), &err.to_string()).await?;
                }
            }
            Ok(true)
        }
        Some(ClientFrame::History) => {
            match session.history().await {
                Ok(messages) => write_frame(writer, &ServerFrame::History { messages }).await?,
                Err(err) => reject(writer, err.wire_kind(), &err.to_string()).await?,
            }
            Ok(true)
        }
        Some(ClientFrame::Join { .. }) => {
            reject(writer, ErrorKind::Protocol, "already joined").await?;
            Ok(false)
        }
        Some(ClientFrame::Leave) | None => Ok(false),
    }
}

async fn reject<W>(writer: &mut W, kind: ErrorKind, message: &str) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    write_frame(
        writer,
        &ServerFrame::Error {
            kind,
            message: message.to_string(),
        },
    )
    .await
}
