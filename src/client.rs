use std::{collections::VecDeque, net::SocketAddr};

use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{broadcast, mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::{
    cli::ClientArgs,
    error::ChatError,
    protocol::{ClientFrame, FrameReader, ServerFrame, write_frame},
    registry::validate_join_args,
};

/// How many events a facade may buffer for a subscriber that has not
/// caught up yet.
const EVENT_BUFFER: usize = 256;

/// Events a connected facade emits to its subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Emitted exactly once, after the join handshake completed.
    Connected,
    /// One accepted message, formatted as `"<sender>: <body>"`, in
    /// conversation order. Includes messages this session sent itself.
    MessageAdded(String),
}

enum Command {
    Send {
        body: String,
        respond_to: oneshot::Sender<Result<(), ChatError>>,
    },
    History {
        respond_to: oneshot::Sender<Result<Vec<String>, ChatError>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

enum Pending {
    Send(oneshot::Sender<Result<(), ChatError>>),
    History(oneshot::Sender<Result<Vec<String>, ChatError>>),
}

impl Pending {
    fn fail(self, err: ChatError) {
        match self {
            Pending::Send(respond_to) => {
                let _ = respond_to.send(Err(err));
            }
            Pending::History(respond_to) => {
                let _ = respond_to.send(Err(err));
            }
        }
    }
}

/// Participant-side facade over one connection session.
///
/// The facade owns no socket itself; an io task does, and the facade talks
/// to it over a command channel. Requests are answered by the server in
/// the order they were sent, so the io task keeps a FIFO of pending
/// requests and resolves the oldest one on each `send_ack`/`history`/
/// `error` frame. Once the io task is gone (disconnect, eviction, server
/// gone), every operation fails with [`ChatError::NotConnected`].
#[derive(Debug)]
pub struct ChatClient {
    display_name: String,
    conversation_id: String,
    command_tx: mpsc::Sender<Command>,
}

impl ChatClient {
    /// Validates the identity arguments, dials the server, and performs
    /// the join handshake. Validation happens before any connection
    /// attempt, so malformed input never touches the network.
    ///
    /// Returns the facade plus its event stream; the stream was
    /// subscribed before [`ClientEvent::Connected`] was emitted, so no
    /// event can be missed.
    pub async fn connect(
        display_name: &str,
        conversation_id: &str,
        server: SocketAddr,
    ) -> Result<(Self, broadcast::Receiver<ClientEvent>), ChatError> {
        validate_join_args(display_name, conversation_id)?;

        let stream = TcpStream::connect(server).await?;
        let (reader, mut writer) = stream.into_split();
        let mut frames = FrameReader::new(BufReader::new(reader));

        write_frame(
            &mut writer,
            &ClientFrame::Join {
                display_name: display_name.to_string(),
                conversation_id: conversation_id.to_string(),
            },
        )
        .await?;

        match frames.read_frame::<ServerFrame>().await? {
            Some(ServerFrame::Joined { session_id, .. }) => {
                debug!(session_id, "join handshake complete");
            }
            Some(ServerFrame::Error { kind, message }) => {
                return Err(ChatError::from_wire(kind, message));
            }
            Some(other) => {
                return Err(ChatError::Protocol(format!(
                    "expected a joined frame, got {other:?}"
                )));
            }
            None => {
                return Err(ChatError::Protocol(
                    "server closed the connection during the handshake".to_string(),
                ));
            }
        }

        let (event_tx, event_rx) = broadcast::channel(EVENT_BUFFER);
        let _ = event_tx.send(ClientEvent::Connected);

        let (command_tx, command_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(io_task(frames, writer, command_rx, event_tx));

        Ok((
            Self {
                display_name: display_name.to_string(),
                conversation_id: conversation_id.to_string(),
                command_tx,
            },
            event_rx,
        ))
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Sends one message body. Resolves with no value once the server has
    /// appended the message and enqueued delivery to this session.
    pub async fn send_message(&self, body: String) -> Result<(), ChatError> {
        let (respond_to, response) = oneshot::channel();
        self.command_tx
            .send(Command::Send { body, respond_to })
            .await
            .map_err(|_| ChatError::NotConnected)?;
        response.await.map_err(|_| ChatError::NotConnected)?
    }

    /// Full formatted history, oldest first, reflecting every message the
    /// server had accepted at the moment it handled the request.
    pub async fn get_messages(&self) -> Result<Vec<String>, ChatError> {
        let (respond_to, response) = oneshot::channel();
        self.command_tx
            .send(Command::History { respond_to })
            .await
            .map_err(|_| ChatError::NotConnected)?;
        response.await.map_err(|_| ChatError::NotConnected)?
    }

    /// Leaves the conversation and closes the connection. Idempotent; a
    /// second call is a no-op. Once this returns, no further events are
    /// emitted.
    pub async fn disconnect(&self) {
        let (done, confirmed) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Disconnect { done })
            .await
            .is_ok()
        {
            let _ = confirmed.await;
        }
    }
}

/// Owns the socket: multiplexes commands from the facade against frames
/// from the server until either side winds the session down. Outstanding
/// requests are failed with `NotConnected` on the way out. Partial frame
/// reads survive a lost `select!` race inside `frames`.
async fn io_task(
    mut frames: FrameReader<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    mut command_rx: mpsc::Receiver<Command>,
    event_tx: broadcast::Sender<ClientEvent>,
) {
    let mut pending: VecDeque<Pending> = VecDeque::new();

    loop {
        select! {
            command = command_rx.recv() => {
                match command {
                    Some(Command::Send { body, respond_to }) => {
                        if let Err(err) = write_frame(&mut writer, &ClientFrame::Send { body }).await {
                            let _ = respond_to.send(Err(err.into()));
                            break;
                        }
                        pending.push_back(Pending::Send(respond_to));
                    }
                    Some(Command::History { respond_to }) => {
                        if let Err(err) = write_frame(&mut writer, &ClientFrame::History).await {
                            let _ = respond_to.send(Err(err.into()));
                            break;
                        }
                        pending.push_back(Pending::History(respond_to));
                    }
                    Some(Command::Disconnect { done }) => {
                        let _ = write_frame(&mut writer, &ClientFrame::Leave).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        let _ = write_frame(&mut writer, &ClientFrame::Leave).await;
                        break;
                    }
                }
            }
            frame = frames.read_frame::<ServerFrame>() => {
                if !handle_server_frame(frame, &mut pending, &event_tx) {
                    break;
                }
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "could not shut the connection down cleanly");
    }
    for request in pending {
        request.fail(ChatError::NotConnected);
    }
}

/// Returns `false` when the session should wind down.
fn handle_server_frame(
    frame: io::Result<Option<ServerFrame>>,
    pending: &mut VecDeque<Pending>,
    event_tx: &broadcast::Sender<ClientEvent>,
) -> bool {
    let frame = match frame {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            debug!("server closed the connection");
            return false;
        }
        Err(err) => {
            warn!(error = ?err, "failed to read server frame");
            return false;
        }
    };

    match frame {
        ServerFrame::MessageAdded { sender_id, body, .. } => {
            let _ = event_tx.send(ClientEvent::MessageAdded(format!("{sender_id}: {body}")));
            true
        }
        ServerFrame::SendAck { .. } => match pending.pop_front() {
            Some(Pending::Send(respond_to)) => {
                let _ = respond_to.send(Ok(()));
                true
            }
            other => {
                warn!("send_ack did not match the oldest pending request");
                if let Some(request) = other {
                    request.fail(ChatError::Protocol("unexpected send_ack".to_string()));
                }
                false
            }
        },
        ServerFrame::History { messages } => match pending.pop_front() {
            Some(Pending::History(respond_to)) => {
                let _ = respond_to.send(Ok(messages));
                true
            }
            other => {
                warn!("history frame did not match the oldest pending request");
                if let Some(request) = other {
                    request.fail(ChatError::Protocol("unexpected history frame".to_string()));
                }
                false
            }
        },
        ServerFrame::Error { kind, message } => match pending.pop_front() {
            Some(request) => {
                request.fail(ChatError::from_wire(kind, message));
                true
            }
            // An error with no outstanding request is session-level: the
            // server evicted us or is rejecting the connection.
            None => {
                warn!(?kind, message, "session ended by the server");
                false
            }
        },
        ServerFrame::Joined { .. } => {
            warn!("joined frame received after the handshake");
            false
        }
    }
}

/// Interactive terminal client: multiplexes stdin lines against incoming
/// events. Plain lines are sent as message bodies; `/history` prints the
/// formatted history and `/quit` (or stdin EOF, or ctrl-c) leaves.
pub async fn run_terminal(args: ClientArgs) -> Result<()> {
    let (client, mut events) =
        ChatClient::connect(&args.name, &args.conversation, args.server).await?;

    // next_line keeps a half-typed line across a lost select! race.
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        select! {
            event = events.recv() => {
                if !handle_event(event, &client).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_input(line?, &client).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn handle_event(
    event: Result<ClientEvent, broadcast::error::RecvError>,
    client: &ChatClient,
) -> Result<bool> {
    match event {
        Ok(ClientEvent::Connected) => {
            write_stdout(&format!(
                "*** connected as {} in {}",
                client.display_name(),
                client.conversation_id()
            ))
            .await?;
            Ok(true)
        }
        Ok(ClientEvent::MessageAdded(line)) => {
            write_stdout(&line).await?;
            Ok(true)
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            write_stderr(&format!("!!! fell behind; {skipped} messages not shown")).await?;
            Ok(true)
        }
        Err(broadcast::error::RecvError::Closed) => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(line: Option<String>, client: &ChatClient) -> Result<bool> {
    let line = match line {
        Some(line) => line,
        None => return Ok(false),
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if text.eq_ignore_ascii_case("/history") {
        match client.get_messages().await {
            Ok(messages) => {
                for line in messages {
                    write_stdout(&line).await?;
                }
            }
            Err(err) => write_stderr(&format!("!!! {err}")).await?,
        }
        return Ok(true);
    }

    match client.send_message(text.to_string()).await {
        Ok(()) => Ok(true),
        Err(ChatError::NotConnected) => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            Ok(true)
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
