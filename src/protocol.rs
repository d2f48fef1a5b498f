use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ErrorKind;

const LINE_ENDINGS: &[u8] = b"\r\n";

/// Largest accepted message body, in bytes. Anything larger is rejected
/// with an `invalid_argument` error before it reaches a conversation log.
pub const MAX_BODY_LEN: usize = 64 * 1024;

/// Largest accepted wire frame: the body cap plus room for the JSON
/// envelope around it. The reader enforces this while a line is still
/// accumulating, so a peer streaming one endless line is cut off at the
/// cap instead of growing the buffer without bound.
pub const MAX_FRAME_LEN: usize = MAX_BODY_LEN + 4 * 1024;

/// Frames sent by a client. A connection must open with `Join`; every
/// `Send` and `History` frame is answered in the order it was sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        display_name: String,
        conversation_id: String,
    },
    Send {
        body: String,
    },
    History,
    Leave,
}

/// Frames sent by the server. `MessageAdded` frames may interleave with
/// responses but always arrive in conversation order for one connection.
/// An `Error` frame answers the oldest outstanding request when one
/// exists; otherwise it reports a session-level failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Joined {
        session_id: u64,
        conversation_id: String,
    },
    MessageAdded {
        sequence: u64,
        sender_id: String,
        body: String,
    },
    SendAck {
        sequence: u64,
    },
    History {
        messages: Vec<String>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// Reads newline-delimited JSON frames off a connection.
///
/// The accumulation buffer lives in the struct, not in each call, so a
/// `read_frame` future dropped by `select!` loses nothing: bytes already
/// consumed off the socket stay in the buffer and the next call resumes
/// the same line. The underlying `read_until` only moves bytes into the
/// buffer in the same poll that consumes them from the reader.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Next frame on the connection, or `None` at end of stream. Skips
    /// blank lines. Fails with `InvalidData` on malformed JSON or when a
    /// line exceeds [`MAX_FRAME_LEN`] before its delimiter arrives.
    pub async fn read_frame<T>(&mut self) -> io::Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        loop {
            // Bounding each read keeps the cap enforceable mid-line: one
            // byte of headroom past the cap distinguishes "too long" from
            // "delimiter exactly at the cap".
            let headroom = (MAX_FRAME_LEN + 1).saturating_sub(self.buf.len());
            let mut limited = (&mut self.reader).take(headroom as u64);
            let bytes_read = limited.read_until(b'\n', &mut self.buf).await?;

            if self.buf.len() > MAX_FRAME_LEN {
                self.buf.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame exceeds {MAX_FRAME_LEN} bytes"),
                ));
            }
            if bytes_read == 0 {
                // End of stream; a partial line can never complete.
                self.buf.clear();
                return Ok(None);
            }
            if self.buf.last() != Some(&b'\n') {
                // The stream ended mid-line; the next pass observes it.
                continue;
            }

            let line = trim_line_endings(&self.buf);
            if line.is_empty() {
                self.buf.clear();
                continue;
            }

            let parsed = serde_json::from_slice(line).map_err(to_io_error);
            self.buf.clear();
            return parsed.map(Some);
        }
    }
}

fn trim_line_endings(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && LINE_ENDINGS.contains(&line[end - 1]) {
        end -= 1;
    }
    &line[..end]
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // Encode to JSON once, append a newline delimiter, and flush so peers
    // get timely updates.
    let mut encoded = serde_json::to_vec(frame).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
