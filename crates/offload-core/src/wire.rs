//! Offload wire format: the admission protocol spoken between an edge device
//! (ED) and the edge-compute broker (EC).
//!
//! Control messages are colon-delimited text (`REQ:7:resnet_50:PI5`). On the
//! stream every control message is carried in a frame:
//!
//! ```text
//! u32 big-endian length || UTF-8 text
//! ```
//!
//! The task payload that follows an `OK` is a single frame:
//!
//! ```text
//! u64 big-endian length || raw bytes
//! ```
//!
//! End-of-payload is therefore explicit; the stream is never half-closed.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Maximum size of a control frame body in bytes.
pub const MAX_CONTROL_FRAME: usize = 256;

/// Default upper bound on a task payload (64 MiB).
pub const DEFAULT_MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Default broker port.
pub const DEFAULT_PORT: u16 = 5000;

// ── Messages ──────────────────────────────────────────────────────────────────

/// One control message of the admission protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// client → broker: offload request.
    Req {
        task_id: u64,
        model: String,
        device: String,
    },
    /// broker → client: admitted at queue position `token`.
    Grant { token: u64 },
    /// broker → client: rejected, run it yourself.
    Drop,
    /// client → broker: grant acknowledged, payload frame follows.
    Ok { token: u64, task_id: u64 },
    /// broker → client: inference finished.
    Done,
}

impl Message {
    /// Protocol tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Req { .. } => "REQ",
            Message::Grant { .. } => "GRANT",
            Message::Drop => "DROP",
            Message::Ok { .. } => "OK",
            Message::Done => "DONE",
        }
    }

    /// Validate and render the text form.
    pub fn encode(&self) -> Result<String, WireError> {
        if let Message::Req { model, device, .. } = self {
            check_field("model", model)?;
            check_field("device", device)?;
        }
        Ok(self.to_string())
    }

    /// Parse the text form. Unknown tags and wrong arity are errors.
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let parts: Vec<&str> = text.split(':').collect();
        let malformed = || WireError::Malformed(text.to_string());

        match parts.as_slice() {
            ["REQ", id, model, device] => {
                if model.is_empty() || device.is_empty() {
                    return Err(malformed());
                }
                Ok(Message::Req {
                    task_id: id.parse().map_err(|_| malformed())?,
                    model: (*model).to_string(),
                    device: (*device).to_string(),
                })
            }
            ["GRANT", token] => Ok(Message::Grant {
                token: token.parse().map_err(|_| malformed())?,
            }),
            ["DROP"] => Ok(Message::Drop),
            ["OK", token, id] => Ok(Message::Ok {
                token: token.parse().map_err(|_| malformed())?,
                task_id: id.parse().map_err(|_| malformed())?,
            }),
            ["DONE"] => Ok(Message::Done),
            _ => Err(malformed()),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Req {
                task_id,
                model,
                device,
            } => write!(f, "REQ:{task_id}:{model}:{device}"),
            Message::Grant { token } => write!(f, "GRANT:{token}"),
            Message::Drop => f.write_str("DROP"),
            Message::Ok { token, task_id } => write!(f, "OK:{token}:{task_id}"),
            Message::Done => f.write_str("DONE"),
        }
    }
}

fn check_field(field: &'static str, value: &str) -> Result<(), WireError> {
    if value.is_empty() || value.contains(':') || value.contains('\n') {
        return Err(WireError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Write one control frame and flush.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let text = msg.encode()?;
    if text.len() > MAX_CONTROL_FRAME {
        return Err(WireError::FrameTooLarge(text.len()));
    }
    writer.write_u32(text.len() as u32).await?;
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one control frame. A clean EOF before the length prefix is `Closed`.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await.map_err(from_read)? as usize;
    if len > MAX_CONTROL_FRAME {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(from_read)?;
    let text = String::from_utf8(buf)?;
    Message::parse(&text)
}

/// Write the payload frame and flush.
pub async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u64(payload.len() as u64).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the payload frame. The length is checked before anything is allocated.
pub async fn read_payload<R>(reader: &mut R, max_len: u64) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u64().await.map_err(from_read)?;
    if len > max_len {
        return Err(WireError::PayloadTooLarge { len, max: max_len });
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(from_read)?;
    Ok(buf)
}

fn from_read(e: std::io::Error) -> WireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::Closed
    } else {
        WireError::Io(e)
    }
}

// ── Local worker lines ────────────────────────────────────────────────────────

/// Job line fed to a local inference worker: `<task_id>:<payload_ref>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLine {
    pub task_id: u64,
    pub payload_ref: String,
}

impl JobLine {
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (id, payload_ref) = line
            .split_once(':')
            .ok_or_else(|| WireError::Malformed(line.to_string()))?;
        Ok(Self {
            task_id: id
                .parse()
                .map_err(|_| WireError::Malformed(line.to_string()))?,
            payload_ref: payload_ref.to_string(),
        })
    }
}

impl fmt::Display for JobLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task_id, self.payload_ref)
    }
}

/// Completion notification record: `<task_id>,<infer_time_ms>,<completion_epoch_ms>`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionLine {
    pub task_id: u64,
    /// Pure model inference time in milliseconds.
    pub infer_ms: f64,
    /// Unix ms at which the worker finished the task.
    pub completed_at_ms: u64,
}

impl CompletionLine {
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let line = line.trim();
        let malformed = || WireError::Malformed(line.to_string());

        let mut fields = line.split(',');
        let (Some(id), Some(infer), Some(done), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed());
        };

        let infer_ms: f64 = infer.trim().parse().map_err(|_| malformed())?;
        if !infer_ms.is_finite() || infer_ms < 0.0 {
            return Err(malformed());
        }

        Ok(Self {
            task_id: id.trim().parse().map_err(|_| malformed())?,
            infer_ms,
            completed_at_ms: done.trim().parse().map_err(|_| malformed())?,
        })
    }
}

impl fmt::Display for CompletionLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{:.2},{}",
            self.task_id, self.infer_ms, self.completed_at_ms
        )
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when reading or writing protocol data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: {0:?}")]
    Malformed(String),

    #[error("invalid {field} field: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("control frame of {0} bytes exceeds maximum {MAX_CONTROL_FRAME}")]
    FrameTooLarge(usize),

    #[error("payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: u64, max: u64 },

    #[error("control frame is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
