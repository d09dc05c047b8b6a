//! Tunnel frame codec.
//!
//! One physical stream carries every frame. Stream-scoped frames name the
//! logical request they belong to, so any number of requests and push
//! streams can be in flight at once.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 4;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 4;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 4;

/// How long either side waits for the other's HELLO
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Frame format: len:u32 | type:u8 | payload

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Request = 0x02,
    Response = 0x03,
    Event = 0x04,
    End = 0x05,
    Cancel = 0x06,
    Error = 0x07,
    Ping = 0x08,
    Fatal = 0x0E,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Request),
            0x03 => Some(Self::Response),
            0x04 => Some(Self::Event),
            0x05 => Some(Self::End),
            0x06 => Some(Self::Cancel),
            0x07 => Some(Self::Error),
            0x08 => Some(Self::Ping),
            0x0E => Some(Self::Fatal),
            _ => None,
        }
    }
}

// =============================================================================
// Hello Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HelloFlags: u32 {
        /// Agent serves watch streams
        const WATCH = 1 << 0;
        /// Agent has a standard root; its units are never shipped
        const STD_ROOT = 1 << 1;
    }
}

// =============================================================================
// Fatal Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FatalCode {
    VersionMismatch = 1,
    UnexpectedFrame = 2,
}

impl FatalCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::VersionMismatch),
            2 => Some(Self::UnexpectedFrame),
            _ => None,
        }
    }
}

/// Longest string a u16 length prefix can describe
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Largest body a RESPONSE or EVENT frame can carry (the stream id takes 4 bytes)
pub const MAX_STREAM_BODY: usize = MAX_FRAME_SIZE as usize - 4;

fn put_header(buf: &mut BytesMut, msg_type: MessageType, payload_len: usize) {
    // Saturate instead of wrapping; check_frame rejects the mismatch.
    buf.put_u32(u32::try_from(payload_len).unwrap_or(u32::MAX));
    buf.put_u8(msg_type as u8);
}

/// `s` cut to at most MAX_STRING_LEN bytes, on a char boundary.
fn wire_str(s: &str) -> &[u8] {
    if s.len() <= MAX_STRING_LEN {
        return s.as_bytes();
    }
    let mut end = MAX_STRING_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s.as_bytes()[..end]
}

fn put_string(buf: &mut BytesMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= MAX_STRING_LEN);
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} length truncated", what);
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!("{} truncated", what);
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .with_context(|| format!("Invalid UTF-8 in {}", what))
}

fn get_stream(payload: &mut Bytes, what: &str) -> Result<u32> {
    if payload.remaining() < 4 {
        anyhow::bail!("{} payload too short", what);
    }
    Ok(payload.get_u32())
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub flags: HelloFlags,
    pub agent: String,
}

impl Hello {
    pub fn new(flags: HelloFlags, agent: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags,
            agent: agent.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let agent_bytes = wire_str(&self.agent);
        let payload_len = 2 + 4 + 2 + agent_bytes.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);

        put_header(&mut buf, MessageType::Hello, payload_len);
        buf.put_u16(self.version);
        buf.put_u32(self.flags.bits());
        put_string(&mut buf, agent_bytes);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 6 {
            anyhow::bail!("Hello payload too short");
        }
        let version = payload.get_u16();
        let flags = HelloFlags::from_bits_truncate(payload.get_u32());
        let agent = get_string(&mut payload, "Hello agent name")?;

        Ok(Self {
            version,
            flags,
            agent,
        })
    }
}

// =============================================================================
// REQUEST (0x02)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub stream: u32,
    pub op: u8,
    pub body: Bytes,
}

impl Request {
    pub fn encode(&self) -> Bytes {
        let payload_len = 4 + 1 + self.body.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);

        put_header(&mut buf, MessageType::Request, payload_len);
        buf.put_u32(self.stream);
        buf.put_u8(self.op);
        buf.put_slice(&self.body);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 5 {
            anyhow::bail!("Request payload too short");
        }
        let stream = payload.get_u32();
        let op = payload.get_u8();
        Ok(Self {
            stream,
            op,
            body: payload,
        })
    }
}

// =============================================================================
// RESPONSE (0x03) / EVENT (0x04)
// =============================================================================

/// Body addressed to one stream. Used for RESPONSE and EVENT frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamData {
    pub stream: u32,
    pub body: Bytes,
}

impl StreamData {
    pub fn encode(&self, msg_type: MessageType) -> Bytes {
        debug_assert!(matches!(msg_type, MessageType::Response | MessageType::Event));
        let payload_len = 4 + self.body.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);

        put_header(&mut buf, msg_type, payload_len);
        buf.put_u32(self.stream);
        buf.put_slice(&self.body);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let stream = get_stream(&mut payload, "Stream data")?;
        Ok(Self {
            stream,
            body: payload,
        })
    }
}

// =============================================================================
// END (0x05) / CANCEL (0x06)
// =============================================================================

/// Encode a frame whose only payload is a stream id (END, CANCEL).
pub fn encode_stream_only(msg_type: MessageType, stream: u32) -> Bytes {
    debug_assert!(matches!(msg_type, MessageType::End | MessageType::Cancel));
    let mut buf = BytesMut::with_capacity(5 + 4);
    put_header(&mut buf, msg_type, 4);
    buf.put_u32(stream);
    buf.freeze()
}

// =============================================================================
// ERROR (0x07)
// =============================================================================

/// Request-level failure. The session stays up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub stream: u32,
    pub message: String,
}

impl StreamError {
    pub fn encode(&self) -> Bytes {
        let msg_bytes = wire_str(&self.message);
        let payload_len = 4 + 2 + msg_bytes.len();

        let mut buf = BytesMut::with_capacity(5 + payload_len);
        put_header(&mut buf, MessageType::Error, payload_len);
        buf.put_u32(self.stream);
        put_string(&mut buf, msg_bytes);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let stream = get_stream(&mut payload, "Error")?;
        let message = get_string(&mut payload, "Error message")?;
        Ok(Self { stream, message })
    }
}

// =============================================================================
// PING (0x08)
// =============================================================================

pub fn encode_ping() -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    put_header(&mut buf, MessageType::Ping, 0);
    buf.freeze()
}

// =============================================================================
// FATAL (0x0E)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fatal {
    pub code: u16,
    pub message: String,
}

impl Fatal {
    pub fn new(code: FatalCode, message: impl Into<String>) -> Self {
        Self {
            code: code as u16,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let msg_bytes = wire_str(&self.message);
        let payload_len = 2 + 2 + msg_bytes.len();

        let mut buf = BytesMut::with_capacity(5 + payload_len);
        put_header(&mut buf, MessageType::Fatal, payload_len);
        buf.put_u16(self.code);
        put_string(&mut buf, msg_bytes);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            anyhow::bail!("Fatal payload too short");
        }
        let code = payload.get_u16();
        let message = get_string(&mut payload, "Fatal message")?;

        Ok(Self { code, message })
    }
}

// =============================================================================
// Decoded frames
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    Request(Request),
    Response(StreamData),
    Event(StreamData),
    End { stream: u32 },
    Cancel { stream: u32 },
    Error(StreamError),
    Ping,
    Fatal(Fatal),
}

impl Frame {
    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> Result<Self> {
        Ok(match msg_type {
            MessageType::Hello => Frame::Hello(Hello::decode(payload)?),
            MessageType::Request => Frame::Request(Request::decode(payload)?),
            MessageType::Response => Frame::Response(StreamData::decode(payload)?),
            MessageType::Event => Frame::Event(StreamData::decode(payload)?),
            MessageType::End => Frame::End {
                stream: get_stream(&mut payload, "End")?,
            },
            MessageType::Cancel => Frame::Cancel {
                stream: get_stream(&mut payload, "Cancel")?,
            },
            MessageType::Error => Frame::Error(StreamError::decode(payload)?),
            MessageType::Ping => Frame::Ping,
            MessageType::Fatal => Frame::Fatal(Fatal::decode(payload)?),
        })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type)
        .with_context(|| format!("Unknown message type 0x{:02x}", msg_type))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Read and decode a single frame.
pub async fn read_decoded<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let (msg_type, payload) = read_frame(r).await?;
    Frame::decode(msg_type, payload)
}

/// Check that a pre-encoded frame's header matches its payload and that the
/// peer's `read_frame` will accept it.
pub fn check_frame(frame: &[u8]) -> Result<()> {
    if frame.len() < 5 {
        anyhow::bail!("Frame of {} bytes has no header", frame.len());
    }
    let payload_len = frame.len() - 5;
    if payload_len > MAX_FRAME_SIZE as usize {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            payload_len,
            MAX_FRAME_SIZE
        );
    }
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if declared as usize != payload_len {
        anyhow::bail!(
            "Frame header declares {} bytes but carries {}",
            declared,
            payload_len
        );
    }
    Ok(())
}

/// Write a pre-encoded frame to the stream. Nothing is written if the frame
/// fails [`check_frame`].
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    check_frame(frame)?;
    w.write_all(frame).await.context("Failed to write frame")?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Version is supported
    Supported(u16),
    /// Agent is older than this consumer
    TooOld { agent: u16, min_supported: u16 },
    /// Agent is newer than this consumer
    TooNew { agent: u16, max_supported: u16 },
}

/// Check if an agent's protocol version is supported.
pub fn negotiate_version(agent_version: u16) -> VersionNegotiationResult {
    if agent_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            agent: agent_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if agent_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            agent: agent_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(agent_version)
    }
}

/// Human-readable upgrade hint for a failed negotiation.
pub fn mismatch_message(result: VersionNegotiationResult) -> Option<String> {
    match result {
        VersionNegotiationResult::Supported(_) => None,
        VersionNegotiationResult::TooOld {
            agent,
            min_supported,
        } => Some(format!(
            "agent speaks protocol {} but this consumer needs at least {}; upgrade the agent",
            agent, min_supported
        )),
        VersionNegotiationResult::TooNew {
            agent,
            max_supported,
        } => Some(format!(
            "agent speaks protocol {} but this consumer supports at most {}; upgrade the consumer",
            agent, max_supported
        )),
    }
}

// =============================================================================
// Tests
// =============================================================================
