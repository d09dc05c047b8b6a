//! Request multiplexing over one physical stream.
//!
//! A single writer task owns the write half; everything else hands it
//! pre-encoded frames through a [`FrameSink`]. The consumer allocates odd
//! stream ids and keeps a table of pending calls and push streams; the agent
//! runs each request on its own task with its own cancellation token.

use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ops::OpCode;
use super::protocol::{self, Frame, MessageType, StreamData, StreamError};
use super::router::{CallContext, Reply, Router};
use crate::error::{Result, TunnelError};

/// Frames queued for the writer task.
pub type FrameSink = mpsc::Sender<Bytes>;

/// Frames buffered before senders wait on the writer
const FRAME_QUEUE: usize = 256;

/// Spawn the task that owns `writer`. It exits when `closed` fires, when
/// every sink is dropped, or on the first write failure (which also fires
/// `closed`). Frames failing [`protocol::check_frame`] are logged and skipped.
pub fn spawn_writer<W>(mut writer: W, closed: CancellationToken) -> (FrameSink, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(FRAME_QUEUE);
    let handle = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = closed.cancelled() => break,
            };
            // A malformed frame is dropped; the session survives it.
            if let Err(e) = protocol::check_frame(&frame) {
                tracing::error!("Dropping unsendable frame: {:#}", e);
                continue;
            }
            let written = async {
                protocol::write_frame(&mut writer, &frame).await?;
                writer.flush().await?;
                anyhow::Ok(())
            };
            if let Err(e) = written.await {
                tracing::debug!("Frame write failed: {:#}", e);
                closed.cancel();
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
    (tx, handle)
}

fn transport_error(err: anyhow::Error) -> io::Error {
    match err.downcast::<io::Error>() {
        Ok(io_err) => io_err,
        Err(other) => io::Error::new(io::ErrorKind::InvalidData, format!("{:#}", other)),
    }
}

// =============================================================================
// Consumer side
// =============================================================================

enum Pending {
    Call(oneshot::Sender<Result<Bytes>>),
    Stream(mpsc::UnboundedSender<Result<Bytes>>),
}

impl Pending {
    fn fail(self, err: TunnelError) {
        match self {
            Pending::Call(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Stream(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u32, Pending>,
    shut: bool,
}

struct Shared {
    sink: FrameSink,
    table: Mutex<PendingTable>,
    closed: CancellationToken,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(&self, stream: u32) -> Option<Pending> {
        self.table().entries.remove(&stream)
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Response(StreamData { stream, body }) => match self.take(stream) {
                Some(Pending::Call(tx)) => {
                    let _ = tx.send(Ok(body));
                }
                Some(stream_entry) => stream_entry.fail(TunnelError::Protocol(format!(
                    "response on push stream {}",
                    stream
                ))),
                None => tracing::debug!("Dropping response for abandoned stream {}", stream),
            },
            Frame::Event(StreamData { stream, body }) => {
                let mut table = self.table();
                match table.entries.get(&stream) {
                    Some(Pending::Stream(tx)) => {
                        let _ = tx.send(Ok(body));
                    }
                    Some(Pending::Call(_)) => {
                        if let Some(call) = table.entries.remove(&stream) {
                            call.fail(TunnelError::Protocol(format!(
                                "event on request stream {}",
                                stream
                            )));
                        }
                    }
                    None => tracing::debug!("Dropping event for abandoned stream {}", stream),
                }
            }
            Frame::End { stream } => match self.take(stream) {
                // Dropping the sender ends the consumer's stream.
                Some(Pending::Stream(_)) | None => {}
                Some(call) => call.fail(TunnelError::Protocol(format!(
                    "stream {} ended without a response",
                    stream
                ))),
            },
            Frame::Error(StreamError { stream, message }) => {
                if let Some(entry) = self.take(stream) {
                    entry.fail(TunnelError::Remote(message));
                }
            }
            Frame::Ping => tracing::trace!("Ping"),
            other => tracing::warn!("Ignoring unexpected frame from agent: {:?}", other),
        }
    }

    /// Fail everything in flight and refuse new registrations.
    fn shutdown(&self, reason: &io::Error) {
        self.closed.cancel();
        let drained: Vec<Pending> = {
            let mut table = self.table();
            table.shut = true;
            table.entries.drain().map(|(_, p)| p).collect()
        };
        if !drained.is_empty() {
            tracing::debug!("Failing {} in-flight requests: {}", drained.len(), reason);
        }
        for entry in drained {
            entry.fail(TunnelError::Transport(io::Error::new(
                reason.kind(),
                reason.to_string(),
            )));
        }
    }
}

/// Removes a pending entry on drop. If the entry was still pending the
/// request was abandoned, so the agent is told to stop working on it.
struct PendingGuard {
    shared: Arc<Shared>,
    stream: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.shared.take(self.stream).is_none() || self.shared.closed.is_cancelled() {
            return;
        }
        let cancel = protocol::encode_stream_only(MessageType::Cancel, self.stream);
        if self.shared.sink.try_send(cancel).is_err() {
            tracing::debug!("Could not queue cancel for stream {}", self.stream);
        }
    }
}

/// Consumer end of a session.
pub struct MuxClient {
    shared: Arc<Shared>,
    next_stream: AtomicU32,
}

impl MuxClient {
    /// Take over both halves of a handshaken stream.
    pub fn start<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let closed = CancellationToken::new();
        let (sink, _writer) = spawn_writer(writer, closed.clone());
        let shared = Arc::new(Shared {
            sink,
            table: Mutex::new(PendingTable::default()),
            closed,
        });
        tokio::spawn(read_loop(reader, shared.clone()));

        Self {
            shared,
            next_stream: AtomicU32::new(1),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the session is gone.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Tear the session down, failing everything in flight.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    fn register(&self, pending: Pending) -> Result<PendingGuard> {
        let stream = self.next_stream.fetch_add(2, Ordering::Relaxed);
        let mut table = self.shared.table();
        if table.shut {
            return Err(TunnelError::Closed);
        }
        table.entries.insert(stream, pending);
        Ok(PendingGuard {
            shared: self.shared.clone(),
            stream,
        })
    }

    async fn send_request(&self, stream: u32, op: OpCode, body: Bytes) -> Result<()> {
        let frame = protocol::Request {
            stream,
            op: op as u8,
            body,
        }
        .encode();
        self.shared
            .sink
            .send(frame)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Issue one request and wait for its response body.
    pub async fn call(&self, op: OpCode, body: Bytes, cancel: &CancellationToken) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        let guard = self.register(Pending::Call(tx))?;
        self.send_request(guard.stream, op, body).await?;

        tokio::select! {
            result = rx => result.unwrap_or(Err(TunnelError::Closed)),
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        }
    }

    /// Open a long-lived push stream.
    pub async fn open_stream(&self, op: OpCode, body: Bytes) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.register(Pending::Stream(tx))?;
        self.send_request(guard.stream, op, body).await?;
        Ok(EventStream { rx, guard })
    }
}

impl Drop for MuxClient {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<Shared>) {
    let reason = loop {
        let frame = tokio::select! {
            frame = protocol::read_decoded(&mut reader) => frame,
            _ = shared.closed.cancelled() => {
                break io::Error::new(io::ErrorKind::ConnectionAborted, "session closed");
            }
        };
        match frame {
            Ok(frame) => shared.dispatch(frame),
            Err(e) => break transport_error(e),
        }
    };
    shared.shutdown(&reason);
}

/// Events pushed on one stream. Dropping it cancels the stream.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
    guard: PendingGuard,
}

impl EventStream {
    pub fn stream_id(&self) -> u32 {
        self.guard.stream
    }
}

impl Stream for EventStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// =============================================================================
// Agent side
// =============================================================================

type ActiveTable = Arc<Mutex<HashMap<u32, CancellationToken>>>;

fn lock_active(active: &ActiveTable) -> MutexGuard<'_, HashMap<u32, CancellationToken>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serve requests read from `reader` until the stream fails or `session` is
/// cancelled. Each request runs on its own task under a child of `session`.
pub async fn serve<R>(
    mut reader: R,
    sink: FrameSink,
    router: Arc<Router>,
    session: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let active: ActiveTable = Arc::default();

    loop {
        let frame = tokio::select! {
            frame = protocol::read_decoded(&mut reader) => frame?,
            _ = session.cancelled() => return Ok(()),
        };

        match frame {
            Frame::Request(req) => {
                let token = session.child_token();
                lock_active(&active).insert(req.stream, token.clone());
                tokio::spawn(run_request(
                    req,
                    token,
                    sink.clone(),
                    router.clone(),
                    active.clone(),
                ));
            }
            Frame::Cancel { stream } => {
                if let Some(token) = lock_active(&active).remove(&stream) {
                    tracing::debug!("Consumer cancelled stream {}", stream);
                    token.cancel();
                }
            }
            Frame::Ping => tracing::trace!("Ping"),
            Frame::Fatal(fatal) => return Err(TunnelError::Fatal(fatal.message)),
            other => tracing::warn!("Ignoring unexpected frame from consumer: {:?}", other),
        }
    }
}

async fn run_request(
    req: protocol::Request,
    cancel: CancellationToken,
    sink: FrameSink,
    router: Arc<Router>,
    active: ActiveTable,
) {
    let stream = req.stream;
    let ctx = CallContext::new(stream, cancel.clone(), sink.clone());

    let outcome = tokio::select! {
        outcome = router.dispatch(req.op, &req.body, ctx) => Some(outcome),
        _ = cancel.cancelled() => None,
    };
    lock_active(&active).remove(&stream);

    let frame = match outcome {
        // Abandoned by the consumer, or the session is going away.
        None => return,
        Some(Ok(Reply::Body(body))) if body.len() > protocol::MAX_STREAM_BODY => {
            let message = format!(
                "response of {} bytes exceeds the {}-byte frame limit",
                body.len(),
                protocol::MAX_STREAM_BODY
            );
            tracing::warn!(stream, "Request failed: {}", message);
            StreamError { stream, message }.encode()
        }
        Some(Ok(Reply::Body(body))) => StreamData { stream, body }.encode(MessageType::Response),
        Some(Ok(Reply::Finished)) => protocol::encode_stream_only(MessageType::End, stream),
        Some(Err(message)) => {
            tracing::warn!(stream, "Request failed: {}", message);
            StreamError { stream, message }.encode()
        }
    };
    if sink.send(frame).await.is_err() {
        tracing::debug!("Session closed before stream {} was answered", stream);
    }
}
