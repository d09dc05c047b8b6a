//! Consumer end of the tunnel: handshake, typed calls, and the session owner.

use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::mux::{EventStream, MuxClient};
use super::ops::{decode_body, encode_body, ErrorReport, OpCode, Operation, WatchRequest};
use super::protocol::{
    self, Fatal, FatalCode, Frame, Hello, HelloFlags, HANDSHAKE_TIMEOUT, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN,
};
use crate::error::{Result, TunnelError};
use crate::sync::{FetchRequest, FetchResponse};
use crate::watcher::WaitOutcome;

/// Name the consumer announces in its HELLO echo
const CONSUMER_NAME: &str = "srctunnel-consumer";

/// Run the consumer half of the handshake on a freshly accepted stream.
///
/// The agent speaks first. On a version mismatch the agent is sent a FATAL
/// frame explaining which side to upgrade and no session is created.
pub async fn accept<S>(stream: S) -> Result<TunnelClient>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    accept_within(stream, HANDSHAKE_TIMEOUT).await
}

/// [`accept`] with an explicit deadline for the whole handshake. A peer that
/// stays silent past it fails with a timed-out transport error.
pub async fn accept_within<S>(stream: S, timeout: Duration) -> Result<TunnelClient>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let hello = tokio::time::timeout(timeout, handshake(&mut reader, &mut writer))
        .await
        .map_err(|_| {
            TunnelError::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no HELLO within {:?}", timeout),
            ))
        })??;

    tracing::info!(
        agent = %hello.agent,
        version = hello.version,
        flags = ?hello.flags,
        "Agent attached"
    );
    Ok(TunnelClient {
        mux: MuxClient::start(reader, writer),
        agent: hello,
    })
}

async fn handshake<R, W>(reader: &mut R, writer: &mut W) -> Result<Hello>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = match protocol::read_decoded(reader).await? {
        Frame::Hello(hello) => hello,
        other => {
            let message = format!("expected HELLO, got {:?}", other);
            let fatal = Fatal::new(FatalCode::UnexpectedFrame, message.clone());
            protocol::write_frame(writer, &fatal.encode()).await?;
            writer.flush().await?;
            return Err(TunnelError::Protocol(message));
        }
    };

    if let Some(message) = protocol::mismatch_message(protocol::negotiate_version(hello.version)) {
        tracing::error!(agent = %hello.agent, "Rejecting agent: {}", message);
        let fatal = Fatal::new(FatalCode::VersionMismatch, message);
        protocol::write_frame(writer, &fatal.encode()).await?;
        writer.flush().await?;
        return Err(TunnelError::VersionMismatch {
            remote: hello.version,
            min: PROTOCOL_VERSION_MIN,
            max: PROTOCOL_VERSION_MAX,
        });
    }

    let echo = Hello {
        version: hello.version,
        flags: HelloFlags::empty(),
        agent: CONSUMER_NAME.to_string(),
    };
    protocol::write_frame(writer, &echo.encode()).await?;
    writer.flush().await?;
    Ok(hello)
}

/// Typed operations over one session.
pub struct TunnelClient {
    mux: MuxClient,
    agent: Hello,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

impl TunnelClient {
    /// The agent's HELLO.
    pub fn agent(&self) -> &Hello {
        &self.agent
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    pub async fn closed(&self) {
        self.mux.closed().await
    }

    pub fn close(&self) {
        self.mux.close()
    }

    async fn request<T: DeserializeOwned>(
        &self,
        operation: &Operation,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let op = operation.op();
        let body = operation.encode_body()?;
        let reply = self.mux.call(op, body, cancel).await?;
        self.decode(op, &reply, cancel).await
    }

    /// Decode a response body. A body that does not decode means the two
    /// sides disagree about the protocol, so the agent is told before failing.
    async fn decode<T: DeserializeOwned>(
        &self,
        op: OpCode,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<T> {
        match decode_body(body) {
            Ok(value) => Ok(value),
            Err(e) => {
                let message = format!("malformed {} response: {:#}", op, e);
                tracing::error!("{}", message);
                if let Err(report_err) = self.report_error(&message, cancel).await {
                    tracing::warn!("Could not report protocol error: {}", report_err);
                }
                Err(TunnelError::Protocol(message))
            }
        }
    }

    pub async fn version(&self, cancel: &CancellationToken) -> Result<u16> {
        self.request(&Operation::Version, cancel).await
    }

    /// Tell the agent about a protocol violation. The agent exits non-zero
    /// once the session closes.
    pub async fn report_error(&self, message: &str, cancel: &CancellationToken) -> Result<()> {
        let body = encode_body(&ErrorReport {
            message: message.to_string(),
        })?;
        self.mux.call(OpCode::ReportError, body, cancel).await?;
        Ok(())
    }

    pub async fn list_units(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.request(&Operation::ListUnits, cancel).await
    }

    pub async fn fetch(
        &self,
        request: FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse> {
        self.request(&Operation::Fetch(request), cancel).await
    }

    /// Open a watch stream; one event arrives per debounce window.
    pub async fn watch(&self, request: WatchRequest) -> Result<WatchStream> {
        let body = Operation::Watch(request).encode_body()?;
        let events = self.mux.open_stream(OpCode::Watch, body).await?;
        Ok(WatchStream { events })
    }
}

/// Change notifications for one unit's closure. Dropping it stops the watch
/// on the agent.
pub struct WatchStream {
    events: EventStream,
}

impl WatchStream {
    /// Wait for the next change. Cancelling is not an error.
    pub async fn next_change(&mut self, cancel: &CancellationToken) -> Result<WaitOutcome> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(WaitOutcome::Cancelled),
            event = self.events.next() => match event {
                Some(Ok(_)) => Ok(WaitOutcome::Changed),
                Some(Err(e)) => Err(e),
                None => Err(TunnelError::Closed),
            },
        }
    }
}

/// Holds the current session; swapped on every reconnect.
#[derive(Default)]
pub struct SessionOwner {
    current: Mutex<Option<Arc<TunnelClient>>>,
    changed: Notify,
}

impl SessionOwner {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<TunnelClient>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `client` current, closing whatever it replaces.
    pub fn install(&self, client: Arc<TunnelClient>) {
        let previous = self.slot().replace(client);
        if let Some(previous) = previous {
            tracing::debug!("Replacing session from agent {}", previous.agent().agent);
            previous.close();
        }
        self.changed.notify_waiters();
    }

    /// The current live session, if any.
    pub fn current(&self) -> Option<Arc<TunnelClient>> {
        self.slot().as_ref().filter(|c| !c.is_closed()).cloned()
    }

    /// Forget `client` if it is still current.
    pub fn clear_if(&self, client: &Arc<TunnelClient>) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, client)) {
            *slot = None;
        }
    }

    /// Wait until a live session is installed.
    pub async fn wait_current(&self, cancel: &CancellationToken) -> Result<Arc<TunnelClient>> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so an install in between is not missed.
            notified.as_mut().enable();

            if let Some(client) = self.current() {
                return Ok(client);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            }
        }
    }
}
