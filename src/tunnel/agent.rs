//! Agent process: dial the relay, handshake, serve, reconnect.
//!
//! Each session walks `Dialing -> Handshaking -> Serving -> Closed`. Any
//! transport failure returns to `Dialing` after a fixed delay. A FATAL frame
//! or a consumer error report ends the loop with an error instead.

use colored::Colorize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::handlers::AgentState;
use super::mux::{self, FrameSink};
use super::protocol::{
    self, Frame, Hello, HelloFlags, HANDSHAKE_TIMEOUT, PROTOCOL_VERSION, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN,
};
use super::router::Router;
use super::transport::{BoxedStream, Dialer};
use crate::error::{Result, TunnelError};

/// Wait between reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Keepalive period while serving
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Handshaking,
    Serving,
    Closed,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name announced in HELLO
    pub name: String,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    /// A relay that does not echo HELLO within this is treated as lost
    pub handshake_timeout: Duration,
    pub flags: HelloFlags,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: format!("srctunnel-agent/{}", env!("CARGO_PKG_VERSION")),
            reconnect_delay: RECONNECT_DELAY,
            ping_interval: PING_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            flags: HelloFlags::WATCH,
        }
    }
}

pub struct Agent {
    dialer: Box<dyn Dialer>,
    state: AgentState,
    router: Arc<Router>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(dialer: impl Dialer + 'static, state: AgentState) -> Self {
        let router = Arc::new(state.router());
        Self {
            dialer: Box::new(dialer),
            state,
            router,
            config: AgentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    fn enter(&self, state: SessionState) {
        tracing::debug!(relay = %self.dialer.describe(), "Session state: {:?}", state);
    }

    /// Serve until `shutdown` fires (returns `Ok`) or a fatal protocol error
    /// ends the process (returns `Err`). Transport failures never end it.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let relay = self.dialer.describe();

        loop {
            self.enter(SessionState::Dialing);
            let dialed = tokio::select! {
                dialed = self.dialer.dial() => dialed,
                _ = shutdown.cancelled() => return Ok(()),
            };

            match dialed {
                Ok(stream) => {
                    tracing::info!("Connected to relay {}", relay);
                    let outcome = self.run_session(stream, &shutdown).await;
                    self.enter(SessionState::Closed);

                    match outcome {
                        Ok(()) if shutdown.is_cancelled() => return Ok(()),
                        Ok(()) => tracing::info!("Session with relay {} closed", relay),
                        Err(e @ (TunnelError::Fatal(_) | TunnelError::VersionMismatch { .. })) => {
                            report_fatal(&e.to_string());
                            return Err(e);
                        }
                        Err(e) => tracing::info!("Lost connection to relay {}: {}", relay, e),
                    }

                    if self.state.is_fatal() {
                        let message = "consumer reported a protocol error; refusing to reconnect";
                        report_fatal(message);
                        return Err(TunnelError::Fatal(message.to_string()));
                    }
                }
                Err(e) => tracing::info!("Could not reach relay {}: {}", relay, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn run_session(&self, stream: BoxedStream, shutdown: &CancellationToken) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);

        self.enter(SessionState::Handshaking);
        let timeout = self.config.handshake_timeout;
        tokio::select! {
            shaken = tokio::time::timeout(timeout, self.handshake(&mut reader, &mut writer)) => {
                shaken.map_err(|_| {
                    TunnelError::Transport(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no HELLO echo within {:?}", timeout),
                    ))
                })??
            }
            _ = shutdown.cancelled() => return Ok(()),
        }

        self.enter(SessionState::Serving);
        let session = shutdown.child_token();
        let (sink, writer_task) = mux::spawn_writer(writer, session.clone());
        let pinger = tokio::spawn(keepalive(
            sink.clone(),
            self.config.ping_interval,
            session.clone(),
        ));

        let served = mux::serve(reader, sink, self.router.clone(), session.clone()).await;

        session.cancel();
        let _ = pinger.await;
        let _ = writer_task.await;
        served
    }

    async fn handshake<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let hello = Hello::new(self.config.flags, self.config.name.clone());
        protocol::write_frame(writer, &hello.encode()).await?;
        writer.flush().await?;

        match protocol::read_decoded(reader).await? {
            Frame::Hello(echo) if echo.version == PROTOCOL_VERSION => {
                tracing::debug!(consumer = %echo.agent, version = echo.version, "Handshake complete");
                Ok(())
            }
            Frame::Hello(echo) => Err(TunnelError::VersionMismatch {
                remote: echo.version,
                min: PROTOCOL_VERSION_MIN,
                max: PROTOCOL_VERSION_MAX,
            }),
            Frame::Fatal(fatal) => Err(TunnelError::Fatal(fatal.message)),
            other => Err(TunnelError::Protocol(format!(
                "expected HELLO echo, got {:?}",
                other
            ))),
        }
    }
}

/// Print to stderr as well as the log so a human sees it before exit.
fn report_fatal(message: &str) {
    eprintln!("{} {}", "srctunnel:".red().bold(), message.red());
    tracing::error!("{}", message);
}

async fn keepalive(sink: FrameSink, every: Duration, session: CancellationToken) {
    let mut ticks = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if sink.send(protocol::encode_ping()).await.is_err() {
                    break;
                }
                tracing::trace!("Ping");
            }
            _ = session.cancelled() => break,
        }
    }
}
