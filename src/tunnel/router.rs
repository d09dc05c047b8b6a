//! Handler table keyed by operation id.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use super::mux::FrameSink;
use super::ops::{OpCode, Operation};
use super::protocol::{MessageType, StreamData, MAX_STREAM_BODY};
use crate::error::TunnelError;

/// What a handler produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Sent as a RESPONSE frame
    Body(Bytes),
    /// Push stream finished; sent as an END frame
    Finished,
}

/// Per-request handle given to a handler.
#[derive(Clone)]
pub struct CallContext {
    stream: u32,
    cancel: CancellationToken,
    sink: FrameSink,
}

impl CallContext {
    pub fn new(stream: u32, cancel: CancellationToken, sink: FrameSink) -> Self {
        Self {
            stream,
            cancel,
            sink,
        }
    }

    pub fn stream(&self) -> u32 {
        self.stream
    }

    /// Fires when the consumer cancels this request or the session ends.
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Push one EVENT frame on this request's stream.
    pub async fn push(&self, body: Bytes) -> Result<(), TunnelError> {
        if body.len() > MAX_STREAM_BODY {
            return Err(TunnelError::Protocol(format!(
                "event of {} bytes exceeds the {}-byte frame limit",
                body.len(),
                MAX_STREAM_BODY
            )));
        }
        let frame = StreamData {
            stream: self.stream,
            body,
        }
        .encode(MessageType::Event);
        self.sink.send(frame).await.map_err(|_| TunnelError::Closed)
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one decoded request. `Err` becomes an ERROR frame carrying the
    /// message; the session is unaffected.
    async fn call(&self, operation: Operation, ctx: CallContext) -> Result<Reply, String>;
}

#[derive(Default)]
pub struct Router {
    routes: HashMap<OpCode, Box<dyn Handler + 'static>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: OpCode, handler: impl Handler + 'static) -> &mut Self {
        self.routes.insert(op, Box::new(handler));
        self
    }

    pub fn handles(&self, op: OpCode) -> bool {
        self.routes.contains_key(&op)
    }

    /// Decode the request body for `op` and run its handler.
    pub async fn dispatch(&self, op: u8, body: &[u8], ctx: CallContext) -> Result<Reply, String> {
        let op = OpCode::from_u8(op).ok_or_else(|| format!("unknown operation {}", op))?;
        let handler = self
            .routes
            .get(&op)
            .ok_or_else(|| format!("operation {} is not served", op))?;
        let operation = Operation::decode(op, body)
            .map_err(|e| format!("malformed {} request: {:#}", op, e))?;

        tracing::debug!(stream = ctx.stream(), "Dispatching {}", op);
        handler.call(operation, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn call(&self, operation: Operation, _ctx: CallContext) -> Result<Reply, String> {
            match operation {
                Operation::Version => Ok(Reply::Body(Bytes::from_static(b"v"))),
                other => Err(format!("unexpected {:?}", other)),
            }
        }
    }

    fn ctx() -> (CallContext, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(4);
        (CallContext::new(1, CancellationToken::new(), tx), rx)
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler() {
        let mut router = Router::new();
        router.add(OpCode::Version, Echo);
        let (ctx, _rx) = ctx();

        let reply = router.dispatch(OpCode::Version as u8, &[], ctx).await;
        assert_eq!(reply, Ok(Reply::Body(Bytes::from_static(b"v"))));
    }

    #[tokio::test]
    async fn test_unknown_and_unserved_ops() {
        let mut router = Router::new();
        router.add(OpCode::Version, Echo);

        let (ctx1, _rx1) = ctx();
        let err = router.dispatch(0x7F, &[], ctx1).await.unwrap_err();
        assert!(err.contains("unknown operation"));

        let (ctx2, _rx2) = ctx();
        let err = router
            .dispatch(OpCode::ListUnits as u8, &[], ctx2)
            .await
            .unwrap_err();
        assert!(err.contains("not served"));
    }

    #[tokio::test]
    async fn test_push_emits_event_frame() {
        let (ctx, mut rx) = ctx();
        ctx.push(Bytes::new()).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame[4], MessageType::Event as u8);
        assert_eq!(&frame[5..9], &1u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_oversized_push_is_refused() {
        let (ctx, mut rx) = ctx();
        let err = ctx
            .push(Bytes::from(vec![0u8; MAX_STREAM_BODY + 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(ref m) if m.contains("frame limit")));
        assert!(rx.try_recv().is_err());
    }
}
