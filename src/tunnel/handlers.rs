//! Agent-side handlers, one per operation.

use async_trait::async_trait;
use bytes::Bytes;
use colored::Colorize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::ops::{encode_body, OpCode, Operation};
use super::protocol::PROTOCOL_VERSION;
use super::router::{CallContext, Handler, Reply, Router};
use crate::cache::ContentCache;
use crate::sync::{build_response_with_limit, MAX_INLINE_BYTES};
use crate::unit::UnitResolver;
use crate::watcher::{closure_targets, ChangeWatcher, WaitOutcome};

/// State shared by every session of one agent process.
#[derive(Clone)]
pub struct AgentState {
    pub resolver: Arc<dyn UnitResolver>,
    /// Content read from disk; persists across reconnects
    pub cache: Arc<Mutex<ContentCache>>,
    /// Set when the consumer reports a protocol error
    pub fatal: Arc<AtomicBool>,
    /// Inline content bytes per fetch response
    pub inline_limit: u64,
}

impl AgentState {
    pub fn new(resolver: Arc<dyn UnitResolver>) -> Self {
        Self {
            resolver,
            cache: Arc::new(Mutex::new(ContentCache::new())),
            fatal: Arc::new(AtomicBool::new(false)),
            inline_limit: MAX_INLINE_BYTES,
        }
    }

    pub fn with_inline_limit(mut self, inline_limit: u64) -> Self {
        self.inline_limit = inline_limit;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Table with a handler for every operation.
    pub fn router(&self) -> Router {
        let mut router = Router::new();
        router
            .add(OpCode::Version, VersionHandler)
            .add(
                OpCode::ReportError,
                ReportErrorHandler {
                    fatal: self.fatal.clone(),
                },
            )
            .add(
                OpCode::ListUnits,
                ListUnitsHandler {
                    resolver: self.resolver.clone(),
                },
            )
            .add(
                OpCode::Fetch,
                FetchHandler {
                    resolver: self.resolver.clone(),
                    cache: self.cache.clone(),
                    inline_limit: self.inline_limit,
                },
            )
            .add(
                OpCode::Watch,
                WatchHandler {
                    resolver: self.resolver.clone(),
                },
            );
        router
    }
}

fn mismatched(expected: OpCode, got: &Operation) -> String {
    format!("{} handler received {} request", expected, got.op())
}

fn reply<T: serde::Serialize>(value: &T) -> Result<Reply, String> {
    encode_body(value)
        .map(Reply::Body)
        .map_err(|e| format!("{:#}", e))
}

pub struct VersionHandler;

#[async_trait]
impl Handler for VersionHandler {
    async fn call(&self, operation: Operation, _ctx: CallContext) -> Result<Reply, String> {
        match operation {
            Operation::Version => reply(&PROTOCOL_VERSION),
            other => Err(mismatched(OpCode::Version, &other)),
        }
    }
}

pub struct ReportErrorHandler {
    fatal: Arc<AtomicBool>,
}

#[async_trait]
impl Handler for ReportErrorHandler {
    async fn call(&self, operation: Operation, _ctx: CallContext) -> Result<Reply, String> {
        let Operation::ReportError(report) = operation else {
            return Err(mismatched(OpCode::ReportError, &operation));
        };
        eprintln!(
            "{} {}",
            "Consumer reported a protocol error:".red().bold(),
            report.message
        );
        tracing::error!("Consumer reported a protocol error: {}", report.message);
        self.fatal.store(true, Ordering::SeqCst);
        Ok(Reply::Body(Bytes::new()))
    }
}

pub struct ListUnitsHandler {
    resolver: Arc<dyn UnitResolver>,
}

#[async_trait]
impl Handler for ListUnitsHandler {
    async fn call(&self, operation: Operation, _ctx: CallContext) -> Result<Reply, String> {
        if operation != Operation::ListUnits {
            return Err(mismatched(OpCode::ListUnits, &operation));
        }
        let resolver = self.resolver.clone();
        let units = tokio::task::spawn_blocking(move || resolver.list_units())
            .await
            .map_err(|e| format!("list task failed: {}", e))?
            .map_err(|e| e.to_string())?;
        reply(&units)
    }
}

pub struct FetchHandler {
    resolver: Arc<dyn UnitResolver>,
    cache: Arc<Mutex<ContentCache>>,
    inline_limit: u64,
}

#[async_trait]
impl Handler for FetchHandler {
    async fn call(&self, operation: Operation, _ctx: CallContext) -> Result<Reply, String> {
        let Operation::Fetch(request) = operation else {
            return Err(mismatched(OpCode::Fetch, &operation));
        };
        let resolver = self.resolver.clone();
        let cache = self.cache.clone();
        let inline_limit = self.inline_limit;

        // Resolution failures travel inside the response, not as an ERROR frame.
        let response = tokio::task::spawn_blocking(move || {
            let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            build_response_with_limit(resolver.as_ref(), &mut cache, &request, inline_limit)
        })
        .await
        .map_err(|e| format!("fetch task failed: {}", e))?;
        reply(&response)
    }
}

pub struct WatchHandler {
    resolver: Arc<dyn UnitResolver>,
}

#[async_trait]
impl Handler for WatchHandler {
    async fn call(&self, operation: Operation, ctx: CallContext) -> Result<Reply, String> {
        let Operation::Watch(request) = operation else {
            return Err(mismatched(OpCode::Watch, &operation));
        };
        let mut watcher = ChangeWatcher::new().map_err(|e| e.to_string())?;
        tracing::info!(unit = %request.unit, stream = ctx.stream(), "Watching closure");

        loop {
            // The closure can change between notifications.
            let resolver = self.resolver.clone();
            let (unit, params) = (request.unit.clone(), request.params.clone());
            let targets =
                tokio::task::spawn_blocking(move || closure_targets(resolver.as_ref(), &unit, &params))
                    .await
                    .map_err(|e| format!("watch task failed: {}", e))?;

            let outcome = match targets {
                Ok(targets) => match watcher.set_targets(&targets) {
                    Ok(()) => watcher.wait(ctx.cancel()).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok(WaitOutcome::Changed) => {
                    tracing::debug!(unit = %request.unit, "Closure changed");
                    ctx.push(Bytes::new()).await.map_err(|e| e.to_string())?;
                }
                Ok(WaitOutcome::Cancelled) => return Ok(Reply::Finished),
                Err(e) => {
                    tracing::error!("Watch of {} failed: {}", request.unit, e);
                    return Err(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::DirectoryResolver;
    use crate::sync::{FetchRequest, FetchResponse};
    use crate::tunnel::ops::decode_body;
    use crate::unit::{BuildParams, UnitId};
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn workspace() -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (rel, contents) in [
            ("app/main.x", "main"),
            ("app/unit.toml", "imports = [\"lib\"]"),
            ("lib/util.x", "util"),
        ] {
            let path = tmp.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        tmp
    }

    fn ctx() -> CallContext {
        let (tx, _rx) = mpsc::channel(4);
        CallContext::new(1, CancellationToken::new(), tx)
    }

    fn body(reply: Reply) -> Bytes {
        match reply {
            Reply::Body(body) => body,
            Reply::Finished => panic!("Expected a body"),
        }
    }

    #[tokio::test]
    async fn test_version_reply() {
        let state = AgentState::new(Arc::new(DirectoryResolver::new(vec![])));
        let router = state.router();
        let reply = router
            .dispatch(OpCode::Version as u8, &[], ctx())
            .await
            .unwrap();
        assert_eq!(decode_body::<u16>(&body(reply)).unwrap(), PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_report_error_marks_fatal() {
        let state = AgentState::new(Arc::new(DirectoryResolver::new(vec![])));
        let router = state.router();
        let report = Operation::ReportError(crate::tunnel::ops::ErrorReport {
            message: "bad body".to_string(),
        });

        router
            .dispatch(OpCode::ReportError as u8, &report.encode_body().unwrap(), ctx())
            .await
            .unwrap();
        assert!(state.is_fatal());
    }

    #[tokio::test]
    async fn test_fetch_failure_travels_in_response() {
        let tmp = workspace();
        let state = AgentState::new(Arc::new(DirectoryResolver::new(vec![tmp.path().to_path_buf()])));
        let router = state.router();
        let request = Operation::Fetch(FetchRequest {
            unit: UnitId::new("missing"),
            known: BTreeSet::new(),
            params: BuildParams::default(),
        });

        let reply = router
            .dispatch(OpCode::Fetch as u8, &request.encode_body().unwrap(), ctx())
            .await
            .unwrap();
        let response: FetchResponse = decode_body(&body(reply)).unwrap();
        assert!(response.error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_fetch_fills_agent_cache() {
        let tmp = workspace();
        let state = AgentState::new(Arc::new(DirectoryResolver::new(vec![tmp.path().to_path_buf()])));
        let router = state.router();
        let request = Operation::Fetch(FetchRequest {
            unit: UnitId::new("app"),
            known: BTreeSet::new(),
            params: BuildParams::default(),
        });

        let reply = router
            .dispatch(OpCode::Fetch as u8, &request.encode_body().unwrap(), ctx())
            .await
            .unwrap();
        let response: FetchResponse = decode_body(&body(reply)).unwrap();
        assert_eq!(response.files.len(), 3);
        assert_eq!(state.cache.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_units() {
        let tmp = workspace();
        let state = AgentState::new(Arc::new(DirectoryResolver::new(vec![tmp.path().to_path_buf()])));
        let reply = state
            .router()
            .dispatch(OpCode::ListUnits as u8, &[], ctx())
            .await
            .unwrap();
        let units: Vec<String> = decode_body(&body(reply)).unwrap();
        assert_eq!(units, vec!["app", "lib"]);
    }
}
