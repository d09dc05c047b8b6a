//! Consumer-side view of a remote source tree.
//!
//! A `RemoteWorkspace` outlives individual sessions: agents reconnect, the
//! session owner swaps the live client, and the content cache keeps every
//! byte already received so later fetches only carry what changed.

use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::ContentCache;
use crate::error::{Result, TunnelError};
use crate::sync::{absorb_partial, apply_response, FetchRequest, SyncedTree};
use crate::tunnel::{accept, SessionOwner, TunnelClient, WatchRequest, WatchStream};
use crate::unit::{BuildParams, UnitId};
use crate::vfs::{materialize, MaterializeStats, VirtualFileSystem};
use crate::watcher::WaitOutcome;

/// One applied fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fetched {
    pub tree: SyncedTree,
    /// Contents shipped inline by this fetch
    pub transferred: usize,
    pub transferred_bytes: u64,
}

pub struct RemoteWorkspace {
    owner: Arc<SessionOwner>,
    /// Held across a whole fetch so the known set matches what gets applied
    cache: Mutex<ContentCache>,
    params: BuildParams,
}

impl RemoteWorkspace {
    pub fn new(params: BuildParams) -> Self {
        Self {
            owner: Arc::new(SessionOwner::new()),
            cache: Mutex::new(ContentCache::new()),
            params,
        }
    }

    pub fn params(&self) -> &BuildParams {
        &self.params
    }

    pub fn sessions(&self) -> &Arc<SessionOwner> {
        &self.owner
    }

    /// Handshake a freshly accepted connection and make it current.
    pub async fn attach<S>(&self, stream: S) -> Result<Arc<TunnelClient>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        attach_to(self.owner.clone(), stream).await
    }

    /// Accept agents until `shutdown` fires. Each accepted agent replaces the
    /// current session; a rejected handshake does not stop the loop. Every
    /// handshake runs on its own task so a silent peer cannot hold up the
    /// next one.
    pub async fn listen(&self, listener: TcpListener, shutdown: &CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Waiting for agents on {}", addr);
        }

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
            }

            let owner = self.owner.clone();
            tokio::spawn(async move {
                match attach_to(owner, stream).await {
                    Ok(client) => tracing::info!(
                        peer = %peer,
                        "Agent {} connected",
                        client.agent().agent
                    ),
                    Err(e) => tracing::warn!("Rejected agent from {}: {}", peer, e),
                }
            });
        }
    }

    /// The live session, waiting for an agent if there is none.
    pub async fn client(&self, cancel: &CancellationToken) -> Result<Arc<TunnelClient>> {
        self.owner.wait_current(cancel).await
    }

    pub async fn list_units(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.client(cancel).await?.list_units(cancel).await
    }

    /// Fetch the closure of `unit`, sending every fingerprint already cached.
    /// A closure too large for one response is fetched over several rounds,
    /// each sending the known set grown by the previous round.
    pub async fn fetch_tree(&self, unit: UnitId, cancel: &CancellationToken) -> Result<Fetched> {
        let client = self.client(cancel).await?;
        let mut cache = self.cache.lock().await;
        let mut transferred = 0;
        let mut transferred_bytes = 0;
        let mut rounds = 0;

        let tree = loop {
            let request = FetchRequest {
                unit: unit.clone(),
                known: cache.known(),
                params: self.params.clone(),
            };
            let response = client.fetch(request, cancel).await?;
            rounds += 1;
            transferred += response.contents.len();
            transferred_bytes += response.content_bytes();

            if !response.partial {
                break apply_response(&mut cache, response)?;
            }
            if absorb_partial(&mut cache, &response)? == 0 {
                return Err(TunnelError::Protocol(format!(
                    "partial response for {} carried no contents",
                    unit
                )));
            }
            tracing::debug!(unit = %unit, rounds, transferred, "Closure incomplete, fetching more");
        };

        tracing::debug!(
            unit = %unit,
            files = tree.len(),
            rounds,
            transferred,
            transferred_bytes,
            "Fetched closure"
        );
        Ok(Fetched {
            tree,
            transferred,
            transferred_bytes,
        })
    }

    /// Fetch the closure of `unit` as a read-only filesystem rooted at the
    /// unit names.
    pub async fn fetch(&self, unit: UnitId, cancel: &CancellationToken) -> Result<VirtualFileSystem> {
        let fetched = self.fetch_tree(unit, cancel).await?;
        VirtualFileSystem::from_tree(fetched.tree)
            .map_err(|e| TunnelError::Protocol(format!("agent sent an unusable path: {}", e)))
    }

    /// Fetch and reconcile `dest` to match.
    pub async fn sync_to_disk(
        &self,
        unit: UnitId,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<MaterializeStats> {
        let vfs = self.fetch(unit, cancel).await?;
        Ok(materialize(&vfs, dest).await?)
    }

    /// One-shot [`sync_to_disk`](Self::sync_to_disk). A session lost mid-pull
    /// is retried once on the next session.
    pub async fn pull(
        &self,
        unit: &UnitId,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<MaterializeStats> {
        match self.sync_to_disk(unit.clone(), dest, cancel).await {
            Err(e) if e.is_transport() => {
                tracing::warn!("Session lost while pulling {}, retrying: {}", unit, e);
                self.sync_to_disk(unit.clone(), dest, cancel).await
            }
            outcome => outcome,
        }
    }

    /// Open a change stream for the closure of `unit`.
    pub async fn watch(&self, unit: UnitId, cancel: &CancellationToken) -> Result<WatchStream> {
        let client = self.client(cancel).await?;
        client
            .watch(WatchRequest {
                unit,
                params: self.params.clone(),
            })
            .await
    }

    /// Keep `dest` in step with `unit` until cancelled. A lost session waits
    /// for the agent to reconnect and resumes with a full sync.
    pub async fn mirror(&self, unit: &UnitId, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        loop {
            let outcome = self.mirror_session(unit, dest, cancel).await;
            match outcome {
                Ok(()) | Err(TunnelError::Cancelled) => return Ok(()),
                Err(e) if e.is_transport() => {
                    tracing::warn!("Session lost while mirroring {}: {}", unit, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn mirror_session(
        &self,
        unit: &UnitId,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Watch first so a change during the initial sync is not lost.
        let mut changes = self.watch(unit.clone(), cancel).await?;
        let stats = self.sync_to_disk(unit.clone(), dest, cancel).await?;
        tracing::info!(unit = %unit, written = stats.written, removed = stats.removed, "Synced");

        loop {
            match changes.next_change(cancel).await? {
                WaitOutcome::Changed => {
                    let stats = self.sync_to_disk(unit.clone(), dest, cancel).await?;
                    tracing::info!(
                        unit = %unit,
                        written = stats.written,
                        removed = stats.removed,
                        "Re-synced after change"
                    );
                }
                WaitOutcome::Cancelled => return Ok(()),
            }
        }
    }

    /// Entries and bytes held by the consumer cache.
    pub async fn cache_stats(&self) -> (usize, u64) {
        let cache = self.cache.lock().await;
        (cache.len(), cache.total_bytes())
    }
}

async fn attach_to<S>(owner: Arc<SessionOwner>, stream: S) -> Result<Arc<TunnelClient>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let client = Arc::new(accept(stream).await?);
    owner.install(client.clone());

    let watched = client.clone();
    tokio::spawn(async move {
        watched.closed().await;
        owner.clear_if(&watched);
        tracing::info!("Agent {} disconnected", watched.agent().agent);
    });

    Ok(client)
}
