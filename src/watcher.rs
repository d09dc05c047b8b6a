//! Debounced change detection over the directories backing a closure.

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::collector::DependencyCollector;
use crate::error::WatchError;
use crate::resolver::FIXTURE_DIR;
use crate::unit::{BuildParams, UnitId, UnitResolver};

/// Quiet period that ends a burst of events
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// One debounce window elapsed after at least one relevant event
    Changed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub path: PathBuf,
    pub recursive: bool,
}

type EventRx = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Directories to watch for `unit`: every unit directory in the closure
/// (non-recursive) plus each unit's fixture tree (recursive).
pub fn closure_targets<R: UnitResolver + ?Sized>(
    resolver: &R,
    unit: &UnitId,
    params: &BuildParams,
) -> Result<Vec<WatchTarget>, WatchError> {
    let closure = DependencyCollector::new(resolver, params).collect(unit)?;

    let mut targets = Vec::with_capacity(closure.len());
    for member in closure {
        let fixtures = member.unit.dir.join(FIXTURE_DIR);
        let has_fixtures = fixtures.is_dir();
        targets.push(WatchTarget {
            path: member.unit.dir,
            recursive: false,
        });
        if has_fixtures {
            targets.push(WatchTarget {
                path: fixtures,
                recursive: true,
            });
        }
    }
    Ok(targets)
}

/// Permission and access-time changes never alter content.
fn is_relevant(event: &Event) -> bool {
    !matches!(
        event.kind,
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_))
    )
}

/// Wait until `window` passes without a relevant event, after at least one
/// relevant event arrived. Each relevant event pushes the single deadline
/// back.
pub async fn debounce(
    events: &mut EventRx,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<WaitOutcome, WatchError> {
    let mut deadline: Option<Instant> = None;

    loop {
        let quiet = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
            event = events.recv() => match event {
                Some(Ok(event)) => {
                    if is_relevant(&event) {
                        tracing::trace!("Change event {:?} on {:?}", event.kind, event.paths);
                        deadline = Some(Instant::now() + window);
                    }
                }
                Some(Err(e)) => return Err(WatchError::Backend(e)),
                None => return Err(WatchError::Closed),
            },
            _ = quiet => return Ok(WaitOutcome::Changed),
        }
    }
}

/// A filesystem watcher whose events feed the debouncer.
pub struct ChangeWatcher {
    watcher: RecommendedWatcher,
    events: EventRx,
    watched: BTreeMap<PathBuf, bool>,
    window: Duration,
}

impl ChangeWatcher {
    pub fn new() -> Result<Self, WatchError> {
        let (tx, events) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res| {
            // Receiver gone means the watcher is being torn down.
            let _ = tx.send(res);
        })?;

        Ok(Self {
            watcher,
            events,
            watched: BTreeMap::new(),
            window: DEBOUNCE_WINDOW,
        })
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn watched(&self) -> impl Iterator<Item = &PathBuf> {
        self.watched.keys()
    }

    /// Make the watched set exactly `targets`, registering new paths and
    /// dropping ones no longer needed.
    pub fn set_targets(&mut self, targets: &[WatchTarget]) -> Result<(), WatchError> {
        let desired: BTreeMap<PathBuf, bool> = targets
            .iter()
            .map(|t| (t.path.clone(), t.recursive))
            .collect();

        let stale: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|(path, recursive)| desired.get(*path) != Some(*recursive))
            .map(|(path, _)| path.clone())
            .collect();
        for path in stale {
            // The directory may already be gone.
            if let Err(e) = self.watcher.unwatch(&path) {
                tracing::debug!("Unwatch {} failed: {}", path.display(), e);
            }
            self.watched.remove(&path);
        }

        for (path, recursive) in desired {
            if self.watched.contains_key(&path) {
                continue;
            }
            let mode = if recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            self.watcher
                .watch(&path, mode)
                .map_err(|source| WatchError::Register {
                    path: path.clone(),
                    source,
                })?;
            tracing::debug!("Watching {}", path.display());
            self.watched.insert(path, recursive);
        }

        Ok(())
    }

    /// Block until the watched set changes or `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<WaitOutcome, WatchError> {
        debounce(&mut self.events, self.window, cancel).await
    }

    /// Recompute the closure of `unit`, watch it, and wait for one change.
    pub async fn watch_unit<R: UnitResolver + ?Sized>(
        &mut self,
        resolver: &R,
        unit: &UnitId,
        params: &BuildParams,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, WatchError> {
        let targets = closure_targets(resolver, unit, params)?;
        self.set_targets(&targets)?;
        self.wait(cancel).await
    }
}
