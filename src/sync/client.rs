//! Consumer side: applying a fetch response against the local cache.

use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};

use super::FetchResponse;
use crate::cache::ContentCache;
use crate::error::SyncError;
use crate::fingerprint::Fingerprint;

/// Path -> bytes view of a fetched closure.
pub type SyncedTree = BTreeMap<String, Bytes>;

/// Apply `response` to `cache` and resolve every file to verified bytes.
///
/// Inline contents are verified against their fingerprint before anything is
/// stored. A file whose fingerprint cannot be resolved afterwards is a cache
/// error; it is never papered over by re-fetching. A partial response stores
/// its contents but resolves nothing.
pub fn apply_response(
    cache: &mut ContentCache,
    response: FetchResponse,
) -> Result<SyncedTree, SyncError> {
    store_contents(cache, &response)?;
    if response.partial {
        let pending: HashSet<_> = response
            .files
            .values()
            .filter(|fp| !cache.contains(fp))
            .collect();
        return Err(SyncError::Incomplete {
            pending: pending.len(),
        });
    }

    let mut tree = SyncedTree::new();
    for (path, fp) in response.files {
        let Some(data) = cache.get(&fp) else {
            return Err(SyncError::CacheMiss {
                path,
                fingerprint: fp,
            });
        };
        tree.insert(path, data.clone());
    }

    Ok(tree)
}

/// Store the contents of one round of a multi-round fetch. Returns how many
/// contents the round carried.
pub fn absorb_partial(cache: &mut ContentCache, response: &FetchResponse) -> Result<usize, SyncError> {
    store_contents(cache, response)?;
    Ok(response.contents.len())
}

fn store_contents(cache: &mut ContentCache, response: &FetchResponse) -> Result<(), SyncError> {
    if let Some(message) = &response.error {
        return Err(SyncError::Remote(message.clone()));
    }

    let referenced: HashSet<_> = response.files.values().copied().collect();
    for (fp, data) in &response.contents {
        if !referenced.contains(fp) {
            return Err(SyncError::Unreferenced(*fp));
        }
        if !fp.verifies(data) {
            return Err(SyncError::Corrupt {
                expected: *fp,
                actual: Fingerprint::of(data),
            });
        }
    }

    for (fp, data) in &response.contents {
        cache.put(*fp, data.clone());
    }
    Ok(())
}
