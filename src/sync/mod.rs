//! Content-addressed synchronization.
//!
//! The source side answers a fetch with the full path -> fingerprint map of a
//! unit's closure plus the bytes of every fingerprint the requester does not
//! already hold. The consumer side joins the two maps against its own cache.
//!
//! ```text
//! consumer                                   agent
//!   FetchRequest { unit, known, params } -->
//!                                            collect closure
//!                                            read + fingerprint files
//!   <-- FetchResponse { files, contents (fp not in known), partial }
//!   verify contents, store in cache
//!   partial: ask again with the grown known set
//!   resolve every file from cache (miss = cache error)
//! ```
//!
//! Inline contents are capped at [`MAX_INLINE_BYTES`] per response so the
//! encoded body always fits in one frame. A closure larger than that arrives
//! over several rounds.

pub mod client;
pub mod source;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::fingerprint::Fingerprint;
use crate::unit::{BuildParams, UnitId};

pub use client::{absorb_partial, apply_response, SyncedTree};
pub use source::{build_response, build_response_with_limit, FetchStats};

/// Inline bytes one response may carry. The rest of the frame budget is left
/// for the path map and bincode overhead.
pub const MAX_INLINE_BYTES: u64 = 48 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub unit: UnitId,
    /// Fingerprints the requester already holds
    pub known: BTreeSet<Fingerprint>,
    pub params: BuildParams,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// `<unit>/<relative path>` -> fingerprint, for the whole closure
    pub files: BTreeMap<String, Fingerprint>,
    /// Bytes for fingerprints the requester lacks
    pub contents: BTreeMap<Fingerprint, Bytes>,
    pub error: Option<String>,
    /// Some unknown contents were held back; fetch again to get them
    pub partial: bool,
}

impl FetchResponse {
    /// A failed response: only `error` set.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            files: BTreeMap::new(),
            contents: BTreeMap::new(),
            error: Some(message.into()),
            partial: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Bytes carried inline by this response.
    pub fn content_bytes(&self) -> u64 {
        self.contents.values().map(|b| b.len() as u64).sum()
    }
}
