//! Bookkeeping of in-flight requests belonging to one replication.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use tracing::debug;

/// Identifier assigned to a tracked request. Increases monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Returns the raw sequence number.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a request was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestPurpose {
    /// `POST /_replicate` starting the replication.
    Start,
    /// `POST /_replicate` cancelling the replication.
    Stop,
    /// `GET /_active_tasks`.
    StatusPoll,
}

/// Something that can abort an outstanding request.
pub trait CancelHandle {
    /// Aborts the request. Must be safe to call after completion.
    fn cancel(&self);
}

impl CancelHandle for tokio::task::AbortHandle {
    fn cancel(&self) {
        self.abort();
    }
}

/// Read-only description of a tracked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRequest {
    /// Tracker-assigned id.
    pub id: RequestId,
    /// Why the request was made.
    pub purpose: RequestPurpose,
    /// Controller generation the request belongs to.
    pub generation: u64,
    /// When the request was submitted.
    pub submitted_at: Instant,
}

struct Entry<H> {
    info: TrackedRequest,
    handle: H,
}

/// Set of outstanding requests keyed by a sequence id.
///
/// Entries are added on submission and removed on completion or
/// cancellation.
pub struct RequestTracker<H: CancelHandle> {
    next_id: u64,
    entries: BTreeMap<RequestId, Entry<H>>,
}

impl<H: CancelHandle> RequestTracker<H> {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }

    /// Tracks `handle` and returns its id.
    pub fn track(&mut self, handle: H, purpose: RequestPurpose, generation: u64) -> RequestId {
        self.track_with(purpose, generation, |_| handle)
    }

    /// Allocates an id, builds the handle with it and tracks the result.
    ///
    /// Lets the request carry its own id, so its completion can untrack it.
    pub fn track_with<F>(&mut self, purpose: RequestPurpose, generation: u64, make: F) -> RequestId
    where
        F: FnOnce(RequestId) -> H,
    {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        let handle = make(id);
        let info = TrackedRequest {
            id,
            purpose,
            generation,
            submitted_at: Instant::now(),
        };
        debug!(request = %id, ?purpose, generation, "tracking request");
        self.entries.insert(id, Entry { info, handle });
        id
    }

    /// Removes `id`. Returns false if it was not tracked.
    pub fn untrack(&mut self, id: RequestId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Returns a snapshot of outstanding requests, oldest first.
    pub fn all(&self) -> Vec<TrackedRequest> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    /// Returns true if a request with `purpose` is outstanding.
    pub fn has_purpose(&self, purpose: RequestPurpose) -> bool {
        self.entries.values().any(|e| e.info.purpose == purpose)
    }

    /// Cancels every outstanding request and clears the set.
    pub fn cancel_all(&mut self) -> Vec<TrackedRequest> {
        let entries = std::mem::take(&mut self.entries);
        entries
            .into_values()
            .map(|entry| {
                debug!(request = %entry.info.id, purpose = ?entry.info.purpose, "cancelling request");
                entry.handle.cancel();
                entry.info
            })
            .collect()
    }

    /// Cancels outstanding requests matching `purpose`.
    pub fn cancel_where(&mut self, purpose: RequestPurpose) -> Vec<TrackedRequest> {
        let ids: Vec<RequestId> = self
            .entries
            .values()
            .filter(|e| e.info.purpose == purpose)
            .map(|e| e.info.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|entry| {
                entry.handle.cancel();
                entry.info
            })
            .collect()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: CancelHandle> Default for RequestTracker<H> {
    fn default() -> Self {
        Self::new()
    }
}
