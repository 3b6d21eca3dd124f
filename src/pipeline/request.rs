//! Per-request state and the table that owns it.

use super::phase::RequestPhase;
use super::sink::{ImageSink, SinkId};
use crate::cache::key::CacheKey;
use crate::decoder::sampling::TargetSize;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Weak;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Upper bound on recycled request states kept for reuse
const FREE_LIST_LIMIT: usize = 64;

/// Opaque identity of one in-flight fetch-decode operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(u64);

impl RequestToken {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// What a sink asks for
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub identifier: String,
    pub target: TargetSize,
    /// Already-fetched bytes; the download stage passes them straight through
    pub bytes: Option<Bytes>,
    pub disk_cache: bool,
}

impl ImageRequest {
    pub fn new(identifier: impl Into<String>, target: TargetSize) -> Self {
        Self {
            identifier: identifier.into(),
            target,
            bytes: None,
            disk_cache: true,
        }
    }

    pub fn with_bytes(mut self, bytes: Bytes) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn without_disk_cache(mut self) -> Self {
        self.disk_cache = false;
        self
    }
}

pub(crate) struct RequestState {
    pub token: RequestToken,
    pub identifier: String,
    pub key: CacheKey,
    pub target: TargetSize,
    pub bytes: Option<Bytes>,
    pub disk_cache: bool,
    pub sink: Option<Weak<dyn ImageSink>>,
    pub sink_id: Option<SinkId>,
    pub phase: RequestPhase,
    pub cancel: CancellationToken,
}

impl RequestState {
    /// Move to `next`, refusing illegal edges.
    pub fn advance(&mut self, next: RequestPhase) -> bool {
        if self.phase.can_transition_to(next) {
            self.phase = next;
            true
        } else {
            warn!(
                "Ignoring illegal transition {} -> {} for {}",
                self.phase, next, self.token
            );
            false
        }
    }

    /// Drop everything the finished request held.
    fn reset(&mut self) {
        self.identifier.clear();
        self.bytes = None;
        self.sink = None;
        self.sink_id = None;
        self.phase = RequestPhase::Idle;
    }

    /// The sink, if this request still owns it and it is alive.
    pub fn live_sink(&self) -> Option<std::sync::Arc<dyn ImageSink>> {
        self.sink.as_ref().and_then(Weak::upgrade)
    }
}

/// Parameters for a new table entry
pub(crate) struct NewRequest {
    pub key: CacheKey,
    pub request: ImageRequest,
    pub sink: Weak<dyn ImageSink>,
    pub sink_id: SinkId,
    pub cancel: CancellationToken,
}

/// In-flight requests indexed by token, with one binding per sink
#[derive(Default)]
pub(crate) struct RequestTable {
    active: HashMap<RequestToken, RequestState>,
    bindings: HashMap<SinkId, RequestToken>,
    free: Vec<RequestState>,
    next_token: u64,
}

impl RequestTable {
    pub fn insert(&mut self, new: NewRequest) -> RequestToken {
        self.next_token += 1;
        let token = RequestToken(self.next_token);
        let NewRequest {
            key,
            request,
            sink,
            sink_id,
            cancel,
        } = new;

        let state = match self.free.pop() {
            Some(mut state) => {
                state.token = token;
                state.identifier.push_str(&request.identifier);
                state.key = key;
                state.target = request.target;
                state.bytes = request.bytes;
                state.disk_cache = request.disk_cache;
                state.sink = Some(sink);
                state.sink_id = Some(sink_id);
                state.cancel = cancel;
                state
            }
            None => RequestState {
                token,
                identifier: request.identifier,
                key,
                target: request.target,
                bytes: request.bytes,
                disk_cache: request.disk_cache,
                sink: Some(sink),
                sink_id: Some(sink_id),
                phase: RequestPhase::Idle,
                cancel,
            },
        };

        self.bindings.insert(sink_id, token);
        self.active.insert(token, state);
        token
    }

    pub fn get(&self, token: RequestToken) -> Option<&RequestState> {
        self.active.get(&token)
    }

    pub fn get_mut(&mut self, token: RequestToken) -> Option<&mut RequestState> {
        self.active.get_mut(&token)
    }

    pub fn bound_token(&self, sink_id: SinkId) -> Option<RequestToken> {
        self.bindings.get(&sink_id).copied()
    }

    /// Whether `token` is still the request bound to its sink
    pub fn is_bound(&self, token: RequestToken) -> bool {
        self.active
            .get(&token)
            .and_then(|state| state.sink_id)
            .is_some_and(|sink_id| self.bindings.get(&sink_id) == Some(&token))
    }

    /// Remove a request, dropping its sink binding if it still holds it.
    pub fn take(&mut self, token: RequestToken) -> Option<RequestState> {
        let state = self.active.remove(&token)?;
        if let Some(sink_id) = state.sink_id
            && self.bindings.get(&sink_id) == Some(&token)
        {
            self.bindings.remove(&sink_id);
        }
        Some(state)
    }

    /// Return a finished request to the free-list.
    pub fn recycle(&mut self, mut state: RequestState) {
        state.reset();
        if self.free.len() < FREE_LIST_LIMIT {
            self.free.push(state);
        }
    }

    pub fn tokens(&self) -> Vec<RequestToken> {
        self.active.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    #[cfg(test)]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::{HashMode, KeyHasher};
    use crate::cache::memory::DisplayLease;
    use std::sync::Arc;

    struct NullSink(SinkId);

    impl ImageSink for NullSink {
        fn sink_id(&self) -> SinkId {
            self.0
        }

        fn on_delivered(&self, _image: DisplayLease) {}
    }

    fn new_request(sink: &Arc<dyn ImageSink>, identifier: &str) -> NewRequest {
        NewRequest {
            key: KeyHasher::new(HashMode::Md5).hash(identifier),
            request: ImageRequest::new(identifier, TargetSize::new(10, 10)),
            sink: Arc::downgrade(sink),
            sink_id: sink.sink_id(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_binding_follows_latest_request() {
        let sink: Arc<dyn ImageSink> = Arc::new(NullSink(SinkId::next()));
        let mut table = RequestTable::default();

        let first = table.insert(new_request(&sink, "a"));
        let second = table.insert(new_request(&sink, "b"));
        assert_ne!(first, second);
        assert!(!table.is_bound(first));
        assert!(table.is_bound(second));

        // Taking the superseded request must not unbind the live one
        table.take(first);
        assert_eq!(table.bound_token(sink.sink_id()), Some(second));
        table.take(second);
        assert_eq!(table.bound_token(sink.sink_id()), None);
    }

    #[test]
    fn test_recycled_state_is_cleared() {
        let sink: Arc<dyn ImageSink> = Arc::new(NullSink(SinkId::next()));
        let mut table = RequestTable::default();
        let token = table.insert(new_request(&sink, "first"));
        table.get_mut(token).unwrap().bytes = Some(Bytes::from_static(b"xyz"));

        let state = table.take(token).unwrap();
        table.recycle(state);
        assert_eq!(table.free_len(), 1);

        let next = table.insert(new_request(&sink, "second"));
        let state = table.get(next).unwrap();
        assert_eq!(state.identifier, "second");
        assert!(state.bytes.is_none());
        assert_eq!(state.phase, RequestPhase::Idle);
        assert_eq!(table.free_len(), 0);
    }

    #[test]
    fn test_weak_sink_does_not_keep_sink_alive() {
        let sink: Arc<dyn ImageSink> = Arc::new(NullSink(SinkId::next()));
        let mut table = RequestTable::default();
        let token = table.insert(new_request(&sink, "a"));
        assert!(table.get(token).unwrap().live_sink().is_some());
        drop(sink);
        assert!(table.get(token).unwrap().live_sink().is_none());
    }

    #[test]
    fn test_illegal_advance_is_refused() {
        let sink: Arc<dyn ImageSink> = Arc::new(NullSink(SinkId::next()));
        let mut table = RequestTable::default();
        let token = table.insert(new_request(&sink, "a"));
        let state = table.get_mut(token).unwrap();
        assert!(!state.advance(RequestPhase::Complete));
        assert!(state.advance(RequestPhase::DownloadQueued));
        assert_eq!(state.phase, RequestPhase::DownloadQueued);
    }
}
