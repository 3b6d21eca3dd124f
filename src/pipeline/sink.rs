//! Consumer side of a request.
//!
//! A sink holds at most one live [`RequestToken`]. The pipeline keeps only a
//! weak reference to it, so a dropped sink is never kept alive by, or
//! delivered to from, in-flight work.

use super::phase::RequestPhase;
use super::request::RequestToken;
use crate::cache::memory::DisplayLease;
use crate::errors::PipelineError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identity of a sink, used for binding lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

impl SinkId {
    pub fn next() -> Self {
        Self(NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// Display-side consumer of decoded images.
///
/// Callbacks run on pipeline worker tasks or, for memory hits, on the
/// requesting thread. They must not call back into the pipeline
/// synchronously with blocking work.
pub trait ImageSink: Send + Sync {
    fn sink_id(&self) -> SinkId;

    /// A request now owns this sink.
    fn bind(&self, _token: RequestToken) {}

    fn on_state_changed(&self, _token: RequestToken, _phase: RequestPhase) {}

    fn on_delivered(&self, image: DisplayLease);

    fn on_failed(&self, _token: RequestToken, _error: &PipelineError) {}

    /// The request finished, failed or was cancelled.
    fn unbind(&self, _token: RequestToken) {}
}
