//! Two-stage fetch and decode coordinator.
//!
//! A request that misses the memory tier is bound to its sink and moves
//! through a download pool and a decode pool:
//!
//! ```text
//! Idle -> DownloadQueued -> DownloadRunning -> DownloadDone
//!      -> DecodeQueued -> DecodeRunning -> Complete
//! ```
//!
//! with `DownloadFailed` and `DecodeFailed` exits from the running phases.
//! Sink callbacks are collected while the request table is locked and
//! dispatched after it is released. Lock order is always the request table
//! first, then a queue or the memory tier.

pub mod control;
pub mod maintenance;
pub mod phase;
pub mod request;
pub mod sink;
pub mod worker;

use crate::cache::key::CacheKey;
use crate::cache::memory::DisplayLease;
use crate::cache::{CacheCommand, ImageCache};
use crate::config::Config;
use crate::decoder::Decoder;
use crate::decoder::pixels::PixelBuffer;
use crate::errors::{PipelineError, PipelineResult};
use crate::fetcher::{FetchRequest, Fetcher, HttpImageSource, ImageSource};
use crate::utils::UrlUtils;
use bytes::Bytes;
use control::{ControlGate, GateOutcome};
use maintenance::Housekeeper;
use phase::RequestPhase;
use request::{NewRequest, RequestState, RequestTable};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use worker::{WorkQueue, WorkerPool};

pub use request::{ImageRequest, RequestToken};
pub use sink::{ImageSink, SinkId};

/// What happened to a call to [`ImagePipeline::request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Memory hit, delivered before `request` returned
    Delivered,
    /// The sink already has this identifier in flight
    Coalesced(RequestToken),
    Queued(RequestToken),
    /// Exit-early or shutdown is in effect
    Skipped,
}

/// Sink callback to run once the request table is unlocked
enum Notice {
    Bind(Arc<dyn ImageSink>, RequestToken),
    Phase(Arc<dyn ImageSink>, RequestToken, RequestPhase),
    Delivered(Arc<dyn ImageSink>, DisplayLease),
    Failed(Arc<dyn ImageSink>, RequestToken, PipelineError),
    Unbind(Arc<dyn ImageSink>, RequestToken),
}

fn dispatch(notices: Vec<Notice>) {
    for notice in notices {
        match notice {
            Notice::Bind(sink, token) => sink.bind(token),
            Notice::Phase(sink, token, phase) => sink.on_state_changed(token, phase),
            Notice::Delivered(sink, image) => sink.on_delivered(image),
            Notice::Failed(sink, token, error) => sink.on_failed(token, &error),
            Notice::Unbind(sink, token) => sink.unbind(token),
        }
    }
}

struct PipelineInner {
    cache: Arc<ImageCache>,
    fetcher: Fetcher,
    decoder: Arc<Decoder>,
    requests: Mutex<RequestTable>,
    download_queue: Arc<WorkQueue>,
    decode_queue: Arc<WorkQueue>,
    control: ControlGate,
    shutdown: CancellationToken,
}

pub struct ImagePipeline {
    inner: Arc<PipelineInner>,
    download_workers: Option<WorkerPool>,
    decode_workers: Option<WorkerPool>,
    housekeeper: Option<Housekeeper>,
}

impl ImagePipeline {
    /// Build a pipeline over an existing cache. Must be called inside a Tokio runtime.
    ///
    /// Disk initialization is queued on the housekeeping thread immediately.
    pub fn new(
        config: &Config,
        cache: Arc<ImageCache>,
        source: Arc<dyn ImageSource>,
    ) -> PipelineResult<Self> {
        let inner = Arc::new(PipelineInner {
            fetcher: Fetcher::new(Arc::clone(cache.disk()), source),
            decoder: Arc::new(Decoder::new(
                &config.decoder,
                Some(Arc::clone(cache.pool())),
            )),
            cache: Arc::clone(&cache),
            requests: Mutex::new(RequestTable::default()),
            download_queue: Arc::new(WorkQueue::new("download")),
            decode_queue: Arc::new(WorkQueue::new("decode")),
            control: ControlGate::new(),
            shutdown: CancellationToken::new(),
        });

        let housekeeper = Housekeeper::spawn(cache)
            .map_err(|e| PipelineError::io("spawning housekeeping thread", e))?;
        // Completion is observable through the disk tier's own wait
        drop(housekeeper.submit(CacheCommand::InitDisk));

        let download_workers = {
            let pipeline = Arc::clone(&inner);
            WorkerPool::spawn(
                "download",
                config.pipeline.download_workers,
                Arc::clone(&inner.download_queue),
                inner.shutdown.clone(),
                move |token| {
                    let pipeline = Arc::clone(&pipeline);
                    async move { pipeline.run_download(token).await }
                },
            )
        };
        let decode_workers = {
            let pipeline = Arc::clone(&inner);
            WorkerPool::spawn(
                "decode",
                config.pipeline.effective_decode_workers(),
                Arc::clone(&inner.decode_queue),
                inner.shutdown.clone(),
                move |token| {
                    let pipeline = Arc::clone(&pipeline);
                    async move { pipeline.run_decode(token).await }
                },
            )
        };
        info!(
            "Image pipeline started: {} download workers, {} decode workers",
            download_workers.size(),
            decode_workers.size()
        );

        Ok(Self {
            inner,
            download_workers: Some(download_workers),
            decode_workers: Some(decode_workers),
            housekeeper: Some(housekeeper),
        })
    }

    /// Build the cache and an HTTP source from configuration.
    pub fn from_config(config: &Config) -> PipelineResult<Self> {
        let cache = Arc::new(ImageCache::new(config));
        let source = Arc::new(HttpImageSource::new(&config.http)?);
        Self::new(config, cache, source)
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.inner.cache
    }

    /// Ask for an image on behalf of `sink`.
    ///
    /// A memory hit is delivered on the calling thread. Otherwise any
    /// different request the sink holds is cancelled and a new one is queued.
    pub fn request(&self, sink: &Arc<dyn ImageSink>, request: ImageRequest) -> RequestOutcome {
        let inner = &self.inner;
        let key = inner.cache.key_for(&request.identifier);
        let sink_id = sink.sink_id();
        let mut notices = Vec::new();

        let outcome = {
            let mut table = inner.lock_requests();

            if let Some(existing) = table.bound_token(sink_id) {
                if table
                    .get(existing)
                    .is_some_and(|state| state.identifier == request.identifier)
                {
                    trace!("Coalesced request for {} onto {}", sink_id, existing);
                    return RequestOutcome::Coalesced(existing);
                }
                inner.cancel_locked(&mut table, existing, &mut notices);
            }

            if let Some(image) = inner.cache.lookup(&key) {
                trace!("Memory hit for {}", key);
                notices.push(Notice::Delivered(Arc::clone(sink), image));
                RequestOutcome::Delivered
            } else if inner.control.exit_early() || inner.shutdown.is_cancelled() {
                RequestOutcome::Skipped
            } else {
                let token = table.insert(NewRequest {
                    key,
                    request,
                    sink: Arc::downgrade(sink),
                    sink_id,
                    cancel: inner.shutdown.child_token(),
                });
                if let Some(state) = table.get_mut(token) {
                    state.advance(RequestPhase::DownloadQueued);
                    debug!(
                        "Queued {} for {}",
                        token,
                        UrlUtils::obfuscate_credentials(&state.identifier)
                    );
                }
                notices.push(Notice::Bind(Arc::clone(sink), token));
                notices.push(Notice::Phase(
                    Arc::clone(sink),
                    token,
                    RequestPhase::DownloadQueued,
                ));
                RequestOutcome::Queued(token)
            }
        };

        dispatch(notices);
        // Queued only after the sink has seen its bind
        if let RequestOutcome::Queued(token) = outcome {
            inner.download_queue.push(token);
        }
        outcome
    }

    /// Cancel one request. Returns whether it was still in flight.
    pub fn cancel(&self, token: RequestToken) -> bool {
        let mut notices = Vec::new();
        let cancelled = {
            let mut table = self.inner.lock_requests();
            self.inner.cancel_locked(&mut table, token, &mut notices)
        };
        dispatch(notices);
        cancelled
    }

    /// Drop whatever request `sink_id` holds; called when the sink is torn down.
    pub fn release(&self, sink_id: SinkId) -> bool {
        let mut notices = Vec::new();
        let released = {
            let mut table = self.inner.lock_requests();
            match table.bound_token(sink_id) {
                Some(token) => self.inner.cancel_locked(&mut table, token, &mut notices),
                None => false,
            }
        };
        dispatch(notices);
        released
    }

    /// Hold decode starts while `paused`. Downloads keep running.
    pub fn pause(&self, paused: bool) {
        debug!("Decode {}", if paused { "paused" } else { "resumed" });
        self.inner.control.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.control.is_paused()
    }

    /// While set, every in-flight request is cancelled and new misses are skipped.
    pub fn set_exit_early(&self, exit_early: bool) {
        self.inner.control.set_exit_early(exit_early);
        if exit_early {
            self.inner.cancel_all();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock_requests().len()
    }

    /// Evict memory and delete and reopen the disk tier.
    pub async fn clear_cache(&self) {
        self.run_command(CacheCommand::Clear).await;
    }

    pub async fn flush_cache(&self) {
        self.run_command(CacheCommand::Flush).await;
    }

    pub async fn close_cache(&self) {
        self.run_command(CacheCommand::Close).await;
    }

    async fn run_command(&self, command: CacheCommand) {
        let Some(housekeeper) = &self.housekeeper else {
            return;
        };
        if housekeeper.submit(command).await.is_err() {
            warn!("Cache command {:?} was not run", command);
        }
    }

    /// Cancel all work, stop the pools, flush and close the disk tier.
    pub async fn shutdown(mut self) {
        info!("Shutting down image pipeline");
        self.set_exit_early(true);
        self.inner.shutdown.cancel();

        if let Some(pool) = self.download_workers.take() {
            pool.join().await;
        }
        if let Some(pool) = self.decode_workers.take() {
            pool.join().await;
        }

        if let Some(housekeeper) = self.housekeeper.take() {
            drop(housekeeper.submit(CacheCommand::Flush));
            let _ = housekeeper.submit(CacheCommand::Close).await;
            if let Err(e) = tokio::task::spawn_blocking(move || housekeeper.join()).await {
                warn!("Failed to join housekeeping thread: {}", e);
            }
        }
        info!("Image pipeline stopped");
    }
}

impl Drop for ImagePipeline {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl PipelineInner {
    fn lock_requests(&self) -> MutexGuard<'_, RequestTable> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `token` from the table and both queues and signal its worker.
    fn cancel_locked(
        &self,
        table: &mut RequestTable,
        token: RequestToken,
        notices: &mut Vec<Notice>,
    ) -> bool {
        let was_bound = table.is_bound(token);
        let Some(state) = table.take(token) else {
            return false;
        };
        state.cancel.cancel();
        let dequeued = self.download_queue.remove(token) || self.decode_queue.remove(token);
        debug!(
            "Cancelled {} in {} ({})",
            token,
            state.phase,
            if dequeued { "not started" } else { "running" }
        );
        if was_bound && let Some(sink) = state.live_sink() {
            notices.push(Notice::Unbind(sink, token));
        }
        table.recycle(state);
        true
    }

    fn cancel_all(&self) {
        let mut notices = Vec::new();
        {
            let mut table = self.lock_requests();
            for token in table.tokens() {
                self.cancel_locked(&mut table, token, &mut notices);
            }
        }
        dispatch(notices);
    }

    fn phase_notice(state: &RequestState) -> Option<Notice> {
        state
            .live_sink()
            .map(|sink| Notice::Phase(sink, state.token, state.phase))
    }

    async fn run_download(self: &Arc<Self>, token: RequestToken) {
        let mut notices = Vec::new();
        let started = {
            let mut table = self.lock_requests();
            match table.get_mut(token) {
                Some(state) if state.phase.can_transition_to(RequestPhase::DownloadRunning) => {
                    state.advance(RequestPhase::DownloadRunning);
                    notices.extend(Self::phase_notice(state));
                    Some((
                        FetchRequest {
                            identifier: state.identifier.clone(),
                            key: state.key.clone(),
                            attached: state.bytes.take(),
                            disk_cache: state.disk_cache,
                        },
                        state.cancel.clone(),
                    ))
                }
                _ => None,
            }
        };
        dispatch(notices);
        let Some((fetch, cancel)) = started else {
            return;
        };

        match self.fetcher.resolve(fetch, &cancel).await {
            Ok(_) if self.control.exit_early() => {
                self.cancel_one(token);
            }
            Ok(fetched) => {
                trace!("{} resolved {} bytes from {:?}", token, fetched.bytes.len(), fetched.origin);
                self.download_finished(token, fetched.bytes);
            }
            Err(e) if e.is_cancelled() => trace!("{} cancelled during download", token),
            Err(e) => self.fail(token, RequestPhase::DownloadFailed, e),
        }
    }

    fn download_finished(&self, token: RequestToken, bytes: Bytes) {
        let mut notices = Vec::new();
        let queued = {
            let mut table = self.lock_requests();
            match table.get_mut(token) {
                Some(state) if !state.cancel.is_cancelled() => {
                    state.bytes = Some(bytes);
                    for next in [RequestPhase::DownloadDone, RequestPhase::DecodeQueued] {
                        state.advance(next);
                        notices.extend(Self::phase_notice(state));
                    }
                    true
                }
                _ => false,
            }
        };
        dispatch(notices);
        if queued {
            self.decode_queue.push(token);
        }
    }

    async fn run_decode(self: &Arc<Self>, token: RequestToken) {
        let Some(cancel) = self
            .lock_requests()
            .get(token)
            .map(|state| state.cancel.clone())
        else {
            return;
        };

        match self.control.wait_until_resumed(&cancel).await {
            GateOutcome::Proceed => {}
            GateOutcome::ExitEarly => {
                self.cancel_one(token);
                return;
            }
            GateOutcome::Cancelled => return,
        }

        let mut notices = Vec::new();
        let started = {
            let mut table = self.lock_requests();
            match table.get_mut(token) {
                Some(state) if state.phase.can_transition_to(RequestPhase::DecodeRunning) => {
                    state.advance(RequestPhase::DecodeRunning);
                    notices.extend(Self::phase_notice(state));
                    Some((
                        state.bytes.take(),
                        state.target,
                        state.key.clone(),
                        state.disk_cache,
                    ))
                }
                _ => None,
            }
        };
        dispatch(notices);
        let Some((bytes, target, key, disk_cache)) = started else {
            return;
        };
        let Some(bytes) = bytes else {
            self.fail(
                token,
                RequestPhase::DecodeFailed,
                PipelineError::malformed("no bytes to decode"),
            );
            return;
        };

        match self.decoder.decode_with_retry(bytes, target, &cancel).await {
            Ok(image) => self.decode_finished(token, key, disk_cache, image).await,
            Err(e) if e.is_cancelled() => trace!("{} cancelled during decode", token),
            Err(e) => self.fail(token, RequestPhase::DecodeFailed, e),
        }
    }

    /// Store the result and deliver it if the sink still holds this request.
    ///
    /// A finished decode is cached even when its sink has been rebound or
    /// released since; only delivery is skipped. Exit-early discards it.
    ///
    /// The fetcher has normally written the encoded source to disk already,
    /// so the disk write here only lands for attached bytes or when that
    /// earlier write failed. The source bytes take precedence.
    async fn decode_finished(
        &self,
        token: RequestToken,
        key: CacheKey,
        disk_cache: bool,
        image: PixelBuffer,
    ) {
        if self.control.exit_early() {
            trace!("{} finished during exit-early; result dropped", token);
            self.cache.pool().offer(image);
            return;
        }

        let cached = self.cache.store_decoded(&key, image);
        if disk_cache {
            let disk = Arc::clone(self.cache.disk());
            let image = Arc::clone(cached.image());
            let disk_key = key.clone();
            if let Err(e) =
                tokio::task::spawn_blocking(move || disk.put_image_if_absent(&disk_key, &image))
                    .await
            {
                warn!("Disk write task failed: {}", e);
            }
        }

        let mut notices = Vec::new();
        {
            let mut table = self.lock_requests();
            let bound = table.is_bound(token);
            if let Some(mut state) = table.take(token) {
                state.advance(RequestPhase::Complete);
                match state.live_sink() {
                    Some(sink) if bound => {
                        notices.push(Notice::Phase(Arc::clone(&sink), token, RequestPhase::Complete));
                        notices.push(Notice::Delivered(Arc::clone(&sink), self.cache.display(&cached)));
                        notices.push(Notice::Unbind(sink, token));
                    }
                    _ => debug!("{} completed for a dropped sink; cached only", token),
                }
                table.recycle(state);
            } else {
                debug!("{} was rebound or released after decoding; cached only", token);
            }
        }
        dispatch(notices);
    }

    fn fail(&self, token: RequestToken, phase: RequestPhase, error: PipelineError) {
        let mut notices = Vec::new();
        {
            let mut table = self.lock_requests();
            let Some(mut state) = table.take(token) else {
                return;
            };
            warn!(
                "{} for {} failed ({}): {}",
                token,
                UrlUtils::obfuscate_credentials(&state.identifier),
                phase,
                error
            );
            state.advance(phase);
            if let Some(sink) = state.live_sink() {
                notices.push(Notice::Phase(Arc::clone(&sink), token, phase));
                notices.push(Notice::Failed(Arc::clone(&sink), token, error));
                notices.push(Notice::Unbind(sink, token));
            }
            table.recycle(state);
        }
        dispatch(notices);
    }

    fn cancel_one(&self, token: RequestToken) {
        let mut notices = Vec::new();
        {
            let mut table = self.lock_requests();
            self.cancel_locked(&mut table, token, &mut notices);
        }
        dispatch(notices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskFormat;
    use crate::decoder::pixels::PixelFormat;
    use crate::decoder::sampling::TargetSize;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Never completes a transfer until cancelled
    struct StalledSource;

    #[async_trait]
    impl ImageSource for StalledSource {
        async fn fetch(&self, _identifier: &str, cancel: &CancellationToken) -> PipelineResult<Bytes> {
            cancel.cancelled().await;
            Err(PipelineError::Cancelled)
        }
    }

    struct CountingSink {
        id: SinkId,
        delivered: AtomicUsize,
    }

    impl ImageSink for CountingSink {
        fn sink_id(&self) -> SinkId {
            self.id
        }

        fn on_delivered(&self, _image: DisplayLease) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pipeline(dir: &TempDir) -> ImagePipeline {
        let mut config = Config::default();
        config.memory.max_size = Some(8 * 1024 * 1024);
        config.disk.directory = dir.path().join("image-cache");
        config.disk.format = DiskFormat::Raw;
        let cache = Arc::new(ImageCache::new(&config));
        ImagePipeline::new(&config, cache, Arc::new(StalledSource)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_decode_finished_after_rebind_is_cached_not_delivered() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let counting = Arc::new(CountingSink {
            id: SinkId::next(),
            delivered: AtomicUsize::new(0),
        });
        let sink: Arc<dyn ImageSink> = counting.clone();

        let RequestOutcome::Queued(first) =
            pipeline.request(&sink, ImageRequest::new("http://img/a.png", TargetSize::unbounded()))
        else {
            panic!("expected a queued request");
        };
        let second =
            pipeline.request(&sink, ImageRequest::new("http://img/b.png", TargetSize::unbounded()));
        assert!(matches!(second, RequestOutcome::Queued(_)));

        let key = pipeline.cache().key_for("http://img/a.png");
        let image = PixelBuffer::allocate(4, 4, PixelFormat::Rgb8).unwrap();
        pipeline
            .inner
            .decode_finished(first, key.clone(), false, image)
            .await;

        assert!(pipeline.cache().memory().unwrap().contains(&key));
        assert_eq!(counting.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.in_flight(), 1);

        pipeline.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_decode_finished_during_exit_early_is_dropped() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        pipeline.set_exit_early(true);

        let key = pipeline.cache().key_for("http://img/a.png");
        let image = PixelBuffer::allocate(4, 4, PixelFormat::Rgb8).unwrap();
        pipeline
            .inner
            .decode_finished(RequestToken::from_raw(1), key.clone(), false, image)
            .await;

        assert!(!pipeline.cache().memory().unwrap().contains(&key));
        pipeline.shutdown().await;
    }
}
