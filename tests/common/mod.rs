#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use photo_pipeline::cache::memory::DisplayLease;
use photo_pipeline::config::{Config, DiskFormat};
use photo_pipeline::errors::{ErrorKind, PipelineError, PipelineResult};
use photo_pipeline::fetcher::ImageSource;
use photo_pipeline::pipeline::phase::RequestPhase;
use photo_pipeline::{ImageSink, RequestToken, SinkId};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 200]));
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Small, deterministic configuration rooted in `dir`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.memory.max_size = Some(8 * 1024 * 1024);
    config.disk.directory = dir.join("image-cache");
    config.disk.format = DiskFormat::Raw;
    config.disk.max_size = 1024 * 1024;
    config.pipeline.download_workers = 2;
    config.pipeline.decode_workers = 2;
    config.decoder.retry_delay = Duration::from_millis(1);
    config
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Bind(RequestToken),
    Phase(RequestToken, RequestPhase),
    Delivered { width: u32, height: u32 },
    Failed(RequestToken, ErrorKind),
    Unbind(RequestToken),
}

/// Records every callback and keeps delivered leases alive like a view would
pub struct RecordingSink {
    id: SinkId,
    events: Mutex<Vec<SinkEvent>>,
    leases: Mutex<Vec<DisplayLease>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SinkId::next(),
            events: Mutex::new(Vec::new()),
            leases: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn deliveries(&self) -> Vec<(u32, u32)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Delivered { width, height } => Some((width, height)),
                _ => None,
            })
            .collect()
    }

    pub fn phases(&self) -> Vec<RequestPhase> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Phase(_, phase) => Some(phase),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<ErrorKind> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Failed(_, kind) => Some(kind),
                _ => None,
            })
            .collect()
    }

    pub fn clear_leases(&self) {
        self.leases.lock().unwrap().clear();
    }

    fn push(&self, event: SinkEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ImageSink for RecordingSink {
    fn sink_id(&self) -> SinkId {
        self.id
    }

    fn bind(&self, token: RequestToken) {
        self.push(SinkEvent::Bind(token));
    }

    fn on_state_changed(&self, token: RequestToken, phase: RequestPhase) {
        self.push(SinkEvent::Phase(token, phase));
    }

    fn on_delivered(&self, image: DisplayLease) {
        self.push(SinkEvent::Delivered {
            width: image.width(),
            height: image.height(),
        });
        self.leases.lock().unwrap().push(image);
    }

    fn on_failed(&self, token: RequestToken, error: &PipelineError) {
        self.push(SinkEvent::Failed(token, error.kind()));
    }

    fn unbind(&self, token: RequestToken) {
        self.push(SinkEvent::Unbind(token));
    }
}

pub fn as_sink(sink: &Arc<RecordingSink>) -> Arc<dyn ImageSink> {
    Arc::clone(sink) as Arc<dyn ImageSink>
}

struct Script {
    body: Bytes,
    gate: Option<Arc<Notify>>,
    ignore_cancel: bool,
}

/// In-memory image source with per-identifier gates and call counters
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, Script>>,
    started: Mutex<HashMap<String, usize>>,
    finished: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `body` for `identifier` immediately
    pub fn serve(&self, identifier: &str, body: Vec<u8>) {
        self.insert(identifier, body, None, false);
    }

    /// Serve `body` once the returned gate is notified
    pub fn serve_gated(&self, identifier: &str, body: Vec<u8>) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.insert(identifier, body, Some(Arc::clone(&gate)), false);
        gate
    }

    /// Like `serve_gated`, but the transfer finishes even after cancellation
    pub fn serve_gated_uncancellable(&self, identifier: &str, body: Vec<u8>) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.insert(identifier, body, Some(Arc::clone(&gate)), true);
        gate
    }

    fn insert(&self, identifier: &str, body: Vec<u8>, gate: Option<Arc<Notify>>, ignore_cancel: bool) {
        self.scripts.lock().unwrap().insert(
            identifier.to_string(),
            Script {
                body: Bytes::from(body),
                gate,
                ignore_cancel,
            },
        );
    }

    pub fn fetches(&self, identifier: &str) -> usize {
        self.started.lock().unwrap().get(identifier).copied().unwrap_or(0)
    }

    /// Fetches that ran to completion, successfully or not
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for ScriptedSource {
    async fn fetch(&self, identifier: &str, cancel: &CancellationToken) -> PipelineResult<Bytes> {
        *self
            .started
            .lock()
            .unwrap()
            .entry(identifier.to_string())
            .or_default() += 1;

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(identifier)
            .map(|s| (s.body.clone(), s.gate.clone(), s.ignore_cancel));

        let result = match script {
            None => Err(PipelineError::HttpStatus {
                status: 404,
                url: identifier.to_string(),
            }),
            Some((body, None, _)) => Ok(body),
            Some((body, Some(gate), true)) => {
                gate.notified().await;
                Ok(body)
            }
            Some((body, Some(gate), false)) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(PipelineError::Cancelled),
                    _ = gate.notified() => Ok(body),
                }
            }
        };
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}
