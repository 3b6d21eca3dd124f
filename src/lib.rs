pub mod cache;
pub mod config;
pub mod decoder;
pub mod errors;
pub mod fetcher;
pub mod listing;
pub mod pipeline;
pub mod utils;

pub use cache::ImageCache;
pub use config::Config;
pub use decoder::sampling::{TargetSize, compute_downsample};
pub use errors::{PipelineError, PipelineResult};
pub use pipeline::{ImagePipeline, ImageRequest, ImageSink, RequestOutcome, RequestToken, SinkId};
