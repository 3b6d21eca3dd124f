use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use photo_pipeline::{
    Config, ImagePipeline, ImageRequest, ImageSink, PipelineError, RequestOutcome, RequestToken,
    SinkId, TargetSize,
    cache::memory::DisplayLease,
    fetcher::HttpImageSource,
    listing::fetch_listing,
    utils::{UrlUtils, format_memory},
};

#[derive(Parser)]
#[command(name = "photo-pipeline")]
#[command(version)]
#[command(about = "Fetch, decode and cache remote images")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and decode images
    Fetch {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Target width in pixels
        #[arg(long)]
        width: Option<u32>,

        /// Target height in pixels
        #[arg(long)]
        height: Option<u32>,
    },
    /// Fetch a JSON listing and run every image in it through the pipeline
    Listing {
        url: String,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,
    },
    /// Clear the memory and disk caches
    Clear,
}

enum Report {
    Delivered(String, DisplayLease),
    Failed(String, String),
}

/// Stands in for one image view: reports the first result for its URL
struct ReportingSink {
    id: SinkId,
    identifier: String,
    reports: mpsc::UnboundedSender<Report>,
}

impl ImageSink for ReportingSink {
    fn sink_id(&self) -> SinkId {
        self.id
    }

    fn on_delivered(&self, image: DisplayLease) {
        let _ = self
            .reports
            .send(Report::Delivered(self.identifier.clone(), image));
    }

    fn on_failed(&self, _token: RequestToken, error: &PipelineError) {
        let _ = self
            .reports
            .send(Report::Failed(self.identifier.clone(), error.to_string()));
    }
}

fn target_size(width: Option<u32>, height: Option<u32>) -> TargetSize {
    match (width, height) {
        (None, None) => TargetSize::unbounded(),
        (w, h) => TargetSize::new(w.or(h).unwrap_or(u32::MAX), h.or(w).unwrap_or(u32::MAX)),
    }
}

async fn run_images(pipeline: &ImagePipeline, urls: Vec<String>, target: TargetSize) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sinks: Vec<Arc<dyn ImageSink>> = Vec::with_capacity(urls.len());
    let mut expected = 0usize;

    for url in urls {
        let sink: Arc<dyn ImageSink> = Arc::new(ReportingSink {
            id: SinkId::next(),
            identifier: url.clone(),
            reports: tx.clone(),
        });
        match pipeline.request(&sink, ImageRequest::new(url.clone(), target)) {
            RequestOutcome::Skipped => warn!("Skipped {}", UrlUtils::obfuscate_credentials(&url)),
            _ => expected += 1,
        }
        sinks.push(sink);
    }
    drop(tx);

    for _ in 0..expected {
        match rx.recv().await {
            Some(Report::Delivered(url, image)) => println!(
                "ok    {}x{} {:?} {} {}",
                image.width(),
                image.height(),
                image.format(),
                format_memory(image.byte_len() as u64),
                UrlUtils::obfuscate_credentials(&url)
            ),
            Some(Report::Failed(url, error)) => {
                println!("fail  {} {}", UrlUtils::obfuscate_credentials(&url), error)
            }
            None => break,
        }
    }
    drop(sinks);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with specified level
    let log_filter = format!("photo_pipeline={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting photo-pipeline v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    let pipeline = ImagePipeline::from_config(&config)?;

    match cli.command {
        Commands::Fetch { urls, width, height } => {
            run_images(&pipeline, urls, target_size(width, height)).await;
        }
        Commands::Listing { url, width, height } => {
            let source = HttpImageSource::new(&config.http)?;
            let urls = fetch_listing(source.client(), &url).await?;
            info!("Listing returned {} images", urls.len());
            run_images(&pipeline, urls, target_size(width, height)).await;
        }
        Commands::Clear => {
            pipeline.clear_cache().await;
            println!("Cleared cache at {}", config.disk.directory.display());
        }
    }

    pipeline.shutdown().await;
    Ok(())
}
